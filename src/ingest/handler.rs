use std::future::{self, Future};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{db::ReadingStore, mqtt::Message};

use super::decoder;

/// Lifecycle of the handler's database connection.
///
/// Transitions happen only at the start of [`IngestHandler::handle`]; there
/// is no background health check. A failed reconnect leaves the state at
/// `Suspect` so the next message triggers another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Live,
    Suspect,
    Reconnecting,
}

/// Turns inbound messages into rows, one at a time.
///
/// The handler is the sole owner of its store. Delivery is serialised by
/// [`IngestHandler::run`], which awaits each `handle` call before receiving
/// the next message; feeding one handler from several tasks would need a lock
/// around the whole of `handle`.
pub struct IngestHandler<S> {
    store: S,
    state: ConnectionState,
}

impl<S: ReadingStore> IngestHandler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: ConnectionState::Live,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Consume messages until the channel closes.
    pub async fn run(&mut self, rx: &mut mpsc::Receiver<Message>) {
        self.run_until(rx, future::pending()).await;
    }

    /// Consume messages until `shutdown` resolves or the channel closes.
    ///
    /// `shutdown` is only observed between messages; a `handle` call that has
    /// started always runs to completion. Returns `true` if stopped by
    /// `shutdown`, leaving any queued messages in `rx`.
    pub async fn run_until(
        &mut self,
        rx: &mut mpsc::Receiver<Message>,
        shutdown: impl Future<Output = ()>,
    ) -> bool {
        tokio::pin!(shutdown);
        info!("Waiting for MQTT messages");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Ingestion stopping");
                    return true;
                }
                message = rx.recv() => match message {
                    Some(message) => self.handle(&message.topic, &message.payload).await,
                    None => {
                        info!("Message channel closed; ingestion stopped");
                        return false;
                    }
                },
            }
        }
    }

    /// Handle one message. Every failure is logged and the message dropped.
    pub async fn handle(&mut self, topic: &str, payload: &[u8]) {
        debug!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            "Message received"
        );

        if let Err(e) = self.store.ping().await {
            warn!(
                topic = %topic,
                previous_state = ?self.state,
                error = %e,
                "Skip message due to lost db connection"
            );
            self.state = ConnectionState::Suspect;
            // The triggering message is dropped whether or not this succeeds.
            self.reconnect().await;
            return;
        }
        self.state = ConnectionState::Live;

        let reading = match decoder::decode(topic, payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping undecodable message");
                return;
            }
        };

        match self.store.insert(&reading).await {
            Ok(()) => debug!(
                location = %reading.location,
                room = %reading.room,
                sensor = %reading.sensor,
                measurement = %reading.measurement,
                value = reading.value,
                "Reading stored"
            ),
            Err(e) => error!(topic = %topic, error = %e, "Unable to insert data"),
        }
    }

    async fn reconnect(&mut self) {
        self.state = ConnectionState::Reconnecting;
        match self.store.reconnect().await {
            Ok(()) => {
                self.state = ConnectionState::Live;
                info!("Reconnected to database");
            }
            Err(e) => {
                self.state = ConnectionState::Suspect;
                error!(error = %e, "Unable to reconnect to database");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::{models::Reading, StoreError};

    /// In-memory store whose liveness and failure modes are scripted.
    #[derive(Default)]
    struct FakeStore {
        down: bool,
        reconnect_fails: bool,
        insert_fails: bool,
        pings: usize,
        reconnects: usize,
        rows: Vec<Reading>,
    }

    impl ReadingStore for FakeStore {
        async fn ping(&mut self) -> Result<(), StoreError> {
            self.pings += 1;
            if self.down {
                Err(StoreError::NotConnected)
            } else {
                Ok(())
            }
        }

        async fn reconnect(&mut self) -> Result<(), StoreError> {
            self.reconnects += 1;
            if self.reconnect_fails {
                Err(StoreError::NotConnected)
            } else {
                self.down = false;
                Ok(())
            }
        }

        async fn insert(&mut self, reading: &Reading) -> Result<(), StoreError> {
            if self.insert_fails {
                return Err(StoreError::NotConnected);
            }
            self.rows.push(reading.clone());
            Ok(())
        }
    }

    fn handler(store: FakeStore) -> IngestHandler<FakeStore> {
        IngestHandler::new(store)
    }

    #[tokio::test]
    async fn live_database_stores_exactly_one_row() {
        let mut h = handler(FakeStore::default());
        h.handle("kitchen/main/dht22/temperature", b"21.5").await;

        assert_eq!(h.state(), ConnectionState::Live);
        let store = h.into_store();
        assert_eq!(store.pings, 1);
        assert_eq!(store.reconnects, 0);
        assert_eq!(
            store.rows,
            vec![Reading {
                location: "kitchen".into(),
                room: "main".into(),
                sensor: "dht22".into(),
                measurement: "temperature".into(),
                value: 21.5,
            }]
        );
    }

    #[tokio::test]
    async fn lost_database_drops_message_even_after_successful_reconnect() {
        let mut h = handler(FakeStore {
            down: true,
            ..Default::default()
        });
        h.handle("kitchen/main/dht22/temperature", b"21.5").await;

        assert_eq!(h.state(), ConnectionState::Live);
        let store = h.into_store();
        assert_eq!(store.reconnects, 1);
        assert!(store.rows.is_empty());
    }

    #[tokio::test]
    async fn failed_reconnect_drops_message_and_stays_suspect() {
        let mut h = handler(FakeStore {
            down: true,
            reconnect_fails: true,
            ..Default::default()
        });
        h.handle("kitchen/main/dht22/temperature", b"21.5").await;
        assert_eq!(h.state(), ConnectionState::Suspect);

        // Next message triggers another attempt.
        h.handle("kitchen/main/dht22/temperature", b"22.0").await;
        assert_eq!(h.state(), ConnectionState::Suspect);

        let store = h.into_store();
        assert_eq!(store.reconnects, 2);
        assert!(store.rows.is_empty());
    }

    #[tokio::test]
    async fn recovers_on_next_message_after_reconnect() {
        let mut h = handler(FakeStore {
            down: true,
            ..Default::default()
        });
        h.handle("a/b/c/d", b"1").await;
        h.handle("a/b/c/d", b"2").await;

        let store = h.into_store();
        assert_eq!(store.rows.len(), 1);
        assert_eq!(store.rows[0].value, 2.0);
    }

    #[tokio::test]
    async fn undecodable_messages_never_reach_the_store() {
        let mut h = handler(FakeStore::default());
        h.handle("kitchen/main/dht22", b"21.5").await;
        h.handle("kitchen/main/dht22/humidity", b"abc").await;
        h.handle("nouser", b"1").await;
        h.handle("kitchen/main/dht22/humidity", b"NaN").await;

        assert_eq!(h.state(), ConnectionState::Live);
        let store = h.into_store();
        assert_eq!(store.pings, 4);
        assert!(store.rows.is_empty());
    }

    #[tokio::test]
    async fn insert_failure_is_swallowed() {
        let mut h = handler(FakeStore {
            insert_fails: true,
            ..Default::default()
        });
        h.handle("a/b/c/d", b"1").await;
        h.handle("a/b/c/d", b"2").await;

        assert_eq!(h.state(), ConnectionState::Live);
        assert_eq!(h.into_store().pings, 2);
    }

    #[tokio::test]
    async fn run_consumes_messages_in_order_until_channel_closes() {
        let (tx, mut rx) = mpsc::channel(8);
        for (topic, payload) in [
            ("home/hall/s1/temperature", "20.0"),
            ("bad-topic", "1"),
            ("home/hall/s1/humidity", "55.5"),
        ] {
            tx.send(Message {
                topic: topic.into(),
                payload: payload.as_bytes().to_vec(),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let mut h = handler(FakeStore::default());
        h.run(&mut rx).await;

        let rows = h.into_store().rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].measurement, "temperature");
        assert_eq!(rows[1].measurement, "humidity");
        assert_eq!(rows[1].value, 55.5);
    }

    fn message(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn shutdown_leaves_queued_messages_for_draining() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(message("a/b/c/temperature", "1")).await.unwrap();
        tx.send(message("a/b/c/humidity", "2")).await.unwrap();

        let mut h = handler(FakeStore::default());
        let stopped = h.run_until(&mut rx, future::ready(())).await;
        assert!(stopped);
        assert!(h.store.rows.is_empty());

        // Intake stopped; the backlog is still stored.
        rx.close();
        h.run(&mut rx).await;
        assert_eq!(h.into_store().rows.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_intake_after_current_message() {
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(message("a/b/c/temperature", "1")).await.unwrap();

        let mut h = handler(FakeStore::default());
        {
            let shutdown = async move {
                let _ = stop_rx.await;
            };
            let run = h.run_until(&mut rx, shutdown);
            tokio::pin!(run);

            // Still running after the first message is stored.
            let pending = tokio::time::timeout(Duration::from_millis(50), &mut run).await;
            assert!(pending.is_err());

            stop_tx.send(()).unwrap();
            assert!(run.await);
        }

        tx.send(message("a/b/c/humidity", "2")).await.unwrap();
        let store = h.into_store();
        assert_eq!(store.rows.len(), 1);
        assert_eq!(store.rows[0].measurement, "temperature");
    }

    #[tokio::test]
    async fn run_until_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        drop(tx);

        let mut h = handler(FakeStore::default());
        assert!(!h.run_until(&mut rx, future::pending()).await);
    }
}
