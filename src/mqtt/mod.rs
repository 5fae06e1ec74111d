use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Capacity of rumqttc's request queue.
const REQUEST_CAPACITY: usize = 10;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Pause before polling again after the event loop reports an error.
const RETRY_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One inbound PUBLISH, as handed to the ingestion handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Handle to the running broker subscription.
pub struct Subscriber {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Connect to the broker, subscribe to `config.topic` and forward every
/// received message into `tx`.
///
/// Fails if the broker refuses or cannot be reached before the first CONNACK.
/// After that, connection errors are logged and the event loop keeps
/// reconnecting; the subscription is re-issued on every CONNACK.
pub async fn subscribe(config: &Config, tx: mpsc::Sender<Message>) -> Result<Subscriber> {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.mqtt_server.host.clone(),
        config.mqtt_server.port,
    );
    options.set_keep_alive(KEEP_ALIVE);
    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    wait_for_connack(&mut eventloop)
        .await
        .with_context(|| format!("failed to connect to MQTT broker {}", config.mqtt_server))?;
    info!(broker = %config.mqtt_server, "Connected to MQTT broker");

    client
        .try_subscribe(config.topic.as_str(), QoS::AtMostOnce)
        .with_context(|| format!("failed to subscribe to {:?}", config.topic))?;
    info!(topic = %config.topic, "Subscribed");

    let task = tokio::spawn(forward(eventloop, client.clone(), config.topic.clone(), tx));

    Ok(Subscriber { client, task })
}

impl Subscriber {
    /// Send DISCONNECT and stop the event loop task.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to request MQTT disconnect");
        }

        let abort = self.task.abort_handle();
        if time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            abort.abort();
        }
        info!("Disconnected from MQTT broker");
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Poll the event loop until DISCONNECT is sent or the receiver goes away.
async fn forward(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::Sender<Message>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let message = Message {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                };
                if tx.send(message).await.is_err() {
                    debug!("Message receiver dropped; stopping MQTT event loop");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                    warn!(topic = %topic, error = %e, "Failed to re-subscribe");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error; retrying in {}s", RETRY_DELAY.as_secs());
                time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
