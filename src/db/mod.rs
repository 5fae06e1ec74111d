pub mod models;

use std::future::Future;

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, warn};

use self::models::Reading;

const INSERT_READING: &str = "INSERT INTO environment (time, location, room, sensor, measurement, value) \
     VALUES (NOW(), $1, $2, $3, $4, $5)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to connect to the database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database liveness check failed: {0}")]
    Liveness(#[source] sqlx::Error),
    #[error("database reconnect failed: {0}")]
    Reconnect(#[source] sqlx::Error),
    #[error("unable to insert reading: {0}")]
    Insert(#[source] sqlx::Error),
    #[error("database connection is closed")]
    NotConnected,
}

/// Persistence operations the ingestion handler needs.
///
/// Implementations own a single connection; callers serialise access through
/// `&mut self`.
pub trait ReadingStore {
    /// Lightweight round-trip confirming the connection is usable.
    fn ping(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Close the current connection and open a fresh one.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert `reading` with a server-assigned timestamp inside a transaction.
    fn insert(&mut self, reading: &Reading) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Postgres/TimescaleDB store backed by one lazily reconnected connection.
///
/// `conn` is `None` after a reconnect attempt closed the old connection but
/// could not open a new one; every operation then fails with
/// [`StoreError::NotConnected`] until a later reconnect succeeds.
pub struct PgStore {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = database_url
            .parse::<PgConnectOptions>()
            .map_err(StoreError::Connect)?;
        Self::connect_with(options).await
    }

    pub async fn connect_with(options: PgConnectOptions) -> Result<Self, StoreError> {
        let conn = PgConnection::connect_with(&options)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self {
            options,
            conn: Some(conn),
        })
    }

    /// Gracefully close the connection, if one is open.
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close database connection");
            }
        }
    }
}

impl ReadingStore for PgStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::NotConnected)?;
        conn.ping().await.map_err(StoreError::Liveness)
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        if let Some(old) = self.conn.take() {
            // The old link is presumed dead; a failed goodbye is expected.
            if let Err(e) = old.close().await {
                debug!(error = %e, "Closing stale database connection failed");
            }
        }

        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(StoreError::Reconnect)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn insert(&mut self, reading: &Reading) -> Result<(), StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::NotConnected)?;
        let mut tx = conn.begin().await.map_err(StoreError::Insert)?;

        let result = sqlx::query(INSERT_READING)
            .bind(&reading.location)
            .bind(&reading.room)
            .bind(&reading.sensor)
            .bind(&reading.measurement)
            .bind(reading.value)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => tx.commit().await.map_err(StoreError::Insert),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback after failed insert also failed");
                }
                Err(StoreError::Insert(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
