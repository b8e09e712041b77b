//! Append-only archive of every external event.
//!
//! The data lake is the replayable record the ops read model is rebuilt from.
//! Storing an event id twice is a silent no-op, so redelivered events archive
//! once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tickets_core::message::{EventHeader, SerializedMessage};
use uuid::Uuid;

/// One archived event.
#[derive(Clone, Debug, PartialEq)]
pub struct DataLakeEvent {
    /// Id from the event header
    pub event_id: Uuid,
    /// Publication time from the event header
    pub published_at: DateTime<Utc>,
    /// Wire name, schema version included
    pub event_name: String,
    /// The event as published
    pub event_payload: Value,
}

impl DataLakeEvent {
    /// Archives the event carried by `message`.
    ///
    /// # Errors
    ///
    /// Returns [`DataLakeError::MissingHeader`] if the payload has no valid
    /// event header.
    pub fn from_message(message: &SerializedMessage) -> Result<Self, DataLakeError> {
        let header: EventHeader = message
            .payload
            .get("header")
            .cloned()
            .and_then(|h| serde_json::from_value(h).ok())
            .ok_or_else(|| DataLakeError::MissingHeader(message.name.clone()))?;

        Ok(Self {
            event_id: header.id,
            published_at: header.published_at,
            event_name: message.name.clone(),
            event_payload: message.payload.clone(),
        })
    }
}

/// Data lake errors.
#[derive(Error, Debug)]
pub enum DataLakeError {
    /// The message carries no event header.
    #[error("Event {0} has no valid header")]
    MissingHeader(String),

    /// The store failed.
    #[error("Data lake storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Event archive.
#[async_trait]
pub trait DataLake: Send + Sync {
    /// Archives an event. An event id already archived is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DataLakeError::Database`] if the store fails.
    async fn store(&self, event: &DataLakeEvent) -> Result<(), DataLakeError>;

    /// Every archived event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DataLakeError::Database`] if the store fails.
    async fn find_all(&self) -> Result<Vec<DataLakeEvent>, DataLakeError>;
}

/// Data lake in the `events` table.
#[derive(Debug, Clone)]
pub struct PostgresDataLake {
    pool: PgPool,
}

impl PostgresDataLake {
    /// Creates a data lake over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataLake for PostgresDataLake {
    async fn store(&self, event: &DataLakeEvent) -> Result<(), DataLakeError> {
        sqlx::query(
            r"
            INSERT INTO events (event_id, published_at, event_name, event_payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(event.event_id)
        .bind(event.published_at)
        .bind(&event.event_name)
        .bind(&event.event_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<DataLakeEvent>, DataLakeError> {
        let rows = sqlx::query(
            "SELECT event_id, published_at, event_name, event_payload FROM events ORDER BY published_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .iter()
            .map(|row| {
                Ok(DataLakeEvent {
                    event_id: row.try_get("event_id")?,
                    published_at: row.try_get("published_at")?,
                    event_name: row.try_get("event_name")?,
                    event_payload: row.try_get("event_payload")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn archived_event_keeps_header_identity() {
        let header = EventHeader::new();
        let message = SerializedMessage::new(
            "TicketPrinted_v1".into(),
            serde_json::json!({ "header": header, "ticket_id": Uuid::new_v4(), "file_name": "x.html" }),
            Default::default(),
        );

        let event = DataLakeEvent::from_message(&message).unwrap();
        assert_eq!(event.event_id, header.id);
        assert_eq!(event.published_at, header.published_at);
        assert_eq!(event.event_name, "TicketPrinted_v1");
    }

    #[test]
    fn messages_without_header_are_rejected() {
        let message =
            SerializedMessage::new("Broken".into(), serde_json::json!({ "x": 1 }), Default::default());
        assert!(matches!(
            DataLakeEvent::from_message(&message),
            Err(DataLakeError::MissingHeader(name)) if name == "Broken"
        ));
    }
}
