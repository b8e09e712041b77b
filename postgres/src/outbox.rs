//! `PostgreSQL` outbox.
//!
//! Writers call [`PostgresOutbox::enqueue`] with the connection of their own
//! transaction, so the outbox row commits or rolls back with the domain
//! change. [`PostgresOutbox`] is also the [`OutboxSource`] the forwarder reads.
//!
//! ```sql
//! CREATE TABLE outbox_messages (
//!     position     BIGSERIAL PRIMARY KEY,
//!     id           UUID NOT NULL UNIQUE,
//!     topic        TEXT NOT NULL,
//!     name         TEXT NOT NULL,
//!     payload      JSONB NOT NULL,
//!     metadata     JSONB NOT NULL,
//!     committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     forwarded_at TIMESTAMPTZ
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tickets_core::message::{Event, MessageError, Metadata, SerializedMessage, event_topic};
use tickets_core::outbox::{OutboxError, OutboxMessage, OutboxSource};
use uuid::Uuid;

/// Errors writing to the outbox.
#[derive(Error, Debug)]
pub enum EnqueueError {
    /// The message could not be serialized
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The insert failed
    #[error("Outbox insert failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outbox stored in the `outbox_messages` table.
#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Creates an outbox reader over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a pending row using the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns the database error if the insert fails.
    pub async fn enqueue(
        conn: &mut PgConnection,
        topic: &str,
        message: &SerializedMessage,
    ) -> Result<Uuid, EnqueueError> {
        let id = Uuid::new_v4();
        let metadata = serde_json::to_value(&message.metadata).map_err(|e| {
            MessageError::Serialization {
                name: message.name.clone(),
                reason: e.to_string(),
            }
        })?;

        sqlx::query(
            r"
            INSERT INTO outbox_messages (id, topic, name, payload, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(id)
        .bind(topic)
        .bind(&message.name)
        .bind(&message.payload)
        .bind(metadata)
        .execute(conn)
        .await?;

        tracing::debug!(outbox_id = %id, topic, message = %message, "Enqueued outbox message");
        Ok(id)
    }

    /// Serializes `event` and inserts it using the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] if serialization or the insert fails.
    pub async fn enqueue_event<E: Event>(
        conn: &mut PgConnection,
        event: &E,
    ) -> Result<Uuid, EnqueueError> {
        let message = SerializedMessage::from_message(event)?;
        Self::enqueue(conn, &event_topic::<E>(), &message).await
    }

    fn row_to_message(row: &PgRow) -> Result<OutboxMessage, OutboxError> {
        let storage = |e: sqlx::Error| OutboxError::Storage(e.to_string());

        let id: Uuid = row.try_get("id").map_err(storage)?;
        let metadata: serde_json::Value = row.try_get("metadata").map_err(storage)?;
        let metadata: Metadata =
            serde_json::from_value(metadata).map_err(|e| OutboxError::Corrupt {
                id,
                reason: e.to_string(),
            })?;
        let committed_at: DateTime<Utc> = row.try_get("committed_at").map_err(storage)?;

        Ok(OutboxMessage {
            id,
            topic: row.try_get("topic").map_err(storage)?,
            message: SerializedMessage::new(
                row.try_get("name").map_err(storage)?,
                row.try_get("payload").map_err(storage)?,
                metadata,
            ),
            committed_at,
        })
    }
}

impl OutboxSource for PostgresOutbox {
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query(
                r"
                SELECT id, topic, name, payload, metadata, committed_at
                FROM outbox_messages
                WHERE forwarded_at IS NULL
                ORDER BY position ASC
                LIMIT $1
                ",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;

            rows.iter().map(Self::row_to_message).collect()
        })
    }

    fn mark_forwarded(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox_messages SET forwarded_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(())
        })
    }
}
