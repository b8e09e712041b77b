//! Dead Letter Queue (DLQ) for messages whose handler gave up.
//!
//! Provides persistent storage and management of messages that failed
//! processing after exhausting retries, or failed permanently. Operators list
//! pending entries, fix the cause, then mark them resolved or discarded.
//!
//! ```sql
//! CREATE TABLE failed_messages (
//!     id               BIGSERIAL PRIMARY KEY,
//!     handler          TEXT NOT NULL,
//!     consumer_group   TEXT NOT NULL,
//!     topic            TEXT NOT NULL,
//!     message_name     TEXT NOT NULL,
//!     payload          JSONB NOT NULL,
//!     metadata         JSONB NOT NULL,
//!     error_message    TEXT NOT NULL,
//!     attempts         INTEGER NOT NULL,
//!     failed_at        TIMESTAMPTZ NOT NULL,
//!     status           TEXT NOT NULL DEFAULT 'pending',
//!     resolved_at      TIMESTAMPTZ,
//!     resolved_by      TEXT,
//!     resolution_notes TEXT
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use tickets_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use tickets_core::message::{Metadata, SerializedMessage};

/// Status of an entry in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// The underlying problem was fixed and the message handled
    Resolved,
    /// Permanently given up on
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A stored dead letter with its review state.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// The failure as recorded by the processor
    pub entry: DeadLetter,
    /// Current review status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use tickets_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// if let Some(first) = pending.first() {
///     dlq.mark_discarded(first.id, "duplicate of an already refunded ticket").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

fn storage(error: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(error.to_string())
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead letter and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, entry: &DeadLetter) -> Result<i64, DeadLetterError> {
        let metadata = serde_json::to_value(&entry.message.metadata)
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;
        let attempts = i32::try_from(entry.attempts).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                handler, consumer_group, topic, message_name, payload, metadata,
                error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(&entry.handler)
        .bind(&entry.consumer_group)
        .bind(&entry.topic)
        .bind(&entry.message.name)
        .bind(&entry.message.payload)
        .bind(metadata)
        .bind(&entry.error)
        .bind(attempts)
        .bind(entry.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        tracing::warn!(
            dlq_id = id,
            handler = %entry.handler,
            message = %entry.message,
            error = %entry.error,
            attempts = entry.attempts,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("tickets_dlq_added_total", "handler" => entry.handler.clone())
            .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, DeadLetterError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, handler, consumer_group, topic, message_name, payload, metadata,
                error_message, attempts, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id, or
    /// [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT
                id, handler, consumer_group, topic, message_name, payload, metadata,
                error_message, attempts, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or(DeadLetterError::NotFound(id))?;

        Self::row_to_failed_message(&row)
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("tickets_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("tickets_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        Ok(count)
    }

    fn row_to_failed_message(row: &PgRow) -> Result<FailedMessage, DeadLetterError> {
        let metadata: serde_json::Value = row.try_get("metadata").map_err(storage)?;
        let metadata: Metadata = serde_json::from_value(metadata)
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;
        let attempts: i32 = row.try_get("attempts").map_err(storage)?;
        let status: String = row.try_get("status").map_err(storage)?;

        Ok(FailedMessage {
            id: row.try_get("id").map_err(storage)?,
            entry: DeadLetter {
                handler: row.try_get("handler").map_err(storage)?,
                consumer_group: row.try_get("consumer_group").map_err(storage)?,
                topic: row.try_get("topic").map_err(storage)?,
                message: SerializedMessage::new(
                    row.try_get("message_name").map_err(storage)?,
                    row.try_get("payload").map_err(storage)?,
                    metadata,
                ),
                error: row.try_get("error_message").map_err(storage)?,
                attempts: u32::try_from(attempts).unwrap_or_default(),
                failed_at: row.try_get("failed_at").map_err(storage)?,
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(storage)?,
            resolved_by: row.try_get("resolved_by").map_err(storage)?,
            resolution_notes: row.try_get("resolution_notes").map_err(storage)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn add(
        &self,
        entry: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.add_entry(&entry).await.map(|_| ()) })
    }
}
