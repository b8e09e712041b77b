//! Transactional outbox types.
//!
//! A writer inserts an [`OutboxMessage`] in the same transaction as the domain
//! change it announces, so the row exists if and only if the change committed.
//! A forwarder later reads pending rows through [`OutboxSource`], publishes
//! them and marks them forwarded.

use crate::message::SerializedMessage;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from an outbox store.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// The store could not be read or written
    #[error("Outbox storage error: {0}")]
    Storage(String),

    /// A stored row could not be decoded
    #[error("Corrupt outbox row {id}: {reason}")]
    Corrupt {
        /// Row id
        id: Uuid,
        /// What was wrong with it
        reason: String,
    },
}

/// A message waiting to be forwarded.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxMessage {
    /// Row id
    pub id: Uuid,
    /// Topic to publish to
    pub topic: String,
    /// The envelope, metadata included
    pub message: SerializedMessage,
    /// When the writing transaction committed
    pub committed_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// A new pending row for `message` on `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>, message: SerializedMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            message,
            committed_at: Utc::now(),
        }
    }
}

/// Read side of an outbox, used by the forwarder.
pub trait OutboxSource: Send + Sync {
    /// Up to `limit` unforwarded rows, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the store is unavailable.
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>>;

    /// Marks a row as forwarded so it is not returned again.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the store is unavailable.
    fn mark_forwarded(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;
}
