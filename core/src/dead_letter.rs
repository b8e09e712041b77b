//! Dead letters: messages a handler gave up on.
//!
//! After the retry budget is spent, or on an error that retrying cannot fix,
//! the processor records the message here for an operator instead of dropping
//! it or retrying forever.

use crate::message::SerializedMessage;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from a dead-letter store.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The store could not be read or written
    #[error("Dead letter storage error: {0}")]
    Storage(String),

    /// No entry with that id
    #[error("Dead letter {0} not found")]
    NotFound(i64),
}

/// A message that exhausted its handler.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    /// Handler that failed
    pub handler: String,
    /// Consumer group of the handler
    pub consumer_group: String,
    /// Topic the message came from
    pub topic: String,
    /// The message itself
    pub message: SerializedMessage,
    /// Last error returned by the handler
    pub error: String,
    /// How many times the handler ran
    pub attempts: u32,
    /// When the processor gave up
    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Records a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the entry could not be stored.
    fn add(
        &self,
        entry: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
