//! Message transport abstraction.
//!
//! This module provides the [`MessageBus`] trait every handler group talks to.
//! Commands and events share the transport; only their topic namespace differs
//! (see [`message`](crate::message)).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Domain write tx  │──── outbox row (same transaction)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Outbox forwarder │◄─── publish, then mark forwarded
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   MessageBus     │◄─── At-least-once delivery
//! └────────┬─────────┘
//!          │  one consumer group per handler
//!     ┌────┴─────┬──────────┐
//!     ▼          ▼          ▼
//! ┌───────┐ ┌─────────┐ ┌────────┐
//! │ Saga  │ │ Command │ │  Read  │
//! │       │ │ handler │ │ model  │
//! └───────┘ └─────────┘ └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message may be delivered more than once
//! - **Consumer groups**: every handler has its own cursor, so a slow or
//!   failing handler never blocks another
//! - **Acknowledge after handling**: a [`Delivery`] is acknowledged only once the
//!   handler is done with it; an unacknowledged delivery is redelivered
//!
//! # Implementations
//!
//! - `InMemoryBus` in `tickets-testing` for tests
//! - `RedpandaBus` in `tickets-redpanda` for production (Kafka-compatible)

use crate::message::SerializedMessage;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during transport operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the transport
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to encode a message
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl From<crate::message::MessageError> for BusError {
    fn from(error: crate::message::MessageError) -> Self {
        match error {
            crate::message::MessageError::Serialization { .. } => {
                Self::SerializationFailed(error.to_string())
            },
            _ => Self::DeserializationFailed(error.to_string()),
        }
    }
}

/// A message handed to a subscriber, together with its acknowledgement.
///
/// Dropping a delivery without calling [`Delivery::ack`] tells the transport the
/// message was not processed; it will be delivered again.
#[derive(Debug)]
pub struct Delivery {
    /// Topic the message arrived on
    pub topic: String,
    /// The message
    pub message: SerializedMessage,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// A delivery whose transport needs no acknowledgement.
    #[must_use]
    pub const fn new(topic: String, message: SerializedMessage) -> Self {
        Self {
            topic,
            message,
            ack: None,
        }
    }

    /// A delivery that signals `ack` once processed.
    #[must_use]
    pub const fn with_ack(
        topic: String,
        message: SerializedMessage,
        ack: oneshot::Sender<()>,
    ) -> Self {
        Self {
            topic,
            message,
            ack: Some(ack),
        }
    }

    /// Marks the message as processed.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            // The transport may already have moved on after a rebalance.
            let _ = ack.send(());
        }
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Trait for message transports.
///
/// # Consumer Groups
///
/// Every subscription names its consumer group. Each group receives its own
/// copy of every message on the subscribed topics and tracks its own offset.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be used as `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the transport rejects the message.
    fn publish(
        &self,
        topic: &str,
        message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to topics as `consumer_group`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription cannot be created.
    fn subscribe(
        &self,
        topics: &[&str],
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>>;
}
