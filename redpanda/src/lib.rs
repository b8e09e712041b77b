//! Redpanda transport for the tickets service.
//!
//! This crate provides [`RedpandaBus`], a [`MessageBus`] over rdkafka. Any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK).
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - every subscription names its consumer group, one per handler
//! - a message's offset is committed only after the subscriber acknowledged
//!   the [`Delivery`](tickets_core::event_bus::Delivery)
//! - a delivery dropped without acknowledgement stops the consumer without
//!   committing, so the message is delivered again on resubscribe
//! - the consumer waits for each acknowledgement before reading the next
//!   message, so a group processes a partition strictly in order
//!
//! # Wire format
//!
//! The record value is the JSON-encoded
//! [`SerializedMessage`](tickets_core::message::SerializedMessage); the key is
//! the message name.
//!
//! # Example
//!
//! ```no_run
//! use tickets_redpanda::RedpandaBus;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .auto_offset_reset("earliest")
//!     .build()?;
//! # let _ = bus;
//! # Ok(())
//! # }
//! ```

use rdkafka::Message as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tickets_core::event_bus::{BusError, Delivery, DeliveryStream, MessageBus};
use tickets_core::message::SerializedMessage;

/// Redpanda-backed [`MessageBus`].
pub struct RedpandaBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Auto offset reset policy for new consumer groups
    auto_offset_reset: String,
}

impl RedpandaBus {
    /// Create a new bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl std::fmt::Debug for RedpandaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBus")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where new consumer groups start reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so a handler deployed after messages were
    /// published still sees them.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are missing or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaBus created successfully"
        );

        Ok(RedpandaBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            auto_offset_reset,
        })
    }
}

impl MessageBus for RedpandaBus {
    fn publish(
        &self,
        topic: &str,
        message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = message.to_bytes().map_err(|e| BusError::PublishFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

            let record = FutureRecord::to(&topic)
                .payload(&payload)
                .key(message.name.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message = %message,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(BusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let consumer_group = consumer_group.to_string();
        let brokers = self.brokers.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(received) = stream.next().await {
                    let record = match received {
                        Ok(record) => record,
                        Err(e) => {
                            let err = BusError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let decoded = record
                        .payload()
                        .ok_or_else(|| BusError::DeserializationFailed("Message has no payload".to_string()))
                        .and_then(|payload| SerializedMessage::from_bytes(payload).map_err(BusError::from));

                    let message = match decoded {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::error!(
                                topic = record.topic(),
                                partition = record.partition(),
                                offset = record.offset(),
                                error = %err,
                                "Skipping undecodable record"
                            );
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            // An unreadable record would block the partition forever.
                            if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                                tracing::warn!(error = %e, "Failed to commit undecodable record");
                            }
                            continue;
                        },
                    };

                    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                    let delivery = Delivery::with_ack(record.topic().to_string(), message, ack_tx);
                    if tx.send(Ok(delivery)).await.is_err() {
                        tracing::debug!("Subscriber dropped, exiting consumer task");
                        break;
                    }

                    if ack_rx.await.is_err() {
                        tracing::debug!(
                            topic = record.topic(),
                            offset = record.offset(),
                            "Delivery dropped without ack, exiting consumer task"
                        );
                        break;
                    }

                    if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                        tracing::warn!(
                            topic = record.topic(),
                            partition = record.partition(),
                            offset = record.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
