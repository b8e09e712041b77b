//! In-memory message transport.
//!
//! [`InMemoryBus`] keeps a log per topic and a cursor per consumer group, like
//! a Kafka-compatible broker would:
//!
//! - every consumer group gets its own copy of each message
//! - a group subscribing late first receives what it missed
//! - [`InMemoryBus::with_redelivery`] delivers every message twice, to exercise
//!   idempotent handlers
//! - [`InMemoryBus::fail_next_publishes`] makes the next publishes fail

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tickets_core::event_bus::{BusError, Delivery, DeliveryStream, MessageBus};
use tickets_core::message::SerializedMessage;
use tokio::sync::mpsc;

#[derive(Default)]
struct GroupCursor {
    delivered: usize,
    sender: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<SerializedMessage>>,
    groups: HashMap<(String, String), GroupCursor>,
    history: Vec<(String, SerializedMessage)>,
}

/// In-memory [`MessageBus`] with consumer-group semantics.
///
/// # Example
///
/// ```
/// use tickets_testing::InMemoryBus;
///
/// let bus = InMemoryBus::new();
/// assert!(bus.published().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    copies: usize,
    failing_publishes: Arc<AtomicUsize>,
}

impl InMemoryBus {
    /// Creates an empty bus delivering each message once per group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            copies: 1,
            ..Self::default()
        }
    }

    /// Creates an empty bus delivering each message twice per group.
    #[must_use]
    pub fn with_redelivery() -> Self {
        Self {
            copies: 2,
            ..Self::default()
        }
    }

    /// Makes the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Every message published so far, with its topic, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedMessage)> {
        self.state.lock().unwrap().history.clone()
    }

    /// Messages published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<SerializedMessage> {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of every message published so far, in publish order.
    #[must_use]
    pub fn published_names(&self) -> Vec<String> {
        self.published().into_iter().map(|(_, m)| m.name).collect()
    }

    fn take_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn send(&self, cursor: &mut GroupCursor, topic: &str, message: &SerializedMessage) {
        let Some(sender) = &cursor.sender else {
            return;
        };
        let mut sent = true;
        for _ in 0..self.copies.max(1) {
            let delivery = Delivery::new(topic.to_string(), message.clone());
            sent &= sender.send(delivery).is_ok();
        }
        if sent {
            cursor.delivered += 1;
        } else {
            cursor.sender = None;
        }
    }
}

impl MessageBus for InMemoryBus {
    fn publish(
        &self,
        topic: &str,
        message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        if self.take_failure() {
            let error = BusError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            };
            return Box::pin(std::future::ready(Err(error)));
        }

        let mut state = self.state.lock().unwrap();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(message.clone());
        state.history.push((topic.to_string(), message.clone()));

        let BusState { groups, .. } = &mut *state;
        for ((group_topic, _), cursor) in groups.iter_mut() {
            if group_topic == topic && cursor.sender.is_some() {
                self.send(cursor, topic, message);
            }
        }

        Box::pin(std::future::ready(Ok(())))
    }

    fn subscribe(
        &self,
        topics: &[&str],
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        {
            let mut state = self.state.lock().unwrap();
            let BusState { topics: logs, groups, .. } = &mut *state;

            for topic in topics {
                let cursor = groups
                    .entry(((*topic).to_string(), consumer_group.to_string()))
                    .or_default();
                cursor.sender = Some(sender.clone());

                let backlog = logs
                    .get(*topic)
                    .map(|log| log[cursor.delivered.min(log.len())..].to_vec())
                    .unwrap_or_default();
                for message in &backlog {
                    self.send(cursor, topic, message);
                }
            }
        }

        let stream = async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                yield Ok::<_, BusError>(delivery);
            }
        };

        Box::pin(std::future::ready(Ok(Box::pin(stream) as DeliveryStream)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::StreamExt;
    use tickets_core::message::Metadata;

    fn message(name: &str) -> SerializedMessage {
        SerializedMessage::new(name.to_string(), serde_json::json!({}), Metadata::new())
    }

    #[tokio::test]
    async fn each_group_gets_its_own_copy() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe(&["events.A"], "first").await.expect("subscribe");
        let mut second = bus.subscribe(&["events.A"], "second").await.expect("subscribe");

        bus.publish("events.A", &message("A")).await.expect("publish");

        let a = first.next().await.expect("first delivery").expect("ok");
        let b = second.next().await.expect("second delivery").expect("ok");
        assert_eq!(a.message.name, "A");
        assert_eq!(b.message.name, "A");
    }

    #[tokio::test]
    async fn late_group_receives_backlog() {
        let bus = InMemoryBus::new();
        bus.publish("events.A", &message("A")).await.expect("publish");

        let mut late = bus.subscribe(&["events.A"], "late").await.expect("subscribe");

        let delivery = late.next().await.expect("backlog").expect("ok");
        assert_eq!(delivery.message.name, "A");
    }

    #[tokio::test]
    async fn redelivery_mode_duplicates_messages() {
        let bus = InMemoryBus::with_redelivery();
        let mut stream = bus.subscribe(&["events.A"], "group").await.expect("subscribe");

        bus.publish("events.A", &message("A")).await.expect("publish");

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish("events.A", &message("A")).await.is_err());
        assert!(bus.publish("events.A", &message("A")).await.is_ok());
        assert_eq!(bus.published_names(), vec!["A".to_string()]);
    }
}
