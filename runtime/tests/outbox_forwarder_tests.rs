//! Integration tests for the outbox forwarder.
//!
//! The in-memory outbox can fail `mark_forwarded` on demand, which stands in
//! for a crash between publishing and marking.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use std::sync::Arc;
use std::time::Duration;
use tickets_core::message::{Metadata, SerializedMessage};
use tickets_core::outbox::OutboxSource;
use tickets_runtime::OutboxForwarder;
use tickets_testing::helpers::eventually;
use tickets_testing::{InMemoryBus, InMemoryOutbox};
use tokio::sync::broadcast;

fn message(name: &str) -> SerializedMessage {
    SerializedMessage::new(name.to_string(), serde_json::json!({ "name": name }), Metadata::new())
}

fn forwarder(outbox: &InMemoryOutbox, bus: &InMemoryBus) -> OutboxForwarder {
    OutboxForwarder::new(Arc::new(outbox.clone()), Arc::new(bus.clone()))
        .with_poll_interval(Duration::from_millis(5))
        .with_batch_size(10)
}

#[tokio::test]
async fn forwards_pending_rows_in_commit_order() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    for name in ["First", "Second", "Third"] {
        outbox.enqueue(format!("events.{name}"), message(name));
    }

    let forwarded = forwarder(&outbox, &bus).forward_pending().await.unwrap();

    assert_eq!(forwarded, 3);
    assert_eq!(bus.published_names(), vec!["First", "Second", "Third"]);
    assert_eq!(outbox.pending_count(), 0);
}

#[tokio::test]
async fn publish_failure_keeps_the_row_and_everything_after_it() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    outbox.enqueue("events.First", message("First"));
    outbox.enqueue("events.Second", message("Second"));
    bus.fail_next_publishes(1);

    let forwarder = forwarder(&outbox, &bus);
    assert_eq!(forwarder.forward_pending().await.unwrap(), 0);
    assert_eq!(outbox.pending_count(), 2);
    assert!(bus.published().is_empty());

    assert_eq!(forwarder.forward_pending().await.unwrap(), 2);
    assert_eq!(bus.published_names(), vec!["First", "Second"]);
}

#[tokio::test]
async fn crash_between_publish_and_mark_redelivers_instead_of_losing() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    outbox.enqueue("events.BookingMade_v1", message("BookingMade_v1"));
    outbox.fail_next_marks(1);

    let forwarder = forwarder(&outbox, &bus);
    assert!(forwarder.forward_pending().await.is_err());
    assert_eq!(bus.published().len(), 1);
    assert_eq!(outbox.pending_count(), 1);

    // Restarted forwarder picks the row up again.
    assert_eq!(forwarder.forward_pending().await.unwrap(), 1);
    assert_eq!(bus.published().len(), 2);
    assert_eq!(outbox.pending_count(), 0);
    assert!(outbox.fetch_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn run_loop_forwards_rows_written_later_and_stops_on_shutdown() {
    let outbox = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let (shutdown, _) = broadcast::channel(1);

    let handle = forwarder(&outbox, &bus).spawn(shutdown.subscribe());

    tokio::time::sleep(Duration::from_millis(20)).await;
    outbox.enqueue("events.Late", message("Late"));

    assert!(eventually(Duration::from_secs(2), || async { bus.published().len() == 1 }).await);

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("forwarder stopped")
        .unwrap();
}
