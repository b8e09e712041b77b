//! Integration tests for [`RedpandaBus`] against a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - publish/subscribe round-trip of the JSON envelope
//! - commit-after-ack (an unacknowledged delivery comes back)
//! - independent consumer groups each receive every message
//!
//! # Running These Tests
//!
//! Marked `#[ignore]`: they need Docker and take a while to start Kafka.
//!
//! ```bash
//! cargo test -p tickets-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tickets_core::event_bus::{DeliveryStream, MessageBus};
use tickets_core::message::{Event, EventHeader, Message, SerializedMessage};
use tickets_redpanda::RedpandaBus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeatHeld {
    header: EventHeader,
    seat: u32,
}

impl Message for SeatHeld {
    const NAME: &'static str = "SeatHeld_v1";

    fn header(&self) -> &EventHeader {
        &self.header
    }
}

impl Event for SeatHeld {}

fn seat_held(seat: u32) -> SerializedMessage {
    SerializedMessage::from_message(&SeatHeld {
        header: EventHeader::new(),
        seat,
    })
    .expect("encode")
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Publishes until the broker accepts, which also auto-creates the topic.
async fn ready_bus(brokers: &str, topic: &str) -> RedpandaBus {
    for _ in 0..60 {
        if let Ok(bus) = RedpandaBus::builder()
            .brokers(brokers)
            .auto_offset_reset("earliest")
            .build()
        {
            if bus.publish(topic, &seat_held(0)).await.is_ok() {
                tokio::time::sleep(Duration::from_secs(2)).await;
                return bus;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("Kafka failed to become ready");
}

/// Receives deliveries, acknowledging each, until `seat` shows up.
async fn receive_seat(stream: &mut DeliveryStream, seat: u32) -> SeatHeld {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("delivery");
            let event: SeatHeld = delivery.message.decode().expect("decode");
            delivery.ack();
            if event.seat == seat {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = ready_bus(&brokers, "events.SeatHeld_v1").await;

    let mut stream = bus
        .subscribe(&["events.SeatHeld_v1"], "svc-test.events.round_trip")
        .await
        .expect("subscribe");

    let message = seat_held(7);
    bus.publish("events.SeatHeld_v1", &message).await.expect("publish");

    let received = receive_seat(&mut stream, 7).await;
    assert_eq!(message.decode::<SeatHeld>().expect("decode"), received);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_is_redelivered() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = ready_bus(&brokers, "events.SeatHeld_v1").await;
    let group = "svc-test.events.redelivery";

    bus.publish("events.SeatHeld_v1", &seat_held(1)).await.expect("publish");

    {
        let mut stream = bus
            .subscribe(&["events.SeatHeld_v1"], group)
            .await
            .expect("subscribe");
        // Ack the warmup, then drop seat 1 without acknowledging it.
        let first = stream.next().await.expect("stream").expect("delivery");
        first.ack();
        let second = stream.next().await.expect("stream").expect("delivery");
        assert_eq!(second.message.decode::<SeatHeld>().expect("decode").seat, 1);
        drop(second);
    }

    // Let the group rebalance after the first consumer left.
    tokio::time::sleep(Duration::from_secs(8)).await;

    let mut stream = bus
        .subscribe(&["events.SeatHeld_v1"], group)
        .await
        .expect("resubscribe");
    let redelivered = receive_seat(&mut stream, 1).await;
    assert_eq!(redelivered.seat, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn every_consumer_group_receives_every_message() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = ready_bus(&brokers, "events.SeatHeld_v1").await;

    let mut receipts = bus
        .subscribe(&["events.SeatHeld_v1"], "svc-test.events.issue_receipt")
        .await
        .expect("subscribe receipts");
    let mut tracker = bus
        .subscribe(&["events.SeatHeld_v1"], "svc-test.events.append_to_tracker")
        .await
        .expect("subscribe tracker");

    bus.publish("events.SeatHeld_v1", &seat_held(42)).await.expect("publish");

    assert_eq!(receive_seat(&mut receipts, 42).await.seat, 42);
    assert_eq!(receive_seat(&mut tracker, 42).await.seat, 42);
}
