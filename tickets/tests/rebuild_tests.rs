//! Rebuilding the ops read model from archived events, legacy schemas
//! included.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tickets::data_lake::{DataLake, DataLakeEvent};
use tickets::memory::InMemoryDatabase;
use tickets::messages::legacy::{
    BookingMadeV0, TicketBookingConfirmedV0, TicketPrintedV0, TicketReceiptIssuedV0, TicketRefundedV0,
};
use tickets::messages::{TicketBookingConfirmed, VipBundleInitialized};
use tickets::read_model::{
    OpsReadModel, RebuildError, RebuildOptions, TicketStatus, rebuild_from_data_lake,
};
use tickets::services::mocks::MockServices;
use tickets::types::{BookingId, Money, ShowId, TicketId, VipBundleId};
use tickets::{Repositories, TicketsService};
use tickets_core::message::{EventHeader, Message};
use tickets_runtime::EventBus;
use tickets_testing::helpers::eventually;
use tickets_testing::{InMemoryBus, InMemoryDeadLetters};
use tokio::sync::oneshot;

fn options() -> RebuildOptions {
    RebuildOptions {
        wait_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    }
}

fn header(published_at: DateTime<Utc>) -> EventHeader {
    EventHeader {
        published_at,
        ..EventHeader::new()
    }
}

async fn archive<T: Serialize>(lake: &InMemoryDatabase, name: &str, header: &EventHeader, event: &T) {
    lake.store(&DataLakeEvent {
        event_id: header.id,
        published_at: header.published_at,
        event_name: name.to_string(),
        event_payload: serde_json::to_value(event).unwrap(),
    })
    .await
    .unwrap();
}

fn read_model(database: &InMemoryDatabase) -> OpsReadModel {
    OpsReadModel::new(Arc::new(database.clone()), EventBus::new(Arc::new(InMemoryBus::new())))
}

/// Archives a v0 history of one booking with one ticket: booked, confirmed,
/// receipted, printed and refunded.
async fn archive_v0_history(lake: &InMemoryDatabase, start: DateTime<Utc>) -> (BookingId, TicketId) {
    let booking_id = BookingId::new();
    let ticket_id = TicketId::new();
    let minute = |n: i64| start + ChronoDuration::minutes(n);

    let booked = BookingMadeV0 {
        header: header(minute(0)),
        number_of_tickets: 1,
        booking_id,
        customer_email: "legacy@example.com".into(),
        show_id: ShowId::new(),
    };
    archive(lake, BookingMadeV0::NAME, &booked.header, &booked).await;

    let confirmed = TicketBookingConfirmedV0 {
        header: header(minute(1)),
        ticket_id,
        customer_email: "legacy@example.com".into(),
        price: Money::new("19.99", "GBP"),
        booking_id,
    };
    archive(lake, TicketBookingConfirmedV0::NAME, &confirmed.header, &confirmed).await;

    let receipt = TicketReceiptIssuedV0 {
        header: header(minute(2)),
        ticket_id,
        receipt_number: "R-legacy".into(),
        issued_at: minute(2),
    };
    archive(lake, TicketReceiptIssuedV0::NAME, &receipt.header, &receipt).await;

    let printed = TicketPrintedV0 {
        header: header(minute(3)),
        ticket_id,
        file_name: "legacy-ticket.html".into(),
    };
    archive(lake, TicketPrintedV0::NAME, &printed.header, &printed).await;

    let refunded = TicketRefundedV0 {
        header: header(minute(4)),
        ticket_id,
    };
    archive(lake, TicketRefundedV0::NAME, &refunded.header, &refunded).await;

    (booking_id, ticket_id)
}

#[tokio::test]
async fn legacy_events_are_upgraded_and_applied() {
    let database = InMemoryDatabase::new();
    let start = Utc::now() - ChronoDuration::days(30);
    let (booking_id, ticket_id) = archive_v0_history(&database, start).await;
    let model = read_model(&database);

    let report = rebuild_from_data_lake(&database, &model, &options()).await.unwrap();

    assert_eq!(report.applied, 5);
    assert_eq!(report.unresolved, 0);
    let doc = model.booking(booking_id).await.unwrap().unwrap();
    assert_eq!(doc.booked_at, start);
    let ticket = &doc.tickets[&ticket_id];
    assert_eq!(ticket.status, TicketStatus::Refunded);
    assert_eq!(ticket.price, Money::new("19.99", "GBP"));
    assert_eq!(ticket.receipt_number.as_deref(), Some("R-legacy"));
    assert_eq!(ticket.printed_file_name.as_deref(), Some("legacy-ticket.html"));
}

#[tokio::test]
async fn unknown_and_unconsumed_events_are_skipped() {
    let database = InMemoryDatabase::new();
    let start = Utc::now() - ChronoDuration::days(1);
    archive_v0_history(&database, start).await;

    let retired = header(start);
    archive(&database, "ShowRescheduled_v0", &retired, &serde_json::json!({ "header": retired })).await;
    let initialized = VipBundleInitialized {
        header: header(start),
        vip_bundle_id: VipBundleId::new(),
    };
    archive(&database, VipBundleInitialized::NAME, &initialized.header, &initialized).await;

    let report = rebuild_from_data_lake(&database, &read_model(&database), &options())
        .await
        .unwrap();

    assert_eq!(report.applied, 5);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn events_published_before_their_booking_are_deferred() {
    let database = InMemoryDatabase::new();
    let start = Utc::now() - ChronoDuration::hours(2);
    let (booking_id, ticket_id) = archive_v0_history(&database, start).await;

    // A second ticket, archived a minute before the booking it belongs to.
    let second_ticket = TicketId::new();
    let early = TicketBookingConfirmed {
        header: header(start - ChronoDuration::minutes(1)),
        ticket_id: second_ticket,
        customer_email: "legacy@example.com".into(),
        price: Money::new("19.99", "GBP"),
        booking_id,
    };
    archive(&database, TicketBookingConfirmed::NAME, &early.header, &early).await;

    let model = read_model(&database);
    let report = rebuild_from_data_lake(&database, &model, &options()).await.unwrap();

    assert_eq!(report.applied, 6);
    assert_eq!(report.unresolved, 0);
    let doc = model.booking(booking_id).await.unwrap().unwrap();
    assert_eq!(doc.tickets.len(), 2);
    assert_eq!(doc.tickets[&second_ticket].status, TicketStatus::Confirmed);
    assert_eq!(doc.tickets[&ticket_id].status, TicketStatus::Refunded);
}

#[tokio::test]
async fn orphan_events_are_reported_unresolved() {
    let database = InMemoryDatabase::new();
    let start = Utc::now();
    archive_v0_history(&database, start).await;

    let orphan = TicketRefundedV0 {
        header: header(start),
        ticket_id: TicketId::new(),
    };
    archive(&database, TicketRefundedV0::NAME, &orphan.header, &orphan).await;

    let report = rebuild_from_data_lake(&database, &read_model(&database), &options())
        .await
        .unwrap();

    assert_eq!(report.applied, 5);
    assert_eq!(report.unresolved, 1);
}

#[tokio::test]
async fn malformed_archive_entry_fails_the_rebuild() {
    let database = InMemoryDatabase::new();
    let broken = header(Utc::now());
    archive(
        &database,
        BookingMadeV0::NAME,
        &broken,
        &serde_json::json!({ "header": broken, "booking_id": "not-a-uuid" }),
    )
    .await;

    let result = rebuild_from_data_lake(&database, &read_model(&database), &options()).await;

    assert!(matches!(result, Err(RebuildError::Decode { event_id, .. }) if event_id == broken.id));
}

#[tokio::test]
async fn empty_data_lake_times_out() {
    let database = InMemoryDatabase::new();

    let result = rebuild_from_data_lake(&database, &read_model(&database), &options()).await;

    assert!(matches!(result, Err(RebuildError::Timeout(_))));
}

#[tokio::test]
async fn service_rebuilds_the_read_model_at_startup() {
    let database = InMemoryDatabase::new();
    let start = Utc::now() - ChronoDuration::days(3);
    let (booking_id, ticket_id) = archive_v0_history(&database, start).await;

    let service = TicketsService::new(
        Arc::new(InMemoryBus::new()),
        Arc::new(database.outbox()),
        Arc::new(InMemoryDeadLetters::new()),
        Repositories::in_memory(&database),
        MockServices::new().services(),
    )
    .with_outbox_polling(Duration::from_millis(5), 100)
    .with_read_model_rebuild(Some(options()));
    let model = service.read_model();

    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(service.run_until(async move {
        let _ = stopped.await;
    }));

    let rebuilt = eventually(Duration::from_secs(5), || async {
        model
            .booking(booking_id)
            .await
            .unwrap()
            .and_then(|doc| doc.tickets.get(&ticket_id).map(|t| t.status))
            == Some(TicketStatus::Refunded)
    })
    .await;
    assert!(rebuilt);

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
}
