//! Command and event handlers, called directly against the mocks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use std::sync::Arc;
use tickets::data_lake::DataLake;
use tickets::handlers::events::{TICKETS_TO_PRINT_SHEET, TICKETS_TO_REFUND_SHEET, ticket_file_name};
use tickets::handlers::{CommandHandlers, EventHandlers};
use tickets::memory::InMemoryDatabase;
use tickets::messages::{
    BookFlight, BookShowTickets, BookTaxi, BookingFailed, BookingMade, FlightBookingFailed,
    RefundTicket, TaxiBookingFailed, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued, TicketRefunded,
};
use tickets::services::mocks::MockServices;
use tickets::shows::{Show, ShowRepository};
use tickets::ticket_store::TicketRepository;
use tickets::types::{BookingId, Money, ShowId, TicketId};
use tickets_core::message::{EventHeader, SerializedMessage, event_topic};
use tickets_runtime::EventBus;
use tickets_testing::InMemoryBus;
use uuid::Uuid;

struct Fixture {
    bus: InMemoryBus,
    database: InMemoryDatabase,
    mocks: MockServices,
    commands: CommandHandlers,
    events: EventHandlers,
}

impl Fixture {
    fn new() -> Self {
        let bus = InMemoryBus::new();
        let database = InMemoryDatabase::new();
        let mocks = MockServices::new();
        let event_bus = EventBus::new(Arc::new(bus.clone()));

        let commands = CommandHandlers::new(Arc::new(database.clone()), mocks.services(), event_bus.clone());
        let events = EventHandlers::new(
            Arc::new(database.clone()),
            Arc::new(database.clone()),
            Arc::new(database.clone()),
            mocks.services(),
            event_bus,
        );

        Self {
            bus,
            database,
            mocks,
            commands,
            events,
        }
    }

    async fn add_show(&self, capacity: u32) -> Show {
        let show = Show {
            show_id: ShowId::new(),
            external_event_id: Uuid::new_v4(),
            number_of_tickets: capacity,
            start_time: Utc::now(),
            title: "Quartet".into(),
            venue: "Small Hall".into(),
        };
        ShowRepository::add(&self.database, &show).await.unwrap();
        show
    }

    fn published<E: tickets_core::message::Event>(&self) -> Vec<E> {
        self.bus
            .published_to(&event_topic::<E>())
            .iter()
            .map(|message| message.decode::<E>().unwrap())
            .collect()
    }
}

fn confirmed(key: &str) -> TicketBookingConfirmed {
    TicketBookingConfirmed {
        header: EventHeader::with_idempotency_key(key),
        ticket_id: TicketId::new(),
        customer_email: "fan@example.com".into(),
        price: Money::new("42.50", "EUR"),
        booking_id: BookingId::new(),
    }
}

fn book_show(show_id: ShowId, number_of_tickets: u32, key: &str) -> BookShowTickets {
    BookShowTickets {
        header: EventHeader::with_idempotency_key(key),
        booking_id: BookingId::new(),
        customer_email: "fan@example.com".into(),
        number_of_tickets,
        show_id,
    }
}

#[tokio::test]
async fn full_show_publishes_booking_failed_with_the_command_key() {
    let fixture = Fixture::new();
    let show = fixture.add_show(1).await;
    let command = book_show(show.show_id, 3, "bundle-1-show-tickets");

    fixture.commands.book_show_tickets(command.clone()).await.unwrap();

    let failed = fixture.published::<BookingFailed>();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].booking_id, command.booking_id);
    assert_eq!(failed[0].header.idempotency_key, "bundle-1-show-tickets");
    assert!(failed[0].failure_reason.contains("available 1"));
    assert!(fixture.database.bookings().is_empty());
}

#[tokio::test]
async fn redelivered_booking_is_a_no_op() {
    let fixture = Fixture::new();
    let show = fixture.add_show(5).await;
    let command = book_show(show.show_id, 2, "k");

    fixture.commands.book_show_tickets(command.clone()).await.unwrap();
    fixture.commands.book_show_tickets(command).await.unwrap();

    assert_eq!(fixture.database.bookings().len(), 1);
    assert_eq!(fixture.database.outbox().pending_count(), 1);
    assert!(fixture.published::<BookingFailed>().is_empty());
}

#[tokio::test]
async fn booking_an_unknown_show_is_not_retried() {
    let fixture = Fixture::new();

    let error = fixture
        .commands
        .book_show_tickets(book_show(ShowId::new(), 1, "k"))
        .await
        .unwrap_err();

    assert!(!error.is_retryable());
}

#[tokio::test]
async fn unavailable_flight_publishes_flight_booking_failed() {
    let fixture = Fixture::new();
    let flight_id = Uuid::new_v4();
    fixture.mocks.transportation.make_flight_full(flight_id);

    fixture
        .commands
        .book_flight(BookFlight {
            header: EventHeader::with_idempotency_key("b-inbound-flight"),
            customer_email: "vip@example.com".into(),
            flight_id,
            passengers: vec!["Ada".into()],
            reference_id: "b".into(),
        })
        .await
        .unwrap();

    let failed = fixture.published::<FlightBookingFailed>();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].flight_id, flight_id);
    assert_eq!(failed[0].reference_id, "b");
    assert_eq!(failed[0].header.idempotency_key, "b-inbound-flight");
}

#[tokio::test]
async fn transient_provider_errors_are_retryable() {
    let fixture = Fixture::new();
    fixture.mocks.transportation.fail_next_calls(1);
    let command = BookTaxi {
        header: EventHeader::with_idempotency_key("b-taxi"),
        customer_email: "vip@example.com".into(),
        customer_name: "Ada".into(),
        number_of_passengers: 2,
        reference_id: "b".into(),
    };

    let error = fixture.commands.book_taxi(command.clone()).await.unwrap_err();
    assert!(error.is_retryable());

    fixture.commands.book_taxi(command).await.unwrap();
    let taxis = fixture.mocks.transportation.taxi_bookings();
    assert_eq!(taxis.len(), 1);
    assert_eq!(taxis[0].passenger_name, "Ada");
    assert_eq!(taxis[0].idempotency_key, "b-taxi");
}

#[tokio::test]
async fn no_taxi_publishes_taxi_booking_failed() {
    let fixture = Fixture::new();
    fixture.mocks.transportation.make_taxis_unavailable();

    fixture
        .commands
        .book_taxi(BookTaxi {
            header: EventHeader::with_idempotency_key("b-taxi"),
            customer_email: "vip@example.com".into(),
            customer_name: "Ada".into(),
            number_of_passengers: 1,
            reference_id: "b".into(),
        })
        .await
        .unwrap();

    assert_eq!(fixture.published::<TaxiBookingFailed>().len(), 1);
}

#[tokio::test]
async fn refund_voids_receipt_refunds_payment_and_announces_it() {
    let fixture = Fixture::new();
    let ticket_id = TicketId::new();
    let command = RefundTicket {
        header: EventHeader::with_idempotency_key("b-refund-1"),
        ticket_id,
    };

    fixture.commands.refund_ticket(command.clone()).await.unwrap();
    fixture.commands.refund_ticket(command).await.unwrap();

    let voided = fixture.mocks.receipts.voided();
    assert_eq!(voided.len(), 1);
    assert_eq!(voided[0].ticket_id, ticket_id);
    let refunds = fixture.mocks.payments.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].idempotency_key, "b-refund-1");

    let refunded = fixture.published::<TicketRefunded>();
    assert_eq!(refunded.len(), 2);
    assert!(refunded.iter().all(|e| e.ticket_id == ticket_id));
}

#[tokio::test]
async fn refund_without_idempotency_key_is_rejected() {
    let fixture = Fixture::new();

    let error = fixture
        .commands
        .refund_ticket(RefundTicket {
            header: EventHeader::with_idempotency_key(""),
            ticket_id: TicketId::new(),
        })
        .await
        .unwrap_err();

    assert!(!error.is_retryable());
    assert!(fixture.mocks.payments.refunds().is_empty());
}

#[tokio::test]
async fn receipt_is_issued_once_per_key() {
    let fixture = Fixture::new();
    let event = confirmed("confirm-1");

    fixture.events.issue_receipt(event.clone()).await.unwrap();
    fixture.events.issue_receipt(event.clone()).await.unwrap();

    assert_eq!(fixture.mocks.receipts.issued().len(), 1);
    let issued = fixture.published::<TicketReceiptIssued>();
    assert_eq!(issued.len(), 2);
    assert_eq!(issued[0].receipt_number, issued[1].receipt_number);
    assert_eq!(issued[0].ticket_id, event.ticket_id);
    assert_eq!(issued[0].header.idempotency_key, "confirm-1");
}

#[tokio::test]
async fn confirmed_ticket_is_tracked_stored_and_printed() {
    let fixture = Fixture::new();
    let event = confirmed("confirm-2");

    fixture.events.append_to_tracker(event.clone()).await.unwrap();
    fixture.events.store_ticket(event.clone()).await.unwrap();
    fixture.events.print_ticket(event.clone()).await.unwrap();

    assert_eq!(
        fixture.mocks.spreadsheets.rows(TICKETS_TO_PRINT_SHEET),
        vec![vec![
            event.ticket_id.to_string(),
            "fan@example.com".to_string(),
            "42.50".to_string(),
            "EUR".to_string(),
        ]]
    );

    let stored = TicketRepository::find_all(&fixture.database).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ticket_id, event.ticket_id);

    let file_name = ticket_file_name(event.ticket_id);
    let html = fixture.mocks.files.file(&file_name).unwrap();
    assert!(html.contains(&event.ticket_id.to_string()));
    assert!(html.contains("42.50 EUR"));

    let printed = fixture.published::<TicketPrinted>();
    assert_eq!(printed.len(), 1);
    assert_eq!(printed[0].file_name, file_name);
}

#[tokio::test]
async fn canceled_ticket_is_removed_and_queued_for_refund() {
    let fixture = Fixture::new();
    let event = confirmed("confirm-3");
    fixture.events.store_ticket(event.clone()).await.unwrap();

    let canceled = TicketBookingCanceled {
        header: EventHeader::new(),
        ticket_id: event.ticket_id,
        customer_email: event.customer_email.clone(),
        price: event.price.clone(),
    };
    fixture.events.remove_canceled_ticket(canceled.clone()).await.unwrap();
    fixture.events.tickets_to_refund(canceled).await.unwrap();

    assert!(TicketRepository::find_all(&fixture.database).await.unwrap().is_empty());
    assert_eq!(fixture.mocks.spreadsheets.rows(TICKETS_TO_REFUND_SHEET).len(), 1);
}

#[tokio::test]
async fn provider_booking_falls_back_to_the_show_event_id() {
    let fixture = Fixture::new();
    let show = fixture.add_show(10).await;
    let event = BookingMade {
        header: EventHeader::new(),
        number_of_tickets: 2,
        booking_id: BookingId::new(),
        customer_email: "fan@example.com".into(),
        show_id: show.show_id,
        external_event_id: None,
    };

    fixture.events.book_place_in_provider(event.clone()).await.unwrap();
    fixture.events.book_place_in_provider(event.clone()).await.unwrap();

    let bookings = fixture.mocks.ticket_provider.bookings();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].external_event_id, show.external_event_id);
    assert_eq!(bookings[0].number_of_tickets, 2);
    assert_eq!(bookings[0].booking_id, event.booking_id);
}

#[tokio::test]
async fn data_lake_archives_each_event_once() {
    let fixture = Fixture::new();
    let message = SerializedMessage::from_message(&confirmed("confirm-4")).unwrap();

    fixture.events.store_in_data_lake(message.clone()).await.unwrap();
    fixture.events.store_in_data_lake(message.clone()).await.unwrap();

    let archived = DataLake::find_all(&fixture.database).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].event_name, "TicketBookingConfirmed_v1");
    assert_eq!(archived[0].event_payload, message.payload);
}

#[tokio::test]
async fn data_lake_rejects_messages_without_header() {
    let fixture = Fixture::new();
    let message = SerializedMessage::new(
        "TicketRefunded_v1".into(),
        serde_json::json!({ "ticket_id": TicketId::new() }),
        Default::default(),
    );

    let error = fixture.events.store_in_data_lake(message).await.unwrap_err();
    assert!(!error.is_retryable());
}
