//! End-to-end tests of the VIP bundle saga.
//!
//! The whole service runs over the in-memory bus and database with mock
//! providers: the outbox forwarder, every handler and the saga. The mock
//! ticket provider does not confirm tickets on its own, so tests that need
//! confirmed show tickets publish `TicketBookingConfirmed` themselves.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tickets::app::AppError;
use tickets::memory::InMemoryDatabase;
use tickets::process_manager::VipBundleProcessManager;
use tickets::messages::{
    BookingMade, FlightBookingFailed, RefundTicket, TicketBookingConfirmed, VipBundleFinalized,
};
use tickets::read_model::{OpsReadModel, TicketStatus};
use tickets::services::mocks::MockServices;
use tickets::shows::{Show, ShowRepository};
use tickets::types::{BookingId, Money, ShowId, TicketId, VipBundleId};
use tickets::vip_bundles::{BookVipBundle, VipBundle, VipBundleRepository, VipBundleService};
use tickets::{Repositories, TicketsService};
use tickets_core::message::{EventHeader, Message, command_topic};
use tickets_runtime::{CommandBus, EventBus, RetryPolicy};
use tickets_testing::helpers::eventually;
use tickets_testing::{InMemoryBus, InMemoryDeadLetters};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    bus: InMemoryBus,
    database: InMemoryDatabase,
    mocks: MockServices,
    dead_letters: InMemoryDeadLetters,
    bundles: VipBundleService,
    read_model: OpsReadModel,
    events: EventBus,
    stop: Option<oneshot::Sender<()>>,
    running: JoinHandle<Result<(), AppError>>,
}

impl Harness {
    fn start(bus: InMemoryBus) -> Self {
        let database = InMemoryDatabase::new();
        let mocks = MockServices::new();
        let dead_letters = InMemoryDeadLetters::new();

        let service = TicketsService::new(
            Arc::new(bus.clone()),
            Arc::new(database.outbox()),
            Arc::new(dead_letters.clone()),
            Repositories::in_memory(&database),
            mocks.services(),
        )
        .with_retry_policy(
            RetryPolicy::builder()
                .max_retries(500)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(10))
                .build(),
        )
        .with_outbox_polling(Duration::from_millis(5), 100)
        .with_shutdown_timeout(Duration::from_secs(5));

        let bundles = service.vip_bundles();
        let read_model = service.read_model();
        let events = service.event_bus();

        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(service.run_until(async move {
            let _ = stopped.await;
        }));

        Self {
            bus,
            database,
            mocks,
            dead_letters,
            bundles,
            read_model,
            events,
            stop: Some(stop),
            running,
        }
    }

    async fn add_show(&self, capacity: u32) -> Show {
        let show = Show {
            show_id: ShowId::new(),
            external_event_id: Uuid::new_v4(),
            number_of_tickets: capacity,
            start_time: Utc::now(),
            title: "Midnight Set".into(),
            venue: "Riverside Arena".into(),
        };
        ShowRepository::add(&self.database, &show).await.unwrap();
        show
    }

    async fn bundle(&self, id: VipBundleId) -> VipBundle {
        VipBundleRepository::get(&self.database, id).await.unwrap()
    }

    async fn bundle_when(&self, id: VipBundleId, condition: impl Fn(&VipBundle) -> bool) -> VipBundle {
        let reached = eventually(WAIT, || {
            let database = self.database.clone();
            let condition = &condition;
            async move {
                VipBundleRepository::get(&database, id)
                    .await
                    .is_ok_and(|bundle| condition(&bundle))
            }
        })
        .await;
        let bundle = self.bundle(id).await;
        assert!(reached, "bundle never reached the expected state: {bundle:?}");
        bundle
    }

    /// Confirms every show ticket of `bundle` once the ledger booked it.
    async fn confirm_tickets(&self, id: VipBundleId) -> Vec<TicketId> {
        let bundle = self.bundle_when(id, |b| b.booking_made_at.is_some()).await;
        let mut ticket_ids = Vec::new();
        for _ in 0..bundle.number_of_tickets {
            let event = ticket_confirmed(bundle.booking_id, &bundle.customer_email);
            ticket_ids.push(event.ticket_id);
            self.events.publish(&event).await.unwrap();
        }
        ticket_ids
    }

    fn finalized_count(&self) -> usize {
        self.bus
            .published_names()
            .iter()
            .filter(|name| name.as_str() == VipBundleFinalized::NAME)
            .count()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.running.await.unwrap().unwrap();
    }
}

fn request(show_id: ShowId, passengers: &[&str]) -> BookVipBundle {
    BookVipBundle {
        customer_email: "vip@example.com".into(),
        inbound_flight_id: Uuid::new_v4(),
        number_of_tickets: u32::try_from(passengers.len()).unwrap(),
        passengers: passengers.iter().map(ToString::to_string).collect(),
        return_flight_id: Uuid::new_v4(),
        show_id,
    }
}

fn ticket_confirmed(booking_id: BookingId, customer_email: &str) -> TicketBookingConfirmed {
    TicketBookingConfirmed {
        header: EventHeader::new(),
        ticket_id: TicketId::new(),
        customer_email: customer_email.to_string(),
        price: Money::new("120.00", "EUR"),
        booking_id,
    }
}

#[tokio::test]
async fn bundle_books_show_flights_and_taxi() {
    let harness = Harness::start(InMemoryBus::new());
    let show = harness.add_show(10).await;
    let request = request(show.show_id, &["Ada", "Grace"]);

    let id = harness.bundles.book(request.clone()).await.unwrap();
    let bundle = harness.bundle_when(id, |b| b.is_finalized).await;

    assert!(!bundle.failed);
    assert!(bundle.booking_made_at.is_some());
    assert!(bundle.taxi_booking_id.is_some());
    assert_eq!(bundle.inbound_flight_ticket_ids.len(), 2);
    assert_eq!(bundle.return_flight_ticket_ids.len(), 2);

    let flights = harness.mocks.transportation.flight_bookings();
    assert_eq!(flights.len(), 2);
    assert_eq!(flights[0].flight_id, request.inbound_flight_id);
    assert_eq!(flights[1].flight_id, request.return_flight_id);
    assert_eq!(flights[0].reference_id, id.to_string());

    let taxis = harness.mocks.transportation.taxi_bookings();
    assert_eq!(taxis.len(), 1);
    assert_eq!(taxis[0].passenger_name, "Ada");
    assert_eq!(taxis[0].number_of_passengers, 2);

    let reservations = harness.mocks.ticket_provider.bookings();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].external_event_id, show.external_event_id);
    assert_eq!(reservations[0].booking_id, bundle.booking_id);

    assert!(eventually(WAIT, || async { harness.finalized_count() == 1 }).await);
    assert!(harness.mocks.payments.refunds().is_empty());
    assert!(harness.dead_letters.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn full_return_flight_refunds_tickets_and_cancels_inbound_flight() {
    let harness = Harness::start(InMemoryBus::new());
    let show = harness.add_show(10).await;
    let request = request(show.show_id, &["Ada", "Grace"]);
    harness.mocks.transportation.make_flight_full(request.return_flight_id);

    let id = harness.bundles.book(request).await.unwrap();
    let tickets = harness.confirm_tickets(id).await;
    let bundle = harness.bundle_when(id, |b| b.failed).await;

    assert!(bundle.is_finalized);
    assert_eq!(bundle.ticket_ids.len(), 2);

    let refunds = harness.mocks.payments.refunds();
    assert_eq!(refunds.len(), 2);
    for ticket_id in &tickets {
        assert!(refunds.iter().any(|r| r.ticket_id == *ticket_id));
    }
    assert_eq!(harness.mocks.receipts.voided().len(), 2);

    let canceled = harness.mocks.transportation.canceled_tickets();
    assert_eq!(canceled, bundle.inbound_flight_ticket_ids);
    assert!(harness.mocks.transportation.taxi_bookings().is_empty());

    let refunded = eventually(WAIT, || async {
        harness
            .read_model
            .booking(bundle.booking_id)
            .await
            .unwrap()
            .is_some_and(|doc| {
                doc.tickets.len() == 2
                    && doc.tickets.values().all(|t| t.status == TicketStatus::Refunded)
            })
    })
    .await;
    assert!(refunded);
    assert_eq!(harness.finalized_count(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn missing_taxi_cancels_both_flights() {
    let harness = Harness::start(InMemoryBus::new());
    let show = harness.add_show(10).await;
    harness.mocks.transportation.make_taxis_unavailable();

    let id = harness.bundles.book(request(show.show_id, &["Ada"])).await.unwrap();
    harness.confirm_tickets(id).await;
    let bundle = harness.bundle_when(id, |b| b.failed).await;

    let canceled = harness.mocks.transportation.canceled_tickets();
    assert_eq!(canceled.len(), 2);
    assert!(canceled.contains(&bundle.inbound_flight_ticket_ids[0]));
    assert!(canceled.contains(&bundle.return_flight_ticket_ids[0]));
    assert_eq!(harness.mocks.payments.refunds().len(), 1);
    assert_eq!(harness.finalized_count(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn sold_out_show_fails_bundle_without_side_effects() {
    let harness = Harness::start(InMemoryBus::new());
    let show = harness.add_show(1).await;

    let id = harness.bundles.book(request(show.show_id, &["Ada", "Grace"])).await.unwrap();
    let bundle = harness.bundle_when(id, |b| b.failed).await;

    assert!(bundle.is_finalized);
    assert!(bundle.booking_made_at.is_none());
    assert!(harness.database.bookings().is_empty());
    assert!(harness.bus.published_names().iter().any(|n| n == "BookingFailed_v1"));
    assert!(harness.mocks.transportation.flight_bookings().is_empty());
    assert!(harness.mocks.payments.refunds().is_empty());
    assert!(harness.mocks.ticket_provider.bookings().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn redelivered_messages_book_every_leg_once() {
    let harness = Harness::start(InMemoryBus::with_redelivery());
    let show = harness.add_show(10).await;

    let id = harness.bundles.book(request(show.show_id, &["Ada", "Grace"])).await.unwrap();
    let bundle = harness.bundle_when(id, |b| b.is_finalized).await;

    assert!(!bundle.failed);
    assert_eq!(harness.database.bookings().len(), 1);
    assert_eq!(harness.mocks.transportation.flight_bookings().len(), 2);
    assert_eq!(harness.mocks.transportation.taxi_bookings().len(), 1);
    assert_eq!(harness.mocks.ticket_provider.bookings().len(), 1);
    assert!(eventually(WAIT, || async { harness.finalized_count() >= 1 }).await);
    assert!(harness.dead_letters.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn redelivered_confirmations_record_each_ticket_once() {
    let harness = Harness::start(InMemoryBus::with_redelivery());
    let show = harness.add_show(10).await;
    let request = request(show.show_id, &["Ada", "Grace"]);
    harness.mocks.transportation.make_flight_full(request.inbound_flight_id);

    let id = harness.bundles.book(request).await.unwrap();
    harness.confirm_tickets(id).await;
    let bundle = harness.bundle_when(id, |b| b.failed).await;

    assert_eq!(bundle.ticket_ids.len(), 2);
    assert_eq!(harness.mocks.payments.refunds().len(), 2);
    assert!(harness.mocks.transportation.canceled_tickets().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn rollback_waits_for_every_ticket_confirmation() {
    let bus = InMemoryBus::new();
    let database = InMemoryDatabase::new();
    let saga = VipBundleProcessManager::new(
        Arc::new(database.clone()),
        CommandBus::new(Arc::new(bus.clone())),
        EventBus::new(Arc::new(bus.clone())),
    );
    let refunds = || bus.published_to(&command_topic::<RefundTicket>());

    let bundle = VipBundle::new(
        request(ShowId::new(), &["Ada", "Grace"]),
        VipBundleId::new(),
        BookingId::new(),
    );
    VipBundleRepository::add(&database, &bundle).await.unwrap();
    saga.on_booking_made(BookingMade {
        header: EventHeader::new(),
        number_of_tickets: 2,
        booking_id: bundle.booking_id,
        customer_email: bundle.customer_email.clone(),
        show_id: bundle.show_id,
        external_event_id: None,
    })
    .await
    .unwrap();

    let first = ticket_confirmed(bundle.booking_id, &bundle.customer_email);
    saga.on_ticket_booking_confirmed(first.clone()).await.unwrap();

    let failed = FlightBookingFailed {
        header: EventHeader::new(),
        flight_id: bundle.inbound_flight_id,
        failure_reason: "no seats left".into(),
        reference_id: bundle.vip_bundle_id.to_string(),
    };
    let waiting = saga.on_flight_booking_failed(failed.clone()).await;
    assert!(waiting.as_ref().is_err_and(|e| e.is_retryable()), "{waiting:?}");
    assert!(refunds().is_empty());

    // A redelivered confirmation does not count as the missing ticket.
    saga.on_ticket_booking_confirmed(first.clone()).await.unwrap();
    assert!(saga.on_flight_booking_failed(failed.clone()).await.is_err());
    assert!(refunds().is_empty());
    assert!(!database_bundle(&database, bundle.vip_bundle_id).await.failed);

    let second = ticket_confirmed(bundle.booking_id, &bundle.customer_email);
    saga.on_ticket_booking_confirmed(second.clone()).await.unwrap();
    saga.on_flight_booking_failed(failed.clone()).await.unwrap();

    let refunded: Vec<TicketId> = refunds()
        .iter()
        .map(|m| m.decode::<RefundTicket>().unwrap().ticket_id)
        .collect();
    assert_eq!(refunded.len(), 2);
    let distinct: HashSet<_> = refunded.iter().copied().collect();
    assert_eq!(distinct, HashSet::from([first.ticket_id, second.ticket_id]));

    let rolled_back = database_bundle(&database, bundle.vip_bundle_id).await;
    assert!(rolled_back.failed);
    assert!(rolled_back.is_finalized);
    assert_eq!(rolled_back.ticket_ids.len(), 2);

    // A redelivered failure finds the bundle rolled back and refunds nothing more.
    saga.on_flight_booking_failed(failed).await.unwrap();
    assert_eq!(refunds().len(), 2);
}

async fn database_bundle(database: &InMemoryDatabase, id: VipBundleId) -> VipBundle {
    VipBundleRepository::get(database, id).await.unwrap()
}
