//! Application wiring: stores, handlers, the dispatch table and the service
//! lifecycle.

use crate::config::Config;
use crate::data_lake::{DataLake, PostgresDataLake};
use crate::handlers::{CommandHandlers, EventHandlers};
use crate::ledger::{BookingRepository, PostgresBookingRepository};
use crate::memory::InMemoryDatabase;
use crate::messages::{
    BookFlight, BookShowTickets, BookTaxi, BookingFailed, BookingMade, CancelFlightTickets,
    FlightBooked, FlightBookingFailed, RefundTicket, TaxiBooked, TaxiBookingFailed,
    TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted, TicketReceiptIssued,
    TicketRefunded, TicketsEvent, VipBundleInitialized,
};
use crate::process_manager::VipBundleProcessManager;
use crate::read_model::{
    OpsBookingStore, OpsReadModel, PostgresOpsBookings, RebuildOptions, rebuild_from_data_lake,
};
use crate::services::Services;
use crate::shows::{PostgresShowRepository, ShowRepository};
use crate::ticket_store::{PostgresTicketRepository, TicketRepository};
use crate::vip_bundles::{PostgresVipBundleRepository, VipBundleRepository, VipBundleService};
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tickets_core::dead_letter::DeadLetterSink;
use tickets_core::event_bus::MessageBus;
use tickets_core::message::external_event_topic;
use tickets_core::outbox::OutboxSource;
use tickets_runtime::{
    CommandBus, EventBus, HandlerError, HandlerRegistration, OutboxForwarder, Processor,
    ProcessorError, RetryPolicy,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default service name, the prefix of every consumer group.
pub const DEFAULT_SERVICE_NAME: &str = "svc-tickets";

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// The dispatch table is invalid
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Workers did not stop in time
    #[error("Workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Every store the service uses.
#[derive(Clone)]
pub struct Repositories {
    /// Booking ledger
    pub bookings: Arc<dyn BookingRepository>,
    /// Shows
    pub shows: Arc<dyn ShowRepository>,
    /// Confirmed tickets
    pub tickets: Arc<dyn TicketRepository>,
    /// Saga state
    pub vip_bundles: Arc<dyn VipBundleRepository>,
    /// Ops read model documents
    pub ops_bookings: Arc<dyn OpsBookingStore>,
    /// Event archive
    pub data_lake: Arc<dyn DataLake>,
}

impl Repositories {
    /// Postgres stores over one pool.
    #[must_use]
    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            bookings: Arc::new(PostgresBookingRepository::new(pool.clone())),
            shows: Arc::new(PostgresShowRepository::new(pool.clone())),
            tickets: Arc::new(PostgresTicketRepository::new(pool.clone())),
            vip_bundles: Arc::new(PostgresVipBundleRepository::new(pool.clone())),
            ops_bookings: Arc::new(PostgresOpsBookings::new(pool.clone())),
            data_lake: Arc::new(PostgresDataLake::new(pool.clone())),
        }
    }

    /// In-memory stores sharing `database`.
    #[must_use]
    pub fn in_memory(database: &InMemoryDatabase) -> Self {
        Self {
            bookings: Arc::new(database.clone()),
            shows: Arc::new(database.clone()),
            tickets: Arc::new(database.clone()),
            vip_bundles: Arc::new(database.clone()),
            ops_bookings: Arc::new(database.clone()),
            data_lake: Arc::new(database.clone()),
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

/// Registers `$target.$method` for messages of type `$message`. With
/// `&$method` the handler borrows the message and its error is converted.
macro_rules! route {
    ($register:ident, $message:ty, $name:expr, $target:expr, &$method:ident) => {{
        let target = $target.clone();
        HandlerRegistration::$register::<$message, _, _>($name, move |message| {
            let target = target.clone();
            async move { target.$method(&message).await.map_err(HandlerError::from) }
        })
    }};
    ($register:ident, $message:ty, $name:expr, $target:expr, $method:ident) => {{
        let target = $target.clone();
        HandlerRegistration::$register::<$message, _, _>($name, move |message| {
            let target = target.clone();
            async move { target.$method(message).await }
        })
    }};
}

/// The tickets service.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tickets::memory::InMemoryDatabase;
/// use tickets::services::mocks::MockServices;
/// use tickets::{Repositories, TicketsService};
/// use tickets_testing::{InMemoryBus, InMemoryDeadLetters};
///
/// # async fn example() -> Result<(), tickets::app::AppError> {
/// let database = InMemoryDatabase::new();
/// let service = TicketsService::new(
///     Arc::new(InMemoryBus::new()),
///     Arc::new(database.outbox()),
///     Arc::new(InMemoryDeadLetters::new()),
///     Repositories::in_memory(&database),
///     MockServices::new().services(),
/// );
/// service.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
/// # }
/// ```
pub struct TicketsService {
    service_name: String,
    transport: Arc<dyn MessageBus>,
    outbox: Arc<dyn OutboxSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    repositories: Repositories,
    services: Services,
    retry_policy: RetryPolicy,
    poll_interval: Duration,
    batch_size: usize,
    shutdown_timeout: Duration,
    rebuild: Option<RebuildOptions>,
}

impl TicketsService {
    /// Creates the service with default tuning.
    #[must_use]
    pub fn new(
        transport: Arc<dyn MessageBus>,
        outbox: Arc<dyn OutboxSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        repositories: Repositories,
        services: Services,
    ) -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            transport,
            outbox,
            dead_letters,
            repositories,
            services,
            retry_policy: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            rebuild: None,
        }
    }

    /// Applies the tuning from `config`.
    #[must_use]
    pub fn configured(self, config: &Config) -> Self {
        let rebuild = config.server.rebuild_read_model.then(RebuildOptions::default);
        self.with_service_name(config.processor.service_name.clone())
            .with_retry_policy(config.processor.retry_policy())
            .with_outbox_polling(config.outbox.poll_interval(), config.outbox.batch_size)
            .with_shutdown_timeout(config.server.shutdown_timeout())
            .with_read_model_rebuild(rebuild)
    }

    /// Sets the service name used in consumer groups.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the retry policy of every handler.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the outbox forwarder's poll interval and batch size.
    #[must_use]
    pub const fn with_outbox_polling(mut self, poll_interval: Duration, batch_size: usize) -> Self {
        self.poll_interval = poll_interval;
        self.batch_size = batch_size;
        self
    }

    /// Sets how long shutdown waits for the workers.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Rebuilds the ops read model from the data lake in the background at
    /// startup when set.
    #[must_use]
    pub fn with_read_model_rebuild(mut self, options: Option<RebuildOptions>) -> Self {
        self.rebuild = options;
        self
    }

    /// Publisher of events.
    #[must_use]
    pub fn event_bus(&self) -> EventBus {
        EventBus::new(Arc::clone(&self.transport))
    }

    /// Publisher of commands.
    #[must_use]
    pub fn command_bus(&self) -> CommandBus {
        CommandBus::new(Arc::clone(&self.transport))
    }

    /// The ops read model projector.
    #[must_use]
    pub fn read_model(&self) -> OpsReadModel {
        OpsReadModel::new(Arc::clone(&self.repositories.ops_bookings), self.event_bus())
    }

    /// Entry point of VIP bundle purchases.
    #[must_use]
    pub fn vip_bundles(&self) -> VipBundleService {
        VipBundleService::new(Arc::clone(&self.repositories.vip_bundles))
    }

    /// The saga.
    #[must_use]
    pub fn process_manager(&self) -> VipBundleProcessManager {
        VipBundleProcessManager::new(
            Arc::clone(&self.repositories.vip_bundles),
            self.command_bus(),
            self.event_bus(),
        )
    }

    /// The full dispatch table.
    #[must_use]
    pub fn registrations(&self) -> Vec<HandlerRegistration> {
        let commands = CommandHandlers::new(
            Arc::clone(&self.repositories.bookings),
            self.services.clone(),
            self.event_bus(),
        );
        let events = EventHandlers::new(
            Arc::clone(&self.repositories.shows),
            Arc::clone(&self.repositories.tickets),
            Arc::clone(&self.repositories.data_lake),
            self.services.clone(),
            self.event_bus(),
        );
        let saga = self.process_manager();
        let read_model = self.read_model();

        let mut registrations = vec![
            route!(command, BookShowTickets, "book_show_tickets", commands, book_show_tickets),
            route!(command, BookFlight, "book_flight", commands, book_flight),
            route!(command, BookTaxi, "book_taxi", commands, book_taxi),
            route!(command, CancelFlightTickets, "cancel_flight_tickets", commands, cancel_flight_tickets),
            route!(command, RefundTicket, "refund_ticket", commands, refund_ticket),
            route!(event, TicketBookingConfirmed, "issue_receipt", events, issue_receipt),
            route!(event, TicketBookingConfirmed, "append_to_tracker", events, append_to_tracker),
            route!(event, TicketBookingConfirmed, "store_ticket", events, store_ticket),
            route!(event, TicketBookingConfirmed, "print_ticket", events, print_ticket),
            route!(event, TicketBookingCanceled, "tickets_to_refund", events, tickets_to_refund),
            route!(event, TicketBookingCanceled, "remove_canceled_ticket", events, remove_canceled_ticket),
            route!(event, BookingMade, "book_place_in_provider", events, book_place_in_provider),
            route!(event, BookingMade, "ops_read_model.on_booking_made", read_model, &on_booking_made),
            route!(
                event,
                TicketBookingConfirmed,
                "ops_read_model.on_ticket_booking_confirmed",
                read_model,
                &on_ticket_booking_confirmed
            ),
            route!(
                event,
                TicketReceiptIssued,
                "ops_read_model.on_ticket_receipt_issued",
                read_model,
                &on_ticket_receipt_issued
            ),
            route!(event, TicketPrinted, "ops_read_model.on_ticket_printed", read_model, &on_ticket_printed),
            route!(event, TicketRefunded, "ops_read_model.on_ticket_refunded", read_model, &on_ticket_refunded),
            route!(
                event,
                VipBundleInitialized,
                "vip_bundle.on_vip_bundle_initialized",
                saga,
                on_vip_bundle_initialized
            ),
            route!(event, BookingMade, "vip_bundle.on_booking_made", saga, on_booking_made),
            route!(
                event,
                TicketBookingConfirmed,
                "vip_bundle.on_ticket_booking_confirmed",
                saga,
                on_ticket_booking_confirmed
            ),
            route!(event, BookingFailed, "vip_bundle.on_booking_failed", saga, on_booking_failed),
            route!(event, FlightBooked, "vip_bundle.on_flight_booked", saga, on_flight_booked),
            route!(event, FlightBookingFailed, "vip_bundle.on_flight_booking_failed", saga, on_flight_booking_failed),
            route!(event, TaxiBooked, "vip_bundle.on_taxi_booked", saga, on_taxi_booked),
            route!(event, TaxiBookingFailed, "vip_bundle.on_taxi_booking_failed", saga, on_taxi_booking_failed),
        ];

        registrations.extend(TicketsEvent::NAMES.iter().map(|name| {
            let events = events.clone();
            HandlerRegistration::raw(
                format!("store_in_data_lake_{name}"),
                external_event_topic(name),
                move |message| {
                    let events = events.clone();
                    async move { events.store_in_data_lake(message).await }
                },
            )
        }));

        registrations
    }

    /// A processor holding the full dispatch table.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::DuplicateHandler`] if two handlers share a
    /// name.
    pub fn processor(&self) -> Result<Processor, ProcessorError> {
        let mut processor = Processor::new(
            self.service_name.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.dead_letters),
        )
        .with_retry_policy(self.retry_policy.clone());
        for registration in self.registrations() {
            processor.register(registration)?;
        }
        Ok(processor)
    }

    /// The outbox forwarder.
    #[must_use]
    pub fn forwarder(&self) -> OutboxForwarder {
        OutboxForwarder::new(Arc::clone(&self.outbox), Arc::clone(&self.transport))
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
    }

    /// Runs the handlers and the outbox forwarder until `signal` completes,
    /// then stops them.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Processor`] for an invalid dispatch table, or
    /// [`AppError::ShutdownTimeout`] if the workers outlive the shutdown
    /// timeout.
    pub async fn run_until<F>(self, signal: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let processor = self.processor()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut workers = processor.spawn(&shutdown_tx);
        workers.push(self.forwarder().spawn(shutdown_tx.subscribe()));
        let rebuild = self.spawn_rebuild();
        info!(service = %self.service_name, workers = workers.len(), "Tickets service running");

        signal.await;
        info!("Shutting down");

        if let Some(rebuild) = rebuild {
            rebuild.abort();
        }
        if shutdown_tx.send(()).is_err() {
            debug!("Every worker already stopped");
        }

        match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker ended abnormally");
                    }
                }
                info!("Tickets service stopped");
                Ok(())
            },
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Workers did not stop in time");
                Err(AppError::ShutdownTimeout(self.shutdown_timeout))
            },
        }
    }

    fn spawn_rebuild(&self) -> Option<tokio::task::JoinHandle<()>> {
        let options = self.rebuild.clone()?;
        let data_lake = Arc::clone(&self.repositories.data_lake);
        let read_model = self.read_model();
        Some(tokio::spawn(async move {
            match rebuild_from_data_lake(data_lake.as_ref(), &read_model, &options).await {
                Ok(report) => info!(applied = report.applied, unresolved = report.unresolved, "Read model rebuild done"),
                Err(e) => error!(error = %e, "Read model rebuild failed"),
            }
        }))
    }
}

impl std::fmt::Debug for TicketsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketsService")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::services::mocks::MockServices;
    use std::collections::HashSet;
    use tickets_testing::{InMemoryBus, InMemoryDeadLetters};

    fn service() -> TicketsService {
        let database = InMemoryDatabase::new();
        TicketsService::new(
            Arc::new(InMemoryBus::new()),
            Arc::new(database.outbox()),
            Arc::new(InMemoryDeadLetters::new()),
            Repositories::in_memory(&database),
            MockServices::new().services(),
        )
    }

    #[test]
    fn every_handler_has_its_own_consumer_group() {
        let registrations = service().registrations();
        let groups: HashSet<_> = registrations
            .iter()
            .map(|r| r.consumer_group(DEFAULT_SERVICE_NAME))
            .collect();
        assert_eq!(groups.len(), registrations.len());
        assert!(groups.contains("svc-tickets.commands.book_show_tickets"));
        assert!(groups.contains("svc-tickets.events.vip_bundle.on_flight_booked"));
    }

    #[test]
    fn every_external_event_is_archived() {
        let registrations = service().registrations();
        for name in TicketsEvent::NAMES {
            let topic = external_event_topic(name);
            assert!(
                registrations
                    .iter()
                    .any(|r| r.name().starts_with("store_in_data_lake_") && r.topic() == topic),
                "{name} is not archived"
            );
        }
    }

    #[test]
    fn dispatch_table_is_valid() {
        assert!(service().processor().is_ok());
    }
}
