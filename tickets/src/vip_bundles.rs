//! Saga state of VIP bundle purchases.
//!
//! One [`VipBundle`] document per purchase, stored as JSON next to its id and
//! booking id. Only the saga changes a bundle, through
//! [`VipBundleRepository::update_by_id`] and
//! [`VipBundleRepository::update_by_booking_id`]: load, apply a pure update,
//! persist, all in one serializable transaction that is re-run on conflict.
//! The update may be called more than once, so it must not have side effects.

use crate::messages::VipBundleInitialized;
use crate::types::{BookingId, ShowId, VipBundleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tickets_core::message::{EventHeader, MessageError};
use tickets_postgres::{
    ConflictError, DEFAULT_CONFLICT_ATTEMPTS, EnqueueError, IsolationLevel, PostgresOutbox, begin,
    is_serialization_failure, is_unique_violation, retry_on_conflict,
};
use uuid::Uuid;

/// State of one VIP bundle purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundle {
    /// Bundle id, also the reference id of its flight and taxi bookings
    pub vip_bundle_id: VipBundleId,
    /// Booking id of the show seats
    pub booking_id: BookingId,
    /// Customer email
    pub customer_email: String,
    /// Seats requested
    pub number_of_tickets: u32,
    /// Show to book
    pub show_id: ShowId,
    /// When the ledger committed the booking
    pub booking_made_at: Option<DateTime<Utc>>,
    /// Confirmed show tickets, each id at most once
    pub ticket_ids: Vec<Uuid>,
    /// Passenger names; the first one books the taxi
    pub passengers: Vec<String>,
    /// Inbound flight
    pub inbound_flight_id: Uuid,
    /// When the inbound flight was booked
    pub inbound_flight_booked_at: Option<DateTime<Utc>>,
    /// Inbound flight tickets
    pub inbound_flight_ticket_ids: Vec<Uuid>,
    /// Return flight
    pub return_flight_id: Uuid,
    /// When the return flight was booked
    pub return_flight_booked_at: Option<DateTime<Utc>>,
    /// Return flight tickets
    pub return_flight_ticket_ids: Vec<Uuid>,
    /// When the taxi was booked
    pub taxi_booked_at: Option<DateTime<Utc>>,
    /// Booking id at the taxi provider
    pub taxi_booking_id: Option<Uuid>,
    /// No further transitions happen once set
    pub is_finalized: bool,
    /// The purchase was rolled back
    pub failed: bool,
}

impl VipBundle {
    /// A bundle that has not started yet.
    #[must_use]
    pub fn new(request: BookVipBundle, vip_bundle_id: VipBundleId, booking_id: BookingId) -> Self {
        Self {
            vip_bundle_id,
            booking_id,
            customer_email: request.customer_email,
            number_of_tickets: request.number_of_tickets,
            show_id: request.show_id,
            booking_made_at: None,
            ticket_ids: Vec::new(),
            passengers: request.passengers,
            inbound_flight_id: request.inbound_flight_id,
            inbound_flight_booked_at: None,
            inbound_flight_ticket_ids: Vec::new(),
            return_flight_id: request.return_flight_id,
            return_flight_booked_at: None,
            return_flight_ticket_ids: Vec::new(),
            taxi_booked_at: None,
            taxi_booking_id: None,
            is_finalized: false,
            failed: false,
        }
    }
}

/// Saga store errors.
#[derive(Error, Debug)]
pub enum VipBundleError {
    /// No bundle with that id.
    #[error("VIP bundle {0} not found")]
    NotFound(VipBundleId),

    /// No bundle for that booking.
    #[error("No VIP bundle for booking {0}")]
    NotFoundForBooking(BookingId),

    /// A bundle with that id already exists.
    #[error("VIP bundle {0} already exists")]
    AlreadyExists(VipBundleId),

    /// The purchase request is malformed.
    #[error("Invalid VIP bundle request: {0}")]
    InvalidRequest(String),

    /// An update found the bundle in a state it cannot handle.
    #[error("Invalid VIP bundle state: {0}")]
    InvalidState(String),

    /// A stored document could not be encoded or decoded.
    #[error("VIP bundle serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The initiating event could not be serialized.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The store failed.
    #[error("VIP bundle storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<EnqueueError> for VipBundleError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::Message(e) => Self::Message(e),
            EnqueueError::Database(e) => Self::Database(e),
        }
    }
}

impl ConflictError for VipBundleError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Database(e) => is_serialization_failure(e),
            _ => false,
        }
    }
}

/// A pure transition of a bundle. May run more than once per update.
pub type BundleUpdate<'a> =
    &'a (dyn Fn(VipBundle) -> Result<VipBundle, VipBundleError> + Send + Sync);

/// Saga store.
#[async_trait]
pub trait VipBundleRepository: Send + Sync {
    /// Stores a new bundle and enqueues `VipBundleInitialized` in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::AlreadyExists`] for a duplicate id, or a
    /// storage error.
    async fn add(&self, bundle: &VipBundle) -> Result<(), VipBundleError>;

    /// Loads a bundle by id.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::NotFound`] for an unknown id.
    async fn get(&self, id: VipBundleId) -> Result<VipBundle, VipBundleError>;

    /// Loads the bundle of a booking.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::NotFoundForBooking`] if no bundle owns it.
    async fn get_by_booking_id(&self, booking_id: BookingId) -> Result<VipBundle, VipBundleError>;

    /// Applies `update` to a bundle and returns the stored result.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::NotFound`], the error of `update`, or a
    /// storage error. Nothing is written on error.
    async fn update_by_id(
        &self,
        id: VipBundleId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError>;

    /// Applies `update` to the bundle of a booking and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::NotFoundForBooking`], the error of `update`,
    /// or a storage error. Nothing is written on error.
    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError>;
}

/// The `VipBundleInitialized` event announcing a stored bundle.
#[must_use]
pub fn bundle_initialized(bundle: &VipBundle) -> VipBundleInitialized {
    VipBundleInitialized {
        header: EventHeader::new(),
        vip_bundle_id: bundle.vip_bundle_id,
    }
}

/// A VIP bundle purchase as the customer submits it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookVipBundle {
    /// Customer email
    pub customer_email: String,
    /// Inbound flight
    pub inbound_flight_id: Uuid,
    /// Seats requested
    pub number_of_tickets: u32,
    /// Passenger names
    pub passengers: Vec<String>,
    /// Return flight
    pub return_flight_id: Uuid,
    /// Show to book
    pub show_id: ShowId,
}

/// Accepts VIP bundle purchases.
#[derive(Clone)]
pub struct VipBundleService {
    repository: Arc<dyn VipBundleRepository>,
}

impl VipBundleService {
    /// Creates the service over a saga store.
    #[must_use]
    pub fn new(repository: Arc<dyn VipBundleRepository>) -> Self {
        Self { repository }
    }

    /// Validates `request` and starts its saga.
    ///
    /// # Errors
    ///
    /// Returns [`VipBundleError::InvalidRequest`] if no seats or no passengers
    /// are given, or the store error.
    pub async fn book(&self, request: BookVipBundle) -> Result<VipBundleId, VipBundleError> {
        if request.number_of_tickets == 0 {
            return Err(VipBundleError::InvalidRequest(
                "number of tickets must be greater than zero".into(),
            ));
        }
        if request.passengers.is_empty() {
            return Err(VipBundleError::InvalidRequest("at least one passenger is required".into()));
        }

        let bundle = VipBundle::new(request, VipBundleId::new(), BookingId::new());
        self.repository.add(&bundle).await?;
        crate::metrics::record_bundle_started();

        tracing::info!(
            vip_bundle_id = %bundle.vip_bundle_id,
            booking_id = %bundle.booking_id,
            "VIP bundle accepted"
        );
        Ok(bundle.vip_bundle_id)
    }
}

impl std::fmt::Debug for VipBundleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipBundleService").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
enum Lookup {
    Id(VipBundleId),
    Booking(BookingId),
}

impl Lookup {
    fn not_found(self) -> VipBundleError {
        match self {
            Self::Id(id) => VipBundleError::NotFound(id),
            Self::Booking(id) => VipBundleError::NotFoundForBooking(id),
        }
    }
}

/// Saga store in the `vip_bundles` table.
#[derive(Debug, Clone)]
pub struct PostgresVipBundleRepository {
    pool: PgPool,
}

impl PostgresVipBundleRepository {
    /// Creates a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find<'c, E>(executor: E, lookup: Lookup) -> Result<VipBundle, VipBundleError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let (sql, key) = match lookup {
            Lookup::Id(id) => ("SELECT payload FROM vip_bundles WHERE vip_bundle_id = $1", *id.as_uuid()),
            Lookup::Booking(id) => ("SELECT payload FROM vip_bundles WHERE booking_id = $1", *id.as_uuid()),
        };
        let payload: serde_json::Value = sqlx::query_scalar(sql)
            .bind(key)
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| lookup.not_found())?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn try_update(
        &self,
        lookup: Lookup,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        let mut tx = begin(&self.pool, IsolationLevel::Serializable).await?;

        let current = Self::find(&mut *tx, lookup).await?;
        let updated = update(current)?;

        sqlx::query("UPDATE vip_bundles SET payload = $1 WHERE vip_bundle_id = $2")
            .bind(serde_json::to_value(&updated)?)
            .bind(updated.vip_bundle_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(updated)
    }
}

#[async_trait]
impl VipBundleRepository for PostgresVipBundleRepository {
    async fn add(&self, bundle: &VipBundle) -> Result<(), VipBundleError> {
        let mut tx = begin(&self.pool, IsolationLevel::RepeatableRead).await?;

        let inserted = sqlx::query(
            "INSERT INTO vip_bundles (vip_bundle_id, booking_id, payload) VALUES ($1, $2, $3)",
        )
        .bind(bundle.vip_bundle_id.as_uuid())
        .bind(bundle.booking_id.as_uuid())
        .bind(serde_json::to_value(bundle)?)
        .execute(&mut *tx)
        .await;
        match inserted {
            Err(e) if is_unique_violation(&e) => {
                return Err(VipBundleError::AlreadyExists(bundle.vip_bundle_id));
            },
            other => other?,
        };

        PostgresOutbox::enqueue_event(&mut *tx, &bundle_initialized(bundle)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: VipBundleId) -> Result<VipBundle, VipBundleError> {
        Self::find(&self.pool, Lookup::Id(id)).await
    }

    async fn get_by_booking_id(&self, booking_id: BookingId) -> Result<VipBundle, VipBundleError> {
        Self::find(&self.pool, Lookup::Booking(booking_id)).await
    }

    async fn update_by_id(
        &self,
        id: VipBundleId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || self.try_update(Lookup::Id(id), update))
            .await
    }

    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            self.try_update(Lookup::Booking(booking_id), update)
        })
        .await
    }
}
