//! Booking ledger.
//!
//! The ledger enforces, at every committed state,
//!
//! ```text
//! sum(bookings.number_of_tickets WHERE show_id = S) <= shows.number_of_tickets
//! ```
//!
//! Each booking runs as one transaction that locks the show row, reads the
//! booked sum, inserts the booking and enqueues `BookingMade`. The lock queues
//! writers of the same show behind each other. Under `READ COMMITTED` every
//! statement after the lock sees the bookings committed before it, so the sum
//! is exact and a writer that finds too few seats reports
//! [`BookingError::NoPlacesLeft`]. Writers of different shows never wait on
//! each other.

use crate::messages::BookingMade;
use crate::types::{BookingId, ShowId};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tickets_core::message::{EventHeader, MessageError};
use tickets_postgres::{
    ConflictError, DEFAULT_CONFLICT_ATTEMPTS, EnqueueError, IsolationLevel, PostgresOutbox, begin,
    is_serialization_failure, is_unique_violation, retry_on_conflict,
};
use uuid::Uuid;

/// A request for seats at a show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Booking {
    /// Caller-chosen id, stable across retries of the same request
    pub booking_id: BookingId,
    /// Show to book
    pub show_id: ShowId,
    /// Seats requested
    pub number_of_tickets: u32,
    /// Customer email
    pub customer_email: String,
}

/// Successful result of [`BookingRepository::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookingOutcome {
    /// The booking committed and `BookingMade` was enqueued.
    Booked,
    /// A booking with this id already committed; nothing was written.
    AlreadyExists,
}

/// Ledger errors.
#[derive(Error, Debug)]
pub enum BookingError {
    /// Zero seats were requested.
    #[error("Number of tickets must be greater than zero")]
    InvalidTicketCount,

    /// The show does not exist.
    #[error("Show {0} not found")]
    ShowNotFound(ShowId),

    /// Not enough seats are left.
    #[error("Not enough seats left: requested {requested}, available {available}")]
    NoPlacesLeft {
        /// Seats requested
        requested: u32,
        /// Seats still free
        available: u32,
    },

    /// The `BookingMade` event could not be serialized.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The store failed.
    #[error("Booking storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<EnqueueError> for BookingError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::Message(e) => Self::Message(e),
            EnqueueError::Database(e) => Self::Database(e),
        }
    }
}

impl ConflictError for BookingError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Database(e) => is_serialization_failure(e),
            _ => false,
        }
    }
}

/// The booking ledger.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Books seats, enqueuing `BookingMade` in the same transaction.
    ///
    /// Adding a booking id that already committed is an idempotent success.
    ///
    /// # Errors
    ///
    /// [`BookingError::NoPlacesLeft`] if the show lacks capacity, in which
    /// case nothing is written. [`BookingError::ShowNotFound`],
    /// [`BookingError::InvalidTicketCount`], or a storage error otherwise.
    async fn add(&self, booking: &Booking) -> Result<BookingOutcome, BookingError>;
}

/// Builds the `BookingMade` event of a committed booking.
#[must_use]
pub fn booking_made(booking: &Booking, external_event_id: Option<Uuid>) -> BookingMade {
    BookingMade {
        header: EventHeader::new(),
        number_of_tickets: booking.number_of_tickets,
        booking_id: booking.booking_id,
        customer_email: booking.customer_email.clone(),
        show_id: booking.show_id,
        external_event_id,
    }
}

/// Seats still free, given the capacity and the seats already booked.
#[must_use]
pub fn available_places(capacity: i64, booked: i64) -> u32 {
    u32::try_from((capacity - booked).max(0)).unwrap_or(u32::MAX)
}

/// Ledger stored in the `bookings` table.
#[derive(Debug, Clone)]
pub struct PostgresBookingRepository {
    pool: PgPool,
}

impl PostgresBookingRepository {
    /// Creates a ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_add(&self, booking: &Booking) -> Result<BookingOutcome, BookingError> {
        let mut tx = begin(&self.pool, IsolationLevel::ReadCommitted).await?;

        let show = sqlx::query(
            "SELECT number_of_tickets, external_event_id FROM shows WHERE show_id = $1 FOR UPDATE",
        )
        .bind(booking.show_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BookingError::ShowNotFound(booking.show_id))?;
        let capacity: i32 = show.try_get("number_of_tickets")?;
        let external_event_id: Uuid = show.try_get("external_event_id")?;

        let existing = sqlx::query("SELECT 1 FROM bookings WHERE booking_id = $1")
            .bind(booking.booking_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            tracing::debug!(booking_id = %booking.booking_id, "Booking already exists");
            return Ok(BookingOutcome::AlreadyExists);
        }

        let booked: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(number_of_tickets), 0)::BIGINT FROM bookings WHERE show_id = $1",
        )
        .bind(booking.show_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let available = available_places(i64::from(capacity), booked);
        if available < booking.number_of_tickets {
            return Err(BookingError::NoPlacesLeft {
                requested: booking.number_of_tickets,
                available,
            });
        }

        let inserted = sqlx::query(
            r"
            INSERT INTO bookings (booking_id, show_id, number_of_tickets, customer_email)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(booking.booking_id.as_uuid())
        .bind(booking.show_id.as_uuid())
        .bind(i32::try_from(booking.number_of_tickets).unwrap_or(i32::MAX))
        .bind(&booking.customer_email)
        .execute(&mut *tx)
        .await;
        match inserted {
            Err(e) if is_unique_violation(&e) => return Ok(BookingOutcome::AlreadyExists),
            other => other?,
        };

        PostgresOutbox::enqueue_event(&mut *tx, &booking_made(booking, Some(external_event_id)))
            .await?;
        tx.commit().await?;

        tracing::info!(
            booking_id = %booking.booking_id,
            show_id = %booking.show_id,
            tickets = booking.number_of_tickets,
            "Booking committed"
        );
        Ok(BookingOutcome::Booked)
    }
}

#[async_trait]
impl BookingRepository for PostgresBookingRepository {
    async fn add(&self, booking: &Booking) -> Result<BookingOutcome, BookingError> {
        if booking.number_of_tickets == 0 {
            return Err(BookingError::InvalidTicketCount);
        }
        // The show lock leaves deadlocks as the only conflict left to retry.
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || self.try_add(booking)).await
    }
}
