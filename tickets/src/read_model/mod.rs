//! Ops read model: one document per booking for the operations team.
//!
//! Documents are created by `BookingMade` and merged by every later event that
//! names the booking or one of its tickets. Events arrive in any order and
//! more than once, so:
//!
//! - creation is insert-or-ignore and never overwrites a document another
//!   event already advanced
//! - an update whose document does not exist yet fails with
//!   [`ReadModelError::NotReady`], which the processor retries
//! - merges are field-level and never downgrade a refunded ticket
//!
//! [`projector::OpsReadModel`] applies events, [`postgres::PostgresOpsBookings`]
//! stores documents, and [`rebuild`] replays the data lake.

use crate::types::{BookingId, Money, TicketId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tickets_core::event_bus::BusError;
use tickets_postgres::{ConflictError, is_serialization_failure};

pub mod postgres;
pub mod projector;
pub mod rebuild;

pub use postgres::PostgresOpsBookings;
pub use projector::OpsReadModel;
pub use rebuild::{RebuildError, RebuildOptions, RebuildReport, rebuild_from_data_lake};

/// Lifecycle of a ticket as operations see it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Confirmed by the ticket provider
    #[default]
    Confirmed,
    /// Receipt voided and payment refunded
    Refunded,
}

/// A ticket inside an [`OpsBooking`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsTicket {
    /// Price paid
    pub price: Money,
    /// Customer email
    pub customer_email: String,
    /// Current status
    pub status: TicketStatus,
    /// Receipt number, once issued
    pub receipt_number: Option<String>,
    /// When the receipt was issued
    pub receipt_issued_at: Option<DateTime<Utc>>,
    /// When the printable ticket was uploaded
    pub printed_at: Option<DateTime<Utc>>,
    /// Name of the uploaded file
    pub printed_file_name: Option<String>,
}

impl OpsTicket {
    /// A freshly confirmed ticket.
    #[must_use]
    pub const fn confirmed(price: Money, customer_email: String) -> Self {
        Self {
            price,
            customer_email,
            status: TicketStatus::Confirmed,
            receipt_number: None,
            receipt_issued_at: None,
            printed_at: None,
            printed_file_name: None,
        }
    }
}

/// The document of one booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsBooking {
    /// Booking id
    pub booking_id: BookingId,
    /// When the booking was made
    pub booked_at: DateTime<Utc>,
    /// When the document last changed
    pub last_update: DateTime<Utc>,
    /// Tickets of the booking
    #[serde(default)]
    pub tickets: BTreeMap<TicketId, OpsTicket>,
}

/// Read model errors.
#[derive(Error, Debug)]
pub enum ReadModelError {
    /// The document an event updates does not exist yet.
    #[error("Read model not ready: {0}")]
    NotReady(String),

    /// A stored document could not be encoded or decoded.
    #[error("Read model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The change notification could not be published.
    #[error("Read model notification failed: {0}")]
    Publish(#[from] BusError),

    /// The store failed.
    #[error("Read model storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ConflictError for ReadModelError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Database(e) => is_serialization_failure(e),
            _ => false,
        }
    }
}

/// Merge applied to a whole document.
pub type BookingMerge<'a> = &'a (dyn Fn(&mut OpsBooking) + Send + Sync);

/// Merge applied to one ticket of a document.
pub type TicketMerge<'a> = &'a (dyn Fn(&mut OpsTicket) + Send + Sync);

/// Document store of the read model.
///
/// Stores stamp `last_update` whenever they persist a document.
#[async_trait]
pub trait OpsBookingStore: Send + Sync {
    /// Stores `booking` unless a document for its id exists. Returns whether
    /// it was stored.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    async fn insert_if_absent(&self, booking: &OpsBooking) -> Result<bool, ReadModelError>;

    /// Merges into the document of `booking_id` and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if the document does not exist.
    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        merge: BookingMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError>;

    /// Merges into the ticket `ticket_id`, wherever it is, and returns the
    /// document holding it.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if no document holds the ticket.
    async fn update_by_ticket_id(
        &self,
        ticket_id: TicketId,
        merge: TicketMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError>;

    /// The document of a booking.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    async fn get(&self, booking_id: BookingId) -> Result<Option<OpsBooking>, ReadModelError>;

    /// Every document, or only those with a receipt issued on
    /// `receipt_issue_date`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>, ReadModelError>;
}

/// Whether any ticket of `booking` had its receipt issued on `date`.
#[must_use]
pub fn has_receipt_issued_on(booking: &OpsBooking, date: NaiveDate) -> bool {
    booking
        .tickets
        .values()
        .filter_map(|t| t.receipt_issued_at)
        .any(|issued| issued.date_naive() == date)
}
