//! Capability interfaces of the external providers the service talks to.
//!
//! Every call either succeeds, reports [`ServiceError::Unavailable`] (a
//! business outcome such as a fully booked flight, which the saga handles as
//! a normal failure path) or reports [`ServiceError::Transient`], which the
//! handler turns into a retry. Calls that take an idempotency key must be safe
//! to repeat with the same key.
//!
//! The concrete HTTP clients are out of scope; [`mocks`] provides in-process
//! implementations used by the tests and the server binary.

use crate::types::{BookingId, Money, TicketId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod mocks;

/// Outcome of a failed provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The provider cannot serve this request (no seats, no taxis).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The provider could not be reached or failed; the call may be repeated.
    #[error("transient provider error: {0}")]
    Transient(String),
}

/// Flight booking request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookFlightRequest {
    /// Customer email
    pub customer_email: String,
    /// Flight to book
    pub flight_id: Uuid,
    /// One ticket is booked per passenger
    pub passenger_names: Vec<String>,
    /// Reference of the requester
    pub reference_id: String,
    /// Repeating a request with this key books nothing new
    pub idempotency_key: String,
}

/// Booked flight tickets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookFlightResponse {
    /// One ticket per passenger
    pub ticket_ids: Vec<Uuid>,
}

/// Taxi booking request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookTaxiRequest {
    /// Customer email
    pub customer_email: String,
    /// Passengers to carry
    pub number_of_passengers: u32,
    /// Name the booking is made under
    pub passenger_name: String,
    /// Reference of the requester
    pub reference_id: String,
    /// Repeating a request with this key books nothing new
    pub idempotency_key: String,
}

/// Booked taxi.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookTaxiResponse {
    /// Booking id at the taxi provider
    pub taxi_booking_id: Uuid,
}

/// Flights and taxis.
#[async_trait]
pub trait TransportationService: Send + Sync {
    /// Books one flight ticket per passenger.
    async fn book_flight(&self, request: BookFlightRequest) -> Result<BookFlightResponse, ServiceError>;

    /// Books a taxi.
    async fn book_taxi(&self, request: BookTaxiRequest) -> Result<BookTaxiResponse, ServiceError>;

    /// Cancels flight tickets. Canceling an already canceled ticket succeeds.
    async fn cancel_flight_tickets(&self, ticket_ids: Vec<Uuid>) -> Result<(), ServiceError>;
}

/// Receipt request for a confirmed ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueReceiptRequest {
    /// Ticket id
    pub ticket_id: TicketId,
    /// Ticket price
    pub price: Money,
    /// Repeating a request with this key returns the original receipt
    pub idempotency_key: String,
}

/// An issued receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueReceiptResponse {
    /// Receipt number
    pub receipt_number: String,
    /// When the receipt was issued
    pub issued_at: DateTime<Utc>,
}

/// Request to void a ticket's receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoidReceiptRequest {
    /// Ticket id
    pub ticket_id: TicketId,
    /// Reason shown on the void
    pub reason: String,
    /// Repeating a request with this key voids nothing new
    pub idempotency_key: String,
}

/// Receipts provider.
#[async_trait]
pub trait ReceiptsService: Send + Sync {
    /// Issues a receipt.
    async fn issue_receipt(&self, request: IssueReceiptRequest) -> Result<IssueReceiptResponse, ServiceError>;

    /// Voids a receipt.
    async fn void_receipt(&self, request: VoidReceiptRequest) -> Result<(), ServiceError>;
}

/// Request to refund a ticket's payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefundPaymentRequest {
    /// Ticket id
    pub ticket_id: TicketId,
    /// Reason of the refund
    pub refund_reason: String,
    /// Repeating a request with this key refunds nothing new
    pub idempotency_key: String,
}

/// Payments provider.
#[async_trait]
pub trait PaymentsService: Send + Sync {
    /// Refunds a payment.
    async fn refund_payment(&self, request: RefundPaymentRequest) -> Result<(), ServiceError>;
}

/// Spreadsheets used by the operations team.
#[async_trait]
pub trait SpreadsheetsApi: Send + Sync {
    /// Appends `row` to `sheet`.
    async fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), ServiceError>;
}

/// File storage.
#[async_trait]
pub trait FilesApi: Send + Sync {
    /// Stores `content` under `file_id`, replacing an existing file.
    async fn upload_file(&self, file_id: &str, content: &str) -> Result<(), ServiceError>;
}

/// Reservation of places at the show's external ticket provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderBooking {
    /// Customer email
    pub customer_email: String,
    /// Event id of the show at the provider
    pub external_event_id: Uuid,
    /// Places to reserve
    pub number_of_tickets: u32,
    /// Our booking id, the provider's idempotency key
    pub booking_id: BookingId,
}

/// External ticket provider that owns the physical seats of a show.
#[async_trait]
pub trait TicketProvider: Send + Sync {
    /// Reserves places for a booking.
    async fn book_places(&self, booking: ProviderBooking) -> Result<(), ServiceError>;
}

/// Every provider the handlers need.
#[derive(Clone)]
pub struct Services {
    /// Flights and taxis
    pub transportation: Arc<dyn TransportationService>,
    /// Receipts
    pub receipts: Arc<dyn ReceiptsService>,
    /// Payments
    pub payments: Arc<dyn PaymentsService>,
    /// Spreadsheets
    pub spreadsheets: Arc<dyn SpreadsheetsApi>,
    /// File storage
    pub files: Arc<dyn FilesApi>,
    /// External ticket provider
    pub ticket_provider: Arc<dyn TicketProvider>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
