//! In-process providers.
//!
//! Each mock records what it was asked to do and honours idempotency keys the
//! way the real providers do. Failure switches let tests drive the unhappy
//! paths: a flight without seats, no taxis, or a burst of transient errors.

use super::{
    BookFlightRequest, BookFlightResponse, BookTaxiRequest, BookTaxiResponse, FilesApi,
    IssueReceiptRequest, IssueReceiptResponse, PaymentsService, ProviderBooking,
    ReceiptsService, RefundPaymentRequest, ServiceError, Services, SpreadsheetsApi,
    TicketProvider, TransportationService, VoidReceiptRequest,
};
use crate::memory::lock;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Counts down injected transient failures.
#[derive(Debug, Default)]
struct FailureSwitch(AtomicUsize);

impl FailureSwitch {
    fn arm(&self, count: usize) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn trip(&self, provider: &str) -> Result<(), ServiceError> {
        let tripped = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(ServiceError::Transient(format!("{provider} timed out")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct TransportationState {
    flights: HashMap<String, BookFlightResponse>,
    flight_requests: Vec<BookFlightRequest>,
    taxis: HashMap<String, BookTaxiResponse>,
    taxi_requests: Vec<BookTaxiRequest>,
    canceled: Vec<Uuid>,
    full_flights: HashSet<Uuid>,
    no_taxis: bool,
}

/// Flights and taxis.
#[derive(Debug, Default)]
pub struct MockTransportation {
    state: Mutex<TransportationState>,
    failures: FailureSwitch,
}

impl MockTransportation {
    /// Creates a provider where every flight and taxi is available.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `flight_id` report no seats.
    pub fn make_flight_full(&self, flight_id: Uuid) {
        lock(&self.state).full_flights.insert(flight_id);
    }

    /// Makes every taxi booking report no taxis.
    pub fn make_taxis_unavailable(&self) {
        lock(&self.state).no_taxis = true;
    }

    /// Fails the next `count` calls with a transient error.
    pub fn fail_next_calls(&self, count: usize) {
        self.failures.arm(count);
    }

    /// Distinct flight bookings, in order.
    #[must_use]
    pub fn flight_bookings(&self) -> Vec<BookFlightRequest> {
        lock(&self.state).flight_requests.clone()
    }

    /// Distinct taxi bookings, in order.
    #[must_use]
    pub fn taxi_bookings(&self) -> Vec<BookTaxiRequest> {
        lock(&self.state).taxi_requests.clone()
    }

    /// Every canceled flight ticket.
    #[must_use]
    pub fn canceled_tickets(&self) -> Vec<Uuid> {
        lock(&self.state).canceled.clone()
    }
}

#[async_trait]
impl TransportationService for MockTransportation {
    async fn book_flight(&self, request: BookFlightRequest) -> Result<BookFlightResponse, ServiceError> {
        self.failures.trip("transportation")?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.flights.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        if state.full_flights.contains(&request.flight_id) {
            return Err(ServiceError::Unavailable("no flight tickets available".into()));
        }

        let response = BookFlightResponse {
            ticket_ids: request.passenger_names.iter().map(|_| Uuid::new_v4()).collect(),
        };
        state.flights.insert(request.idempotency_key.clone(), response.clone());
        state.flight_requests.push(request);
        Ok(response)
    }

    async fn book_taxi(&self, request: BookTaxiRequest) -> Result<BookTaxiResponse, ServiceError> {
        self.failures.trip("transportation")?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.taxis.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        if state.no_taxis {
            return Err(ServiceError::Unavailable("no taxi available".into()));
        }

        let response = BookTaxiResponse {
            taxi_booking_id: Uuid::new_v4(),
        };
        state.taxis.insert(request.idempotency_key.clone(), response.clone());
        state.taxi_requests.push(request);
        Ok(response)
    }

    async fn cancel_flight_tickets(&self, ticket_ids: Vec<Uuid>) -> Result<(), ServiceError> {
        self.failures.trip("transportation")?;
        let mut state = lock(&self.state);
        for id in ticket_ids {
            if !state.canceled.contains(&id) {
                state.canceled.push(id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReceiptsState {
    issued: HashMap<String, IssueReceiptResponse>,
    issue_requests: Vec<IssueReceiptRequest>,
    voided: Vec<VoidReceiptRequest>,
}

/// Receipts provider.
#[derive(Debug, Default)]
pub struct MockReceipts {
    state: Mutex<ReceiptsState>,
    failures: FailureSwitch,
}

impl MockReceipts {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` calls with a transient error.
    pub fn fail_next_calls(&self, count: usize) {
        self.failures.arm(count);
    }

    /// Distinct receipts issued, in order.
    #[must_use]
    pub fn issued(&self) -> Vec<IssueReceiptRequest> {
        lock(&self.state).issue_requests.clone()
    }

    /// Distinct receipts voided, in order.
    #[must_use]
    pub fn voided(&self) -> Vec<VoidReceiptRequest> {
        lock(&self.state).voided.clone()
    }
}

#[async_trait]
impl ReceiptsService for MockReceipts {
    async fn issue_receipt(&self, request: IssueReceiptRequest) -> Result<IssueReceiptResponse, ServiceError> {
        self.failures.trip("receipts")?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.issued.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let response = IssueReceiptResponse {
            receipt_number: format!("R-{:06}", state.issue_requests.len() + 1),
            issued_at: Utc::now(),
        };
        state.issued.insert(request.idempotency_key.clone(), response.clone());
        state.issue_requests.push(request);
        Ok(response)
    }

    async fn void_receipt(&self, request: VoidReceiptRequest) -> Result<(), ServiceError> {
        self.failures.trip("receipts")?;
        let mut state = lock(&self.state);
        if !state.voided.iter().any(|v| v.idempotency_key == request.idempotency_key) {
            state.voided.push(request);
        }
        Ok(())
    }
}

/// Payments provider.
#[derive(Debug, Default)]
pub struct MockPayments {
    refunds: Mutex<Vec<RefundPaymentRequest>>,
    failures: FailureSwitch,
}

impl MockPayments {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` calls with a transient error.
    pub fn fail_next_calls(&self, count: usize) {
        self.failures.arm(count);
    }

    /// Distinct refunds, in order.
    #[must_use]
    pub fn refunds(&self) -> Vec<RefundPaymentRequest> {
        lock(&self.refunds).clone()
    }
}

#[async_trait]
impl PaymentsService for MockPayments {
    async fn refund_payment(&self, request: RefundPaymentRequest) -> Result<(), ServiceError> {
        self.failures.trip("payments")?;
        let mut refunds = lock(&self.refunds);
        if !refunds.iter().any(|r| r.idempotency_key == request.idempotency_key) {
            refunds.push(request);
        }
        Ok(())
    }
}

/// Spreadsheets.
#[derive(Debug, Default)]
pub struct MockSpreadsheets {
    sheets: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
}

impl MockSpreadsheets {
    /// Creates empty sheets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `sheet`, in order.
    #[must_use]
    pub fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        lock(&self.sheets).get(sheet).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SpreadsheetsApi for MockSpreadsheets {
    async fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), ServiceError> {
        lock(&self.sheets).entry(sheet.to_string()).or_default().push(row);
        Ok(())
    }
}

/// File storage.
#[derive(Debug, Default)]
pub struct MockFiles {
    files: Mutex<HashMap<String, String>>,
}

impl MockFiles {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of `file_id`, if stored.
    #[must_use]
    pub fn file(&self, file_id: &str) -> Option<String> {
        lock(&self.files).get(file_id).cloned()
    }

    /// Number of stored files.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    /// Whether no file is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FilesApi for MockFiles {
    async fn upload_file(&self, file_id: &str, content: &str) -> Result<(), ServiceError> {
        lock(&self.files).insert(file_id.to_string(), content.to_string());
        Ok(())
    }
}

/// External ticket provider.
#[derive(Debug, Default)]
pub struct MockTicketProvider {
    bookings: Mutex<Vec<ProviderBooking>>,
}

impl MockTicketProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct reservations, in order.
    #[must_use]
    pub fn bookings(&self) -> Vec<ProviderBooking> {
        lock(&self.bookings).clone()
    }
}

#[async_trait]
impl TicketProvider for MockTicketProvider {
    async fn book_places(&self, booking: ProviderBooking) -> Result<(), ServiceError> {
        let mut bookings = lock(&self.bookings);
        if !bookings.iter().any(|b| b.booking_id == booking.booking_id) {
            bookings.push(booking);
        }
        Ok(())
    }
}

/// One mock of every provider, kept as concrete types for inspection.
#[derive(Clone, Debug, Default)]
pub struct MockServices {
    /// Flights and taxis
    pub transportation: Arc<MockTransportation>,
    /// Receipts
    pub receipts: Arc<MockReceipts>,
    /// Payments
    pub payments: Arc<MockPayments>,
    /// Spreadsheets
    pub spreadsheets: Arc<MockSpreadsheets>,
    /// File storage
    pub files: Arc<MockFiles>,
    /// External ticket provider
    pub ticket_provider: Arc<MockTicketProvider>,
}

impl MockServices {
    /// Creates a fresh set of mocks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The mocks as the trait objects handlers depend on.
    #[must_use]
    pub fn services(&self) -> Services {
        Services {
            transportation: self.transportation.clone(),
            receipts: self.receipts.clone(),
            payments: self.payments.clone(),
            spreadsheets: self.spreadsheets.clone(),
            files: self.files.clone(),
            ticket_provider: self.ticket_provider.clone(),
        }
    }
}
