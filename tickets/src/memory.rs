//! In-memory storage for tests and local runs.
//!
//! [`InMemoryDatabase`] implements every repository trait over one shared
//! state behind one mutex. Holding that lock while enqueuing into the
//! [`InMemoryOutbox`] stands in for the database transaction, so a domain
//! change and its outbox row appear together or not at all.

use crate::data_lake::{DataLake, DataLakeError, DataLakeEvent};
use crate::ledger::{Booking, BookingError, BookingOutcome, BookingRepository, available_places, booking_made};
use crate::read_model::{
    BookingMerge, OpsBooking, OpsBookingStore, ReadModelError, TicketMerge, has_receipt_issued_on,
};
use crate::shows::{Show, ShowError, ShowRepository};
use crate::ticket_store::{Ticket, TicketError, TicketRepository};
use crate::types::{BookingId, ShowId, TicketId, VipBundleId};
use crate::vip_bundles::{BundleUpdate, VipBundle, VipBundleError, VipBundleRepository, bundle_initialized};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tickets_testing::InMemoryOutbox;
use uuid::Uuid;

/// Locks `mutex`, recovering the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct State {
    shows: BTreeMap<ShowId, Show>,
    bookings: HashMap<BookingId, Booking>,
    tickets: BTreeMap<TicketId, Ticket>,
    vip_bundles: HashMap<VipBundleId, VipBundle>,
    ops_bookings: BTreeMap<BookingId, OpsBooking>,
    data_lake: HashMap<Uuid, DataLakeEvent>,
}

/// Every store of the service, in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    outbox: InMemoryOutbox,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox the stores enqueue into.
    #[must_use]
    pub fn outbox(&self) -> InMemoryOutbox {
        self.outbox.clone()
    }

    /// Every stored booking.
    #[must_use]
    pub fn bookings(&self) -> Vec<Booking> {
        lock(&self.state).bookings.values().cloned().collect()
    }
}

#[async_trait]
impl BookingRepository for InMemoryDatabase {
    async fn add(&self, booking: &Booking) -> Result<BookingOutcome, BookingError> {
        if booking.number_of_tickets == 0 {
            return Err(BookingError::InvalidTicketCount);
        }

        let mut state = lock(&self.state);
        if state.bookings.contains_key(&booking.booking_id) {
            return Ok(BookingOutcome::AlreadyExists);
        }
        let show = state
            .shows
            .get(&booking.show_id)
            .ok_or(BookingError::ShowNotFound(booking.show_id))?;

        let booked: i64 = state
            .bookings
            .values()
            .filter(|b| b.show_id == booking.show_id)
            .map(|b| i64::from(b.number_of_tickets))
            .sum();
        let available = available_places(i64::from(show.number_of_tickets), booked);
        if available < booking.number_of_tickets {
            return Err(BookingError::NoPlacesLeft {
                requested: booking.number_of_tickets,
                available,
            });
        }

        self.outbox
            .enqueue_event(&booking_made(booking, Some(show.external_event_id)))?;
        state.bookings.insert(booking.booking_id, booking.clone());
        Ok(BookingOutcome::Booked)
    }
}

#[async_trait]
impl ShowRepository for InMemoryDatabase {
    async fn add(&self, show: &Show) -> Result<(), ShowError> {
        lock(&self.state).shows.entry(show.show_id).or_insert_with(|| show.clone());
        Ok(())
    }

    async fn get(&self, show_id: ShowId) -> Result<Show, ShowError> {
        lock(&self.state)
            .shows
            .get(&show_id)
            .cloned()
            .ok_or(ShowError::NotFound(show_id))
    }

    async fn all(&self) -> Result<Vec<Show>, ShowError> {
        Ok(lock(&self.state).shows.values().cloned().collect())
    }
}

#[async_trait]
impl TicketRepository for InMemoryDatabase {
    async fn add(&self, ticket: &Ticket) -> Result<(), TicketError> {
        lock(&self.state)
            .tickets
            .entry(ticket.ticket_id)
            .or_insert_with(|| ticket.clone());
        Ok(())
    }

    async fn remove(&self, ticket_id: TicketId) -> Result<(), TicketError> {
        lock(&self.state).tickets.remove(&ticket_id);
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Ticket>, TicketError> {
        Ok(lock(&self.state).tickets.values().cloned().collect())
    }
}

impl InMemoryDatabase {
    fn update_bundle(
        state: &mut State,
        id: VipBundleId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        let current = state
            .vip_bundles
            .get(&id)
            .cloned()
            .ok_or(VipBundleError::NotFound(id))?;
        let updated = update(current)?;
        state.vip_bundles.insert(id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl VipBundleRepository for InMemoryDatabase {
    async fn add(&self, bundle: &VipBundle) -> Result<(), VipBundleError> {
        let mut state = lock(&self.state);
        if state.vip_bundles.contains_key(&bundle.vip_bundle_id) {
            return Err(VipBundleError::AlreadyExists(bundle.vip_bundle_id));
        }
        self.outbox.enqueue_event(&bundle_initialized(bundle))?;
        state.vip_bundles.insert(bundle.vip_bundle_id, bundle.clone());
        Ok(())
    }

    async fn get(&self, id: VipBundleId) -> Result<VipBundle, VipBundleError> {
        lock(&self.state)
            .vip_bundles
            .get(&id)
            .cloned()
            .ok_or(VipBundleError::NotFound(id))
    }

    async fn get_by_booking_id(&self, booking_id: BookingId) -> Result<VipBundle, VipBundleError> {
        lock(&self.state)
            .vip_bundles
            .values()
            .find(|b| b.booking_id == booking_id)
            .cloned()
            .ok_or(VipBundleError::NotFoundForBooking(booking_id))
    }

    async fn update_by_id(
        &self,
        id: VipBundleId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        let mut state = lock(&self.state);
        Self::update_bundle(&mut state, id, update)
    }

    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        update: BundleUpdate<'_>,
    ) -> Result<VipBundle, VipBundleError> {
        let mut state = lock(&self.state);
        let id = state
            .vip_bundles
            .values()
            .find(|b| b.booking_id == booking_id)
            .map(|b| b.vip_bundle_id)
            .ok_or(VipBundleError::NotFoundForBooking(booking_id))?;
        Self::update_bundle(&mut state, id, update)
    }
}

#[async_trait]
impl OpsBookingStore for InMemoryDatabase {
    async fn insert_if_absent(&self, booking: &OpsBooking) -> Result<bool, ReadModelError> {
        let mut state = lock(&self.state);
        if state.ops_bookings.contains_key(&booking.booking_id) {
            return Ok(false);
        }
        state.ops_bookings.insert(booking.booking_id, booking.clone());
        Ok(true)
    }

    async fn update_by_booking_id(
        &self,
        booking_id: BookingId,
        merge: BookingMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        let mut state = lock(&self.state);
        let booking = state
            .ops_bookings
            .get_mut(&booking_id)
            .ok_or_else(|| ReadModelError::NotReady(format!("booking {booking_id} not created yet")))?;
        merge(booking);
        booking.last_update = Utc::now();
        Ok(booking.clone())
    }

    async fn update_by_ticket_id(
        &self,
        ticket_id: TicketId,
        merge: TicketMerge<'_>,
    ) -> Result<OpsBooking, ReadModelError> {
        let mut state = lock(&self.state);
        let booking = state
            .ops_bookings
            .values_mut()
            .find(|b| b.tickets.contains_key(&ticket_id))
            .ok_or_else(|| ReadModelError::NotReady(format!("ticket {ticket_id} not confirmed yet")))?;
        if let Some(ticket) = booking.tickets.get_mut(&ticket_id) {
            merge(ticket);
        }
        booking.last_update = Utc::now();
        Ok(booking.clone())
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<OpsBooking>, ReadModelError> {
        Ok(lock(&self.state).ops_bookings.get(&booking_id).cloned())
    }

    async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>, ReadModelError> {
        let state = lock(&self.state);
        Ok(state
            .ops_bookings
            .values()
            .filter(|b| receipt_issue_date.is_none_or(|date| has_receipt_issued_on(b, date)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DataLake for InMemoryDatabase {
    async fn store(&self, event: &DataLakeEvent) -> Result<(), DataLakeError> {
        lock(&self.state)
            .data_lake
            .entry(event.event_id)
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<DataLakeEvent>, DataLakeError> {
        let mut events: Vec<_> = lock(&self.state).data_lake.values().cloned().collect();
        events.sort_by_key(|e| (e.published_at, e.event_id));
        Ok(events)
    }
}
