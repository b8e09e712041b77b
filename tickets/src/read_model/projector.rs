//! Applies events to the ops read model.

use super::{OpsBooking, OpsBookingStore, OpsTicket, ReadModelError, TicketStatus};
use crate::messages::{
    BookingMade, InternalOpsReadModelUpdated, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued, TicketRefunded, TicketsEvent,
};
use crate::types::BookingId;
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tickets_core::message::EventHeader;
use tickets_runtime::EventBus;
use tracing::debug;

/// The ops read model projector.
///
/// Every successful change is followed by an internal
/// `InternalOpsReadModelUpdated` event naming the booking.
#[derive(Clone)]
pub struct OpsReadModel {
    store: Arc<dyn OpsBookingStore>,
    events: EventBus,
}

impl OpsReadModel {
    /// Creates a projector over `store` that announces changes on `events`.
    #[must_use]
    pub fn new(store: Arc<dyn OpsBookingStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Creates the document of a new booking, unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns a storage or publish error.
    pub async fn on_booking_made(&self, event: &BookingMade) -> Result<(), ReadModelError> {
        let now = Utc::now();
        let created = self
            .store
            .insert_if_absent(&OpsBooking {
                booking_id: event.booking_id,
                booked_at: event.header.published_at,
                last_update: now,
                tickets: BTreeMap::new(),
            })
            .await?;

        if created {
            self.notify(event.booking_id).await
        } else {
            debug!(booking_id = %event.booking_id, "Read model already exists");
            Ok(())
        }
    }

    /// Adds or refreshes a confirmed ticket. A refunded ticket stays refunded.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if the booking has no document yet.
    pub async fn on_ticket_booking_confirmed(
        &self,
        event: &TicketBookingConfirmed,
    ) -> Result<(), ReadModelError> {
        let merge = |booking: &mut OpsBooking| {
            booking
                .tickets
                .entry(event.ticket_id)
                .and_modify(|ticket| {
                    ticket.price = event.price.clone();
                    ticket.customer_email = event.customer_email.clone();
                })
                .or_insert_with(|| {
                    OpsTicket::confirmed(event.price.clone(), event.customer_email.clone())
                });
        };
        let booking = self.store.update_by_booking_id(event.booking_id, &merge).await?;
        self.notify(booking.booking_id).await
    }

    /// Records the receipt of a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if the ticket is not confirmed yet.
    pub async fn on_ticket_receipt_issued(
        &self,
        event: &TicketReceiptIssued,
    ) -> Result<(), ReadModelError> {
        let merge = |ticket: &mut OpsTicket| {
            ticket.receipt_number = Some(event.receipt_number.clone());
            ticket.receipt_issued_at = Some(event.issued_at);
        };
        let booking = self.store.update_by_ticket_id(event.ticket_id, &merge).await?;
        self.notify(booking.booking_id).await
    }

    /// Records the printable ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if the ticket is not confirmed yet.
    pub async fn on_ticket_printed(&self, event: &TicketPrinted) -> Result<(), ReadModelError> {
        let merge = |ticket: &mut OpsTicket| {
            ticket.printed_at = Some(event.header.published_at);
            ticket.printed_file_name = Some(event.file_name.clone());
        };
        let booking = self.store.update_by_ticket_id(event.ticket_id, &merge).await?;
        self.notify(booking.booking_id).await
    }

    /// Marks a ticket refunded.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::NotReady`] if the ticket is not confirmed yet.
    pub async fn on_ticket_refunded(&self, event: &TicketRefunded) -> Result<(), ReadModelError> {
        let merge = |ticket: &mut OpsTicket| ticket.status = TicketStatus::Refunded;
        let booking = self.store.update_by_ticket_id(event.ticket_id, &merge).await?;
        self.notify(booking.booking_id).await
    }

    /// Applies any catalog event. Returns `false` for events the read model
    /// does not consume.
    ///
    /// # Errors
    ///
    /// Returns the error of the matching `on_*` method.
    pub async fn apply(&self, event: &TicketsEvent) -> Result<bool, ReadModelError> {
        match event {
            TicketsEvent::BookingMade(e) => self.on_booking_made(e).await?,
            TicketsEvent::TicketBookingConfirmed(e) => self.on_ticket_booking_confirmed(e).await?,
            TicketsEvent::TicketReceiptIssued(e) => self.on_ticket_receipt_issued(e).await?,
            TicketsEvent::TicketPrinted(e) => self.on_ticket_printed(e).await?,
            TicketsEvent::TicketRefunded(e) => self.on_ticket_refunded(e).await?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// The document of a booking.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn booking(&self, booking_id: BookingId) -> Result<Option<OpsBooking>, ReadModelError> {
        self.store.get(booking_id).await
    }

    /// Every document, optionally only those with a receipt issued on a date.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>, ReadModelError> {
        self.store.all(receipt_issue_date).await
    }

    async fn notify(&self, booking_id: BookingId) -> Result<(), ReadModelError> {
        self.events
            .publish(&InternalOpsReadModelUpdated {
                header: EventHeader::new(),
                booking_id,
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for OpsReadModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsReadModel").finish_non_exhaustive()
    }
}
