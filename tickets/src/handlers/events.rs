//! Event handlers with side effects outside the saga.

use crate::data_lake::{DataLake, DataLakeEvent};
use crate::messages::{
    BookingMade, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted, TicketReceiptIssued,
};
use crate::services::{IssueReceiptRequest, ProviderBooking, Services};
use crate::shows::ShowRepository;
use crate::ticket_store::{Ticket, TicketRepository};
use crate::types::TicketId;
use std::sync::Arc;
use tickets_core::message::{EventHeader, SerializedMessage};
use tickets_runtime::{EventBus, HandlerError};
use tracing::{debug, info};

/// Sheet of confirmed tickets waiting to be printed.
pub const TICKETS_TO_PRINT_SHEET: &str = "tickets-to-print";

/// Sheet of canceled tickets waiting to be refunded.
pub const TICKETS_TO_REFUND_SHEET: &str = "tickets-to-refund";

/// Name of the printable file of a ticket.
#[must_use]
pub fn ticket_file_name(ticket_id: TicketId) -> String {
    format!("{ticket_id}-ticket.html")
}

fn ticket_html(event: &TicketBookingConfirmed) -> String {
    format!(
        "<html><head><title>Ticket</title></head><body><h1>Ticket {}</h1><p>Price: {} {}</p></body></html>",
        event.ticket_id, event.price.amount, event.price.currency
    )
}

/// Handlers reacting to ticket and booking events.
#[derive(Clone)]
pub struct EventHandlers {
    shows: Arc<dyn ShowRepository>,
    tickets: Arc<dyn TicketRepository>,
    data_lake: Arc<dyn DataLake>,
    services: Services,
    events: EventBus,
}

impl EventHandlers {
    /// Creates the handlers.
    #[must_use]
    pub fn new(
        shows: Arc<dyn ShowRepository>,
        tickets: Arc<dyn TicketRepository>,
        data_lake: Arc<dyn DataLake>,
        services: Services,
        events: EventBus,
    ) -> Self {
        Self {
            shows,
            tickets,
            data_lake,
            services,
            events,
        }
    }

    /// Issues a receipt for a confirmed ticket and announces it.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the receipts provider or the bus fails.
    pub async fn issue_receipt(&self, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        info!(ticket_id = %event.ticket_id, "Issuing receipt");
        let key = event.header.idempotency_key;
        let receipt = self
            .services
            .receipts
            .issue_receipt(IssueReceiptRequest {
                ticket_id: event.ticket_id,
                price: event.price,
                idempotency_key: key.clone(),
            })
            .await?;

        self.events
            .publish(&TicketReceiptIssued {
                header: EventHeader::with_idempotency_key(key),
                ticket_id: event.ticket_id,
                receipt_number: receipt.receipt_number,
                issued_at: receipt.issued_at,
            })
            .await?;
        Ok(())
    }

    /// Adds a confirmed ticket to the print sheet.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the spreadsheet is unavailable.
    pub async fn append_to_tracker(&self, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        debug!(ticket_id = %event.ticket_id, "Appending ticket to the tracker");
        self.services
            .spreadsheets
            .append_row(
                TICKETS_TO_PRINT_SHEET,
                vec![
                    event.ticket_id.to_string(),
                    event.customer_email,
                    event.price.amount,
                    event.price.currency,
                ],
            )
            .await?;
        Ok(())
    }

    /// Adds a canceled ticket to the refund sheet.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the spreadsheet is unavailable.
    pub async fn tickets_to_refund(&self, event: TicketBookingCanceled) -> Result<(), HandlerError> {
        debug!(ticket_id = %event.ticket_id, "Adding ticket refund to sheet");
        self.services
            .spreadsheets
            .append_row(
                TICKETS_TO_REFUND_SHEET,
                vec![
                    event.ticket_id.to_string(),
                    event.customer_email,
                    event.price.amount,
                    event.price.currency,
                ],
            )
            .await?;
        Ok(())
    }

    /// Stores a confirmed ticket.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the database is unavailable.
    pub async fn store_ticket(&self, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        self.tickets
            .add(&Ticket {
                ticket_id: event.ticket_id,
                price: event.price,
                customer_email: event.customer_email,
            })
            .await?;
        Ok(())
    }

    /// Removes a canceled ticket.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the database is unavailable.
    pub async fn remove_canceled_ticket(&self, event: TicketBookingCanceled) -> Result<(), HandlerError> {
        self.tickets.remove(event.ticket_id).await?;
        Ok(())
    }

    /// Uploads the printable ticket and announces `TicketPrinted`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if file storage or the bus fails.
    pub async fn print_ticket(&self, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        info!(ticket_id = %event.ticket_id, "Printing ticket");
        let file_name = ticket_file_name(event.ticket_id);
        self.services
            .files
            .upload_file(&file_name, &ticket_html(&event))
            .await?;

        self.events
            .publish(&TicketPrinted {
                header: EventHeader::with_idempotency_key(event.header.idempotency_key),
                ticket_id: event.ticket_id,
                file_name,
            })
            .await?;
        Ok(())
    }

    /// Reserves the booked places at the show's external provider.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the show is unknown, or a transient error
    /// if the provider or the database fails.
    pub async fn book_place_in_provider(&self, event: BookingMade) -> Result<(), HandlerError> {
        let external_event_id = match event.external_event_id {
            Some(id) => id,
            None => self.shows.get(event.show_id).await?.external_event_id,
        };

        self.services
            .ticket_provider
            .book_places(ProviderBooking {
                customer_email: event.customer_email,
                external_event_id,
                number_of_tickets: event.number_of_tickets,
                booking_id: event.booking_id,
            })
            .await?;
        info!(booking_id = %event.booking_id, "Places booked at the ticket provider");
        Ok(())
    }

    /// Archives a published event in the data lake.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the payload has no header, or a transient
    /// error if the database fails.
    pub async fn store_in_data_lake(&self, message: SerializedMessage) -> Result<(), HandlerError> {
        let event = DataLakeEvent::from_message(&message)?;
        self.data_lake.store(&event).await?;
        debug!(event_id = %event.event_id, event = %event.event_name, "Event archived");
        Ok(())
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers").finish_non_exhaustive()
    }
}
