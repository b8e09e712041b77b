//! Command handlers.
//!
//! Results are announced with the idempotency key of the command that caused
//! them, so a redelivered command re-announces the same logical result.

use crate::ledger::{Booking, BookingError, BookingOutcome, BookingRepository};
use crate::messages::{
    BookFlight, BookShowTickets, BookTaxi, BookingFailed, CancelFlightTickets, FlightBooked,
    FlightBookingFailed, RefundTicket, TaxiBooked, TaxiBookingFailed, TicketRefunded,
};
use crate::metrics;
use crate::services::{
    BookFlightRequest, BookTaxiRequest, RefundPaymentRequest, ServiceError, Services,
    VoidReceiptRequest,
};
use anyhow::anyhow;
use std::sync::Arc;
use tickets_core::message::EventHeader;
use tickets_runtime::{EventBus, HandlerError};
use tracing::{debug, info, warn};

const REFUND_REASON: &str = "ticket refunded";

/// Handlers of every command the service accepts.
#[derive(Clone)]
pub struct CommandHandlers {
    bookings: Arc<dyn BookingRepository>,
    services: Services,
    events: EventBus,
}

impl CommandHandlers {
    /// Creates the handlers.
    #[must_use]
    pub fn new(bookings: Arc<dyn BookingRepository>, services: Services, events: EventBus) -> Self {
        Self {
            bookings,
            services,
            events,
        }
    }

    /// Books show seats in the ledger.
    ///
    /// A redelivered booking is a no-op. A full show is announced with
    /// `BookingFailed` and is not an error.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the ledger or the bus is unavailable.
    pub async fn book_show_tickets(&self, command: BookShowTickets) -> Result<(), HandlerError> {
        let booking = Booking {
            booking_id: command.booking_id,
            show_id: command.show_id,
            number_of_tickets: command.number_of_tickets,
            customer_email: command.customer_email,
        };

        match self.bookings.add(&booking).await {
            Ok(BookingOutcome::Booked) => {
                metrics::record_booking_committed(booking.number_of_tickets);
                Ok(())
            },
            Ok(BookingOutcome::AlreadyExists) => {
                metrics::record_booking_redelivered();
                debug!(booking_id = %booking.booking_id, "Booking redelivered, already stored");
                Ok(())
            },
            Err(e @ BookingError::NoPlacesLeft { .. }) => {
                warn!(booking_id = %booking.booking_id, error = %e, "Booking failed");
                metrics::record_booking_sold_out();
                self.events
                    .publish(&BookingFailed {
                        header: EventHeader::with_idempotency_key(command.header.idempotency_key),
                        booking_id: booking.booking_id,
                        failure_reason: e.to_string(),
                    })
                    .await?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Books flight tickets and announces the outcome.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the provider or the bus is unavailable.
    pub async fn book_flight(&self, command: BookFlight) -> Result<(), HandlerError> {
        let key = command.header.idempotency_key;
        let result = self
            .services
            .transportation
            .book_flight(BookFlightRequest {
                customer_email: command.customer_email,
                flight_id: command.flight_id,
                passenger_names: command.passengers,
                reference_id: command.reference_id.clone(),
                idempotency_key: key.clone(),
            })
            .await;

        match result {
            Ok(response) => {
                info!(flight_id = %command.flight_id, reference_id = %command.reference_id, "Flight booked");
                self.events
                    .publish(&FlightBooked {
                        header: EventHeader::with_idempotency_key(key),
                        flight_id: command.flight_id,
                        ticket_ids: response.ticket_ids,
                        reference_id: command.reference_id,
                    })
                    .await?;
            },
            Err(ServiceError::Unavailable(reason)) => {
                warn!(flight_id = %command.flight_id, %reason, "Flight booking failed");
                self.events
                    .publish(&FlightBookingFailed {
                        header: EventHeader::with_idempotency_key(key),
                        flight_id: command.flight_id,
                        failure_reason: reason,
                        reference_id: command.reference_id,
                    })
                    .await?;
            },
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Books a taxi and announces the outcome.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the provider or the bus is unavailable.
    pub async fn book_taxi(&self, command: BookTaxi) -> Result<(), HandlerError> {
        let key = command.header.idempotency_key;
        let result = self
            .services
            .transportation
            .book_taxi(BookTaxiRequest {
                customer_email: command.customer_email,
                number_of_passengers: command.number_of_passengers,
                passenger_name: command.customer_name,
                reference_id: command.reference_id.clone(),
                idempotency_key: key.clone(),
            })
            .await;

        match result {
            Ok(response) => {
                info!(reference_id = %command.reference_id, "Taxi booked");
                self.events
                    .publish(&TaxiBooked {
                        header: EventHeader::with_idempotency_key(key),
                        taxi_booking_id: response.taxi_booking_id,
                        reference_id: command.reference_id,
                    })
                    .await?;
            },
            Err(ServiceError::Unavailable(reason)) => {
                warn!(reference_id = %command.reference_id, %reason, "Taxi booking failed");
                self.events
                    .publish(&TaxiBookingFailed {
                        header: EventHeader::with_idempotency_key(key),
                        failure_reason: reason,
                        reference_id: command.reference_id,
                    })
                    .await?;
            },
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Cancels flight tickets.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the provider is unavailable.
    pub async fn cancel_flight_tickets(&self, command: CancelFlightTickets) -> Result<(), HandlerError> {
        let count = command.flight_ticket_ids.len();
        self.services
            .transportation
            .cancel_flight_tickets(command.flight_ticket_ids)
            .await?;
        info!(tickets = count, "Flight tickets canceled");
        Ok(())
    }

    /// Voids the receipt of a ticket, refunds its payment and announces
    /// `TicketRefunded`.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the command has no idempotency key, or a
    /// transient error if a provider or the bus is unavailable.
    pub async fn refund_ticket(&self, command: RefundTicket) -> Result<(), HandlerError> {
        let key = command.header.idempotency_key;
        if key.is_empty() {
            return Err(HandlerError::permanent(anyhow!(
                "refund of ticket {} has no idempotency key",
                command.ticket_id
            )));
        }

        self.services
            .receipts
            .void_receipt(VoidReceiptRequest {
                ticket_id: command.ticket_id,
                reason: REFUND_REASON.to_string(),
                idempotency_key: key.clone(),
            })
            .await?;
        self.services
            .payments
            .refund_payment(RefundPaymentRequest {
                ticket_id: command.ticket_id,
                refund_reason: REFUND_REASON.to_string(),
                idempotency_key: key.clone(),
            })
            .await?;

        self.events
            .publish(&TicketRefunded {
                header: EventHeader::with_idempotency_key(key),
                ticket_id: command.ticket_id,
            })
            .await?;
        metrics::record_ticket_refunded();
        info!(ticket_id = %command.ticket_id, "Ticket refunded");
        Ok(())
    }
}

impl std::fmt::Debug for CommandHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandlers").finish_non_exhaustive()
    }
}
