//! Commands: requests with exactly one handler group.
//!
//! The header's idempotency key names the logical action. The saga derives
//! it from the bundle id, so a command re-issued after a redelivered event
//! carries the key of the original.

use crate::types::{BookingId, ShowId, TicketId};
use serde::{Deserialize, Serialize};
use tickets_core::message::{Command, EventHeader};
use uuid::Uuid;

/// Book seats for a show in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookShowTickets {
    /// Message header
    pub header: EventHeader,
    /// Booking id, stable across retries
    pub booking_id: BookingId,
    /// Customer email
    pub customer_email: String,
    /// Seats requested
    pub number_of_tickets: u32,
    /// Show to book
    pub show_id: ShowId,
}

impl_message!(BookShowTickets, "BookShowTickets");
impl Command for BookShowTickets {}

/// Book flight tickets for the passengers of a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFlight {
    /// Message header
    pub header: EventHeader,
    /// Customer email
    pub customer_email: String,
    /// Flight to book
    pub flight_id: Uuid,
    /// Passenger names
    pub passengers: Vec<String>,
    /// Reference echoed in the resulting event
    pub reference_id: String,
}

impl_message!(BookFlight, "BookFlight");
impl Command for BookFlight {}

/// Book a taxi from the airport to the show.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTaxi {
    /// Message header
    pub header: EventHeader,
    /// Customer email
    pub customer_email: String,
    /// Name the booking is made under
    pub customer_name: String,
    /// Passengers to carry
    pub number_of_passengers: u32,
    /// Reference echoed in the resulting event
    pub reference_id: String,
}

impl_message!(BookTaxi, "BookTaxi");
impl Command for BookTaxi {}

/// Cancel previously booked flight tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelFlightTickets {
    /// Message header
    pub header: EventHeader,
    /// Tickets to cancel
    pub flight_ticket_ids: Vec<Uuid>,
}

impl_message!(CancelFlightTickets, "CancelFlightTickets");
impl Command for CancelFlightTickets {}

/// Void the receipt of a show ticket and refund its payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTicket {
    /// Message header; its idempotency key is required
    pub header: EventHeader,
    /// Ticket to refund
    pub ticket_id: TicketId,
}

impl_message!(RefundTicket, "RefundTicket");
impl Command for RefundTicket {}
