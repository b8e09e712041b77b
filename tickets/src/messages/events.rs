//! Events published by the tickets service and its collaborators.

use crate::types::{BookingId, Money, ShowId, TicketId, VipBundleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tickets_core::message::{Event, EventHeader, Visibility};
use uuid::Uuid;

/// A show booking was committed to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMade {
    /// Message header
    pub header: EventHeader,
    /// Number of seats taken
    pub number_of_tickets: u32,
    /// Booking id
    pub booking_id: BookingId,
    /// Customer email
    pub customer_email: String,
    /// Booked show
    pub show_id: ShowId,
    /// Event id of the show at the external ticket provider
    #[serde(default)]
    pub external_event_id: Option<Uuid>,
}

impl_message!(BookingMade, "BookingMade_v1");
impl Event for BookingMade {}

/// A show booking was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Booking id
    pub booking_id: BookingId,
    /// Why the booking was rejected
    pub failure_reason: String,
}

impl_message!(BookingFailed, "BookingFailed_v1");
impl Event for BookingFailed {}

/// The ticket provider confirmed one ticket of a booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingConfirmed {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Customer email
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
    /// Booking the ticket belongs to
    pub booking_id: BookingId,
}

impl_message!(TicketBookingConfirmed, "TicketBookingConfirmed_v1");
impl Event for TicketBookingConfirmed {}

/// The ticket provider canceled a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingCanceled {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Customer email
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
}

impl_message!(TicketBookingCanceled, "TicketBookingCanceled_v1");
impl Event for TicketBookingCanceled {}

/// A ticket's receipt was voided and its payment refunded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRefunded {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
}

impl_message!(TicketRefunded, "TicketRefunded_v1");
impl Event for TicketRefunded {}

/// A printable ticket was uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPrinted {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Name of the uploaded file
    pub file_name: String,
}

impl_message!(TicketPrinted, "TicketPrinted_v1");
impl Event for TicketPrinted {}

/// A receipt was issued for a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceiptIssued {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Receipt number from the receipts provider
    pub receipt_number: String,
    /// When the receipt was issued
    pub issued_at: DateTime<Utc>,
}

impl_message!(TicketReceiptIssued, "TicketReceiptIssued_v1");
impl Event for TicketReceiptIssued {}

/// A VIP bundle purchase was accepted and its saga can start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundleInitialized {
    /// Message header
    pub header: EventHeader,
    /// Bundle id
    pub vip_bundle_id: VipBundleId,
}

impl_message!(VipBundleInitialized, "VipBundleInitialized_v1");
impl Event for VipBundleInitialized {}

/// Every leg of a VIP bundle is booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundleFinalized {
    /// Message header
    pub header: EventHeader,
    /// Bundle id
    pub vip_bundle_id: VipBundleId,
}

impl_message!(VipBundleFinalized, "VipBundleFinalized_v1");
impl Event for VipBundleFinalized {}

/// Flight tickets were booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightBooked {
    /// Message header
    pub header: EventHeader,
    /// Booked flight
    pub flight_id: Uuid,
    /// One ticket per passenger
    pub ticket_ids: Vec<Uuid>,
    /// Reference of the requester (the VIP bundle id)
    pub reference_id: String,
}

impl_message!(FlightBooked, "FlightBooked_v1");
impl Event for FlightBooked {}

/// The flight had no seats for the passengers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightBookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Requested flight
    pub flight_id: Uuid,
    /// Why the booking failed
    pub failure_reason: String,
    /// Reference of the requester (the VIP bundle id)
    pub reference_id: String,
}

impl_message!(FlightBookingFailed, "FlightBookingFailed_v1");
impl Event for FlightBookingFailed {}

/// A taxi was booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxiBooked {
    /// Message header
    pub header: EventHeader,
    /// Booking id at the taxi provider
    pub taxi_booking_id: Uuid,
    /// Reference of the requester (the VIP bundle id)
    pub reference_id: String,
}

impl_message!(TaxiBooked, "TaxiBooked_v1");
impl Event for TaxiBooked {}

/// No taxi was available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxiBookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Why the booking failed
    pub failure_reason: String,
    /// Reference of the requester (the VIP bundle id)
    pub reference_id: String,
}

impl_message!(TaxiBookingFailed, "TaxiBookingFailed_v1");
impl Event for TaxiBookingFailed {}

/// The ops read model document of a booking changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalOpsReadModelUpdated {
    /// Message header
    pub header: EventHeader,
    /// Booking whose document changed
    pub booking_id: BookingId,
}

impl_message!(InternalOpsReadModelUpdated, "InternalOpsReadModelUpdated");
impl Event for InternalOpsReadModelUpdated {
    const VISIBILITY: Visibility = Visibility::Internal;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use tickets_core::message::event_topic;

    #[test]
    fn internal_events_use_the_internal_namespace() {
        assert_eq!(
            event_topic::<InternalOpsReadModelUpdated>(),
            "internal-events.InternalOpsReadModelUpdated"
        );
        assert_eq!(event_topic::<BookingMade>(), "events.BookingMade_v1");
    }

    #[test]
    fn booking_made_without_provider_id_still_decodes() {
        let json = serde_json::json!({
            "header": EventHeader::new(),
            "number_of_tickets": 1,
            "booking_id": BookingId::new(),
            "customer_email": "a@example.com",
            "show_id": ShowId::new(),
        });
        let event: BookingMade = serde_json::from_value(json).expect("decode");
        assert_eq!(event.external_event_id, None);
    }
}
