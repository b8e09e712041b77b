//! Schema version 0 of the events the ops read model consumes.
//!
//! Version 0 events are no longer published but remain in the data lake.
//! Each maps onto its current version with a plain `From`; the mapping runs
//! while rebuilding the read model and nowhere else.

use super::TicketsEvent;
use super::events::{
    BookingMade, TicketBookingConfirmed, TicketPrinted, TicketReceiptIssued, TicketRefunded,
};
use crate::types::{BookingId, Money, ShowId, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tickets_core::message::{EventHeader, MessageError};

/// `BookingMade_v0`: predates the external provider id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMadeV0 {
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
}

impl BookingMadeV0 {
    /// Wire name.
    pub const NAME: &'static str = "BookingMade_v0";
}

impl From<BookingMadeV0> for BookingMade {
    fn from(v0: BookingMadeV0) -> Self {
        Self {
            header: v0.header,
            number_of_tickets: v0.number_of_tickets,
            booking_id: v0.booking_id,
            customer_email: v0.customer_email,
            show_id: v0.show_id,
            external_event_id: None,
        }
    }
}

/// `TicketBookingConfirmed_v0`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingConfirmedV0 {
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

impl TicketBookingConfirmedV0 {
    /// Wire name.
    pub const NAME: &'static str = "TicketBookingConfirmed_v0";
}

impl From<TicketBookingConfirmedV0> for TicketBookingConfirmed {
    fn from(v0: TicketBookingConfirmedV0) -> Self {
        Self {
            header: v0.header,
            ticket_id: v0.ticket_id,
            customer_email: v0.customer_email,
            price: v0.price,
            booking_id: v0.booking_id,
        }
    }
}

/// `TicketReceiptIssued_v0`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceiptIssuedV0 {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Receipt number
    pub receipt_number: String,
    /// When the receipt was issued
    pub issued_at: DateTime<Utc>,
}

impl TicketReceiptIssuedV0 {
    /// Wire name.
    pub const NAME: &'static str = "TicketReceiptIssued_v0";
}

impl From<TicketReceiptIssuedV0> for TicketReceiptIssued {
    fn from(v0: TicketReceiptIssuedV0) -> Self {
        Self {
            header: v0.header,
            ticket_id: v0.ticket_id,
            receipt_number: v0.receipt_number,
            issued_at: v0.issued_at,
        }
    }
}

/// `TicketPrinted_v0`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPrintedV0 {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
    /// Name of the uploaded file
    pub file_name: String,
}

impl TicketPrintedV0 {
    /// Wire name.
    pub const NAME: &'static str = "TicketPrinted_v0";
}

impl From<TicketPrintedV0> for TicketPrinted {
    fn from(v0: TicketPrintedV0) -> Self {
        Self {
            header: v0.header,
            ticket_id: v0.ticket_id,
            file_name: v0.file_name,
        }
    }
}

/// `TicketRefunded_v0`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRefundedV0 {
    /// Message header
    pub header: EventHeader,
    /// Ticket id
    pub ticket_id: TicketId,
}

impl TicketRefundedV0 {
    /// Wire name.
    pub const NAME: &'static str = "TicketRefunded_v0";
}

impl From<TicketRefundedV0> for TicketRefunded {
    fn from(v0: TicketRefundedV0) -> Self {
        Self {
            header: v0.header,
            ticket_id: v0.ticket_id,
        }
    }
}

/// Decodes a version 0 payload and upgrades it.
///
/// Returns `Ok(None)` if `name` is not a version 0 name.
///
/// # Errors
///
/// Returns [`MessageError::Deserialization`] if the payload does not match
/// the version 0 schema.
pub fn upgrade(name: &str, payload: &Value) -> Result<Option<TicketsEvent>, MessageError> {
    let event = match name {
        BookingMadeV0::NAME => {
            TicketsEvent::BookingMade(parse::<BookingMadeV0>(name, payload)?.into())
        },
        TicketBookingConfirmedV0::NAME => TicketsEvent::TicketBookingConfirmed(
            parse::<TicketBookingConfirmedV0>(name, payload)?.into(),
        ),
        TicketReceiptIssuedV0::NAME => TicketsEvent::TicketReceiptIssued(
            parse::<TicketReceiptIssuedV0>(name, payload)?.into(),
        ),
        TicketPrintedV0::NAME => {
            TicketsEvent::TicketPrinted(parse::<TicketPrintedV0>(name, payload)?.into())
        },
        TicketRefundedV0::NAME => {
            TicketsEvent::TicketRefunded(parse::<TicketRefundedV0>(name, payload)?.into())
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn parse<T: DeserializeOwned>(name: &str, payload: &Value) -> Result<T, MessageError> {
    serde_json::from_value(payload.clone()).map_err(|e| MessageError::Deserialization {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn booking_made_v0_upgrades_without_provider_id() {
        let v0 = BookingMadeV0 {
            header: EventHeader::new(),
            number_of_tickets: 3,
            booking_id: BookingId::new(),
            customer_email: "old@example.com".into(),
            show_id: ShowId::new(),
        };
        let payload = serde_json::to_value(&v0).unwrap();

        let upgraded = upgrade(BookingMadeV0::NAME, &payload).unwrap();
        let Some(TicketsEvent::BookingMade(event)) = upgraded else {
            panic!("expected BookingMade");
        };
        assert_eq!(event.booking_id, v0.booking_id);
        assert_eq!(event.number_of_tickets, 3);
        assert_eq!(event.external_event_id, None);
        assert_eq!(event.header, v0.header);
    }

    #[test]
    fn v1_names_are_left_alone() {
        assert_eq!(upgrade("BookingMade_v1", &serde_json::json!({})).unwrap(), None);
    }
}
