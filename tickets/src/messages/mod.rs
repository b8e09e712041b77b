//! Every command and event the tickets service sends or consumes.
//!
//! Each message type carries its wire name as an explicit constant. The names
//! of events include their schema version; the legacy `_v0` schemas that are
//! still present in the data lake live in [`legacy`] together with their
//! mapping onto the current version.
//!
//! [`TicketsEvent`] is the closed set of external events. It is what the data
//! lake archives and what a read-model rebuild decodes.

use serde_json::Value;
use tickets_core::message::{Message, MessageError, SerializedMessage};

macro_rules! impl_message {
    ($ty:ty, $name:literal) => {
        impl tickets_core::message::Message for $ty {
            const NAME: &'static str = $name;

            fn header(&self) -> &tickets_core::message::EventHeader {
                &self.header
            }
        }
    };
}

pub mod commands;
pub mod events;
pub mod legacy;

pub use commands::{BookFlight, BookShowTickets, BookTaxi, CancelFlightTickets, RefundTicket};
pub use events::{
    BookingFailed, BookingMade, FlightBooked, FlightBookingFailed, InternalOpsReadModelUpdated,
    TaxiBooked, TaxiBookingFailed, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued, TicketRefunded, VipBundleFinalized, VipBundleInitialized,
};

/// The closed catalog of external events, tagged by wire name.
#[derive(Clone, Debug, PartialEq)]
pub enum TicketsEvent {
    /// [`BookingMade`]
    BookingMade(BookingMade),
    /// [`BookingFailed`]
    BookingFailed(BookingFailed),
    /// [`TicketBookingConfirmed`]
    TicketBookingConfirmed(TicketBookingConfirmed),
    /// [`TicketBookingCanceled`]
    TicketBookingCanceled(TicketBookingCanceled),
    /// [`TicketRefunded`]
    TicketRefunded(TicketRefunded),
    /// [`TicketPrinted`]
    TicketPrinted(TicketPrinted),
    /// [`TicketReceiptIssued`]
    TicketReceiptIssued(TicketReceiptIssued),
    /// [`VipBundleInitialized`]
    VipBundleInitialized(VipBundleInitialized),
    /// [`VipBundleFinalized`]
    VipBundleFinalized(VipBundleFinalized),
    /// [`FlightBooked`]
    FlightBooked(FlightBooked),
    /// [`FlightBookingFailed`]
    FlightBookingFailed(FlightBookingFailed),
    /// [`TaxiBooked`]
    TaxiBooked(TaxiBooked),
    /// [`TaxiBookingFailed`]
    TaxiBookingFailed(TaxiBookingFailed),
}

impl TicketsEvent {
    /// Wire names of every variant.
    pub const NAMES: &'static [&'static str] = &[
        BookingMade::NAME,
        BookingFailed::NAME,
        TicketBookingConfirmed::NAME,
        TicketBookingCanceled::NAME,
        TicketRefunded::NAME,
        TicketPrinted::NAME,
        TicketReceiptIssued::NAME,
        VipBundleInitialized::NAME,
        VipBundleFinalized::NAME,
        FlightBooked::NAME,
        FlightBookingFailed::NAME,
        TaxiBooked::NAME,
        TaxiBookingFailed::NAME,
    ];

    /// Decodes an envelope. Returns `Ok(None)` for names outside the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Deserialization`] if the name is known but the
    /// payload does not match its schema.
    pub fn decode(message: &SerializedMessage) -> Result<Option<Self>, MessageError> {
        Self::from_payload(&message.name, &message.payload)
    }

    /// Decodes a payload stored under `name`, accepting both the current
    /// schemas and the legacy `_v0` ones.
    ///
    /// Legacy payloads are upgraded through their `From` mapping, so callers
    /// only ever see current events. Returns `Ok(None)` for unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Deserialization`] if the payload does not match
    /// the schema its name announces.
    pub fn from_payload(name: &str, payload: &Value) -> Result<Option<Self>, MessageError> {
        if let Some(upgraded) = legacy::upgrade(name, payload)? {
            return Ok(Some(upgraded));
        }

        let event = match name {
            BookingMade::NAME => Self::BookingMade(parse(payload)?),
            BookingFailed::NAME => Self::BookingFailed(parse(payload)?),
            TicketBookingConfirmed::NAME => Self::TicketBookingConfirmed(parse(payload)?),
            TicketBookingCanceled::NAME => Self::TicketBookingCanceled(parse(payload)?),
            TicketRefunded::NAME => Self::TicketRefunded(parse(payload)?),
            TicketPrinted::NAME => Self::TicketPrinted(parse(payload)?),
            TicketReceiptIssued::NAME => Self::TicketReceiptIssued(parse(payload)?),
            VipBundleInitialized::NAME => Self::VipBundleInitialized(parse(payload)?),
            VipBundleFinalized::NAME => Self::VipBundleFinalized(parse(payload)?),
            FlightBooked::NAME => Self::FlightBooked(parse(payload)?),
            FlightBookingFailed::NAME => Self::FlightBookingFailed(parse(payload)?),
            TaxiBooked::NAME => Self::TaxiBooked(parse(payload)?),
            TaxiBookingFailed::NAME => Self::TaxiBookingFailed(parse(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Wire name of the wrapped event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BookingMade(_) => BookingMade::NAME,
            Self::BookingFailed(_) => BookingFailed::NAME,
            Self::TicketBookingConfirmed(_) => TicketBookingConfirmed::NAME,
            Self::TicketBookingCanceled(_) => TicketBookingCanceled::NAME,
            Self::TicketRefunded(_) => TicketRefunded::NAME,
            Self::TicketPrinted(_) => TicketPrinted::NAME,
            Self::TicketReceiptIssued(_) => TicketReceiptIssued::NAME,
            Self::VipBundleInitialized(_) => VipBundleInitialized::NAME,
            Self::VipBundleFinalized(_) => VipBundleFinalized::NAME,
            Self::FlightBooked(_) => FlightBooked::NAME,
            Self::FlightBookingFailed(_) => FlightBookingFailed::NAME,
            Self::TaxiBooked(_) => TaxiBooked::NAME,
            Self::TaxiBookingFailed(_) => TaxiBookingFailed::NAME,
        }
    }
}

fn parse<M: Message>(payload: &Value) -> Result<M, MessageError> {
    serde_json::from_value(payload.clone()).map_err(|e| MessageError::Deserialization {
        name: M::NAME.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{BookingId, ShowId};
    use tickets_core::message::EventHeader;

    #[test]
    fn decodes_catalog_events_by_tag() {
        let event = BookingMade {
            header: EventHeader::new(),
            number_of_tickets: 2,
            booking_id: BookingId::new(),
            customer_email: "vip@example.com".into(),
            show_id: ShowId::new(),
            external_event_id: None,
        };
        let message = SerializedMessage::from_message(&event).unwrap();

        let decoded = TicketsEvent::decode(&message).unwrap();
        assert_eq!(decoded, Some(TicketsEvent::BookingMade(event)));
    }

    #[test]
    fn unknown_names_are_not_errors() {
        let message = SerializedMessage::new(
            "SomethingElse_v3".into(),
            serde_json::json!({}),
            Default::default(),
        );
        assert_eq!(TicketsEvent::decode(&message).unwrap(), None);
    }

    #[test]
    fn known_name_with_wrong_payload_is_an_error() {
        let result = TicketsEvent::from_payload(BookingMade::NAME, &serde_json::json!({"x": 1}));
        assert!(matches!(result, Err(MessageError::Deserialization { .. })));
    }

    #[test]
    fn internal_events_stay_out_of_the_catalog() {
        assert!(!TicketsEvent::NAMES.contains(&InternalOpsReadModelUpdated::NAME));
    }
}
