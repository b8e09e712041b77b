//! # Tickets Core
//!
//! Core traits and types shared by every crate of the tickets service.
//!
//! The service coordinates show-ticket bookings with flights and taxis across
//! external providers that share no transaction boundary. Everything it does is
//! driven by messages, so this crate defines what a message is and how it
//! travels:
//!
//! - **Message**: a serde struct with an explicit wire `NAME` and an
//!   [`EventHeader`](message::EventHeader)
//! - **Event / Command**: the two message families; events fan out to many
//!   handler groups, commands have exactly one
//! - **Envelope**: [`SerializedMessage`](message::SerializedMessage), the JSON
//!   form that crosses the transport and the outbox
//! - **Transport**: the [`MessageBus`](event_bus::MessageBus) trait, implemented
//!   by Redpanda in production and in memory for tests
//! - **Outbox**: rows written in the same transaction as a domain change and
//!   forwarded to the transport afterwards
//! - **Dead letters**: messages whose handler gave up
//!
//! ## Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tickets_core::message::{Event, EventHeader, Message, SerializedMessage, Visibility};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct ShowAnnounced {
//!     header: EventHeader,
//!     title: String,
//! }
//!
//! impl Message for ShowAnnounced {
//!     const NAME: &'static str = "ShowAnnounced_v1";
//!
//!     fn header(&self) -> &EventHeader {
//!         &self.header
//!     }
//! }
//!
//! impl Event for ShowAnnounced {
//!     const VISIBILITY: Visibility = Visibility::External;
//! }
//!
//! let event = ShowAnnounced { header: EventHeader::new(), title: "Opening night".into() };
//! let envelope = SerializedMessage::from_message(&event).unwrap();
//! assert_eq!(envelope.name, "ShowAnnounced_v1");
//! assert_eq!(tickets_core::message::event_topic::<ShowAnnounced>(), "events.ShowAnnounced_v1");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

pub mod correlation;
pub mod dead_letter;
pub mod event_bus;
pub mod message;
pub mod outbox;
