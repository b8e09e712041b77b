//! Messages, their headers and the JSON envelope that carries them.
//!
//! Every command and event is a plain serde struct. Its wire name is an
//! explicit constant on the type, never derived from the Rust type name, so
//! renaming a struct cannot silently move it to another topic.
//!
//! # Topics
//!
//! ```text
//! external event   events.{NAME}
//! internal event   internal-events.{NAME}
//! command          commands.{NAME}
//! ```
//!
//! Internal events are implementation details of this service and are kept
//! out of the documented `events.` namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::correlation;

/// Metadata key holding the correlation id of a message.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Free-form string headers travelling next to the payload.
pub type Metadata = BTreeMap<String, String>;

/// Error types for message encoding.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Failed to serialize a message to JSON.
    #[error("Failed to serialize message {name}: {reason}")]
    Serialization {
        /// Wire name of the message
        name: String,
        /// Underlying serde error
        reason: String,
    },

    /// Failed to deserialize a message from JSON.
    #[error("Failed to deserialize message {name}: {reason}")]
    Deserialization {
        /// Wire name of the message
        name: String,
        /// Underlying serde error
        reason: String,
    },

    /// The envelope carries a different message than the one requested.
    #[error("Expected message {expected}, got {actual}")]
    UnexpectedMessage {
        /// Name the caller asked for
        expected: &'static str,
        /// Name found in the envelope
        actual: String,
    },
}

/// Header carried by every command and event.
///
/// `idempotency_key` is the unit side-effecting handlers deduplicate on: two
/// deliveries with the same key describe the same logical action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Unique id of this message
    pub id: Uuid,
    /// When the message was created
    pub published_at: DateTime<Utc>,
    /// Deduplication key for side effects
    pub idempotency_key: String,
}

impl EventHeader {
    /// Creates a header with a fresh id and a fresh idempotency key.
    #[must_use]
    pub fn new() -> Self {
        Self::with_idempotency_key(Uuid::new_v4().to_string())
    }

    /// Creates a header with a fresh id that reuses the given idempotency key.
    #[must_use]
    pub fn with_idempotency_key(idempotency_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            published_at: Utc::now(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything that travels over the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name, including the schema version (e.g. `"BookingMade_v1"`).
    const NAME: &'static str;

    /// The header of this message.
    fn header(&self) -> &EventHeader;
}

/// Whether an event belongs to the public event namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// Published on `events.{NAME}`
    External,
    /// Published on `internal-events.{NAME}`
    Internal,
}

/// A fact that happened. Any number of handler groups may consume it.
pub trait Event: Message {
    /// Namespace the event is published to.
    const VISIBILITY: Visibility = Visibility::External;
}

/// A request for one handler group to do something.
pub trait Command: Message {}

/// Topic an external event with the given name is published to.
#[must_use]
pub fn external_event_topic(name: &str) -> String {
    format!("events.{name}")
}

/// Topic for event type `E`.
#[must_use]
pub fn event_topic<E: Event>() -> String {
    match E::VISIBILITY {
        Visibility::External => external_event_topic(E::NAME),
        Visibility::Internal => format!("internal-events.{}", E::NAME),
    }
}

/// Topic for command type `C`.
#[must_use]
pub fn command_topic<C: Command>() -> String {
    format!("commands.{}", C::NAME)
}

/// JSON envelope of a message as it crosses the transport and the outbox.
///
/// `payload` is the full message (header included) as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedMessage {
    /// Wire name (`Message::NAME`)
    pub name: String,
    /// The message itself
    pub payload: serde_json::Value,
    /// Transport headers, including the correlation id
    #[serde(default)]
    pub metadata: Metadata,
}

impl SerializedMessage {
    /// Creates an envelope from parts.
    #[must_use]
    pub const fn new(name: String, payload: serde_json::Value, metadata: Metadata) -> Self {
        Self {
            name,
            payload,
            metadata,
        }
    }

    /// Serializes a message, stamping the current correlation id.
    ///
    /// If no correlation scope is active a new id is generated, so every
    /// envelope leaving the service carries one.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialization`] if the message cannot be encoded.
    pub fn from_message<M: Message>(message: &M) -> Result<Self, MessageError> {
        let payload =
            serde_json::to_value(message).map_err(|e| MessageError::Serialization {
                name: M::NAME.to_string(),
                reason: e.to_string(),
            })?;

        let correlation_id =
            correlation::current().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut metadata = Metadata::new();
        metadata.insert(CORRELATION_ID_KEY.to_string(), correlation_id);

        Ok(Self::new(M::NAME.to_string(), payload, metadata))
    }

    /// Decodes the payload as message type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnexpectedMessage`] if the envelope holds a
    /// different message, or [`MessageError::Deserialization`] if the payload
    /// does not match `M`.
    pub fn decode<M: Message>(&self) -> Result<M, MessageError> {
        if self.name != M::NAME {
            return Err(MessageError::UnexpectedMessage {
                expected: M::NAME,
                actual: self.name.clone(),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| MessageError::Deserialization {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Id of the message, read from the header inside the payload.
    #[must_use]
    pub fn message_id(&self) -> Option<Uuid> {
        self.payload
            .get("header")
            .and_then(|h| h.get("id"))
            .and_then(serde_json::Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    /// Correlation id carried in the metadata, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).map(String::as_str)
    }

    /// Encodes the envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialization {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Decodes an envelope from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Deserialization`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialization {
            name: "<envelope>".to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for SerializedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_id() {
            Some(id) => write!(f, "{} ({id})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
