//! Typed publishers over a [`MessageBus`].
//!
//! [`EventBus`] and [`CommandBus`] pick the topic from the message type, wrap
//! the message in a [`SerializedMessage`] and stamp the active correlation id.
//! Both are cheap to clone.

use std::sync::Arc;
use tickets_core::event_bus::{BusError, MessageBus};
use tickets_core::message::{Command, Event, SerializedMessage, command_topic, event_topic};

/// Publishes events to `events.{NAME}` or `internal-events.{NAME}`.
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn MessageBus>,
}

impl EventBus {
    /// Creates an event bus over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn MessageBus>) -> Self {
        Self { transport }
    }

    /// Publishes `event`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the event cannot be encoded or the transport
    /// rejects it.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), BusError> {
        let topic = event_topic::<E>();
        let message = SerializedMessage::from_message(event)?;

        tracing::debug!(topic = %topic, message = %message, "Publishing event");
        self.transport.publish(&topic, &message).await
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Sends commands to `commands.{NAME}`.
#[derive(Clone)]
pub struct CommandBus {
    transport: Arc<dyn MessageBus>,
}

impl CommandBus {
    /// Creates a command bus over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn MessageBus>) -> Self {
        Self { transport }
    }

    /// Sends `command` to its single handler group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the command cannot be encoded or the transport
    /// rejects it.
    pub async fn send<C: Command>(&self, command: &C) -> Result<(), BusError> {
        let topic = command_topic::<C>();
        let message = SerializedMessage::from_message(command)?;

        tracing::debug!(topic = %topic, message = %message, "Sending command");
        self.transport.publish(&topic, &message).await
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}
