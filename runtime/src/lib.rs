//! # Tickets Runtime
//!
//! Message dispatch for the tickets service.
//!
//! - [`retry`]: bounded exponential backoff for handler calls
//! - [`bus`]: typed [`EventBus`](bus::EventBus) and [`CommandBus`](bus::CommandBus) publishers
//! - [`processor`]: the dispatch table of handlers, one consumer group each
//! - [`outbox`]: the forwarder moving committed outbox rows onto the transport
//! - [`metrics`]: metric names and the Prometheus exporter

pub mod bus;
pub mod metrics;
pub mod outbox;
pub mod processor;
pub mod retry;

pub use bus::{CommandBus, EventBus};
pub use outbox::OutboxForwarder;
pub use processor::{HandlerError, HandlerKind, HandlerRegistration, Processor, ProcessorError};
pub use retry::RetryPolicy;
