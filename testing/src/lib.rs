//! # Tickets Testing
//!
//! In-memory infrastructure for testing the tickets service without a broker
//! or a database:
//!
//! - [`InMemoryBus`]: a [`MessageBus`](tickets_core::event_bus::MessageBus)
//!   with consumer groups, backlog replay and optional redelivery
//! - [`InMemoryOutbox`]: an [`OutboxSource`](tickets_core::outbox::OutboxSource)
//!   with injectable mark failures
//! - [`InMemoryDeadLetters`]: a dead-letter sink that records entries
//! - [`helpers::eventually`]: polls a condition until it holds or times out
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tickets_runtime::OutboxForwarder;
//! use tickets_testing::{InMemoryBus, InMemoryOutbox};
//!
//! let bus = InMemoryBus::new();
//! let outbox = InMemoryOutbox::new();
//! let forwarder = OutboxForwarder::new(Arc::new(outbox.clone()), Arc::new(bus.clone()));
//! # let _ = forwarder;
//! ```

mod bus;
mod outbox;

pub use bus::InMemoryBus;
pub use outbox::{InMemoryDeadLetters, InMemoryOutbox};

/// Test helpers.
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Polls `condition` every 10ms until it returns `true` or `timeout` passes.
    ///
    /// Returns whether the condition was met.
    pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
