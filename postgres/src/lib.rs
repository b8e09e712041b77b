//! `PostgreSQL` infrastructure for the tickets service.
//!
//! - [`PostgresOutbox`]: outbox rows written inside the caller's transaction
//!   and read back by the forwarder
//! - [`transaction`]: isolation levels and conflict retry for serializable writers
//! - [`DeadLetterQueue`]: durable store for messages whose handler gave up
//!
//! Domain repositories live in the `tickets` crate and build on these pieces.

pub mod dead_letter_queue;
pub mod outbox;
pub mod transaction;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedMessage};
pub use outbox::{EnqueueError, PostgresOutbox};
pub use transaction::{
    ConflictError, DEFAULT_CONFLICT_ATTEMPTS, IsolationLevel, begin, is_serialization_failure,
    is_unique_violation, retry_on_conflict,
};
