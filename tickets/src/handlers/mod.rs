//! Command and event handlers.
//!
//! Each handler is a method returning [`HandlerError`]; [`crate::app`] wires
//! them into the processor's dispatch table. Domain errors are classified
//! here once: causal gaps and infrastructure failures are transient, broken
//! payloads and impossible states are permanent.

use crate::data_lake::DataLakeError;
use crate::ledger::BookingError;
use crate::read_model::ReadModelError;
use crate::services::ServiceError;
use crate::shows::ShowError;
use crate::ticket_store::TicketError;
use crate::vip_bundles::VipBundleError;
use tickets_runtime::HandlerError;

pub mod commands;
pub mod events;

pub use commands::CommandHandlers;
pub use events::EventHandlers;

impl From<BookingError> for HandlerError {
    fn from(error: BookingError) -> Self {
        match error {
            BookingError::Database(_) => Self::transient(error),
            _ => Self::permanent(error),
        }
    }
}

impl From<VipBundleError> for HandlerError {
    fn from(error: VipBundleError) -> Self {
        match error {
            VipBundleError::NotFound(_)
            | VipBundleError::NotFoundForBooking(_)
            | VipBundleError::Database(_) => Self::transient(error),
            _ => Self::permanent(error),
        }
    }
}

impl From<ReadModelError> for HandlerError {
    fn from(error: ReadModelError) -> Self {
        match error {
            ReadModelError::Serialization(_) => Self::permanent(error),
            _ => Self::transient(error),
        }
    }
}

impl From<ServiceError> for HandlerError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Transient(_) => Self::transient(error),
            ServiceError::Unavailable(_) => Self::permanent(error),
        }
    }
}

impl From<ShowError> for HandlerError {
    fn from(error: ShowError) -> Self {
        match error {
            ShowError::NotFound(_) => Self::permanent(error),
            ShowError::Database(_) => Self::transient(error),
        }
    }
}

impl From<TicketError> for HandlerError {
    fn from(error: TicketError) -> Self {
        Self::transient(error)
    }
}

impl From<DataLakeError> for HandlerError {
    fn from(error: DataLakeError) -> Self {
        match error {
            DataLakeError::MissingHeader(_) => Self::permanent(error),
            DataLakeError::Database(_) => Self::transient(error),
        }
    }
}
