//! # Tickets
//!
//! Show tickets sold as VIP bundles: seats at a show plus an inbound flight, a
//! return flight and a taxi from the airport. None of the providers share a
//! transaction, so the purchase is driven by messages:
//!
//! - [`ledger`]: the booking ledger; seats are never overbooked, each booking
//!   commits together with its `BookingMade` event
//! - [`vip_bundles`]: saga state, one document per bundle
//! - [`process_manager`]: the saga reacting to events and issuing commands,
//!   with compensations when a leg fails
//! - [`handlers`]: command and event handlers talking to the providers
//! - [`read_model`]: the operations view of each booking, tolerant of reordered
//!   and duplicated events, and its rebuild from the [`data_lake`]
//! - [`app`]: the dispatch table and the service lifecycle
//!
//! Infrastructure comes from the `tickets-core`, `tickets-runtime`,
//! `tickets-postgres` and `tickets-redpanda` crates. [`memory`] and
//! [`services::mocks`] provide in-process adapters for tests.

pub mod app;
pub mod config;
pub mod data_lake;
pub mod handlers;
pub mod ledger;
pub mod memory;
pub mod messages;
pub mod metrics;
pub mod process_manager;
pub mod read_model;
pub mod services;
pub mod shows;
pub mod ticket_store;
pub mod types;
pub mod vip_bundles;

pub use app::{Repositories, TicketsService};
pub use config::{Config, ConfigError};
