//! Rebuilds the ops read model from the data lake.
//!
//! The archive is read in `published_at` order. Version 0 events are upgraded
//! through their `From` mappings while decoding, so the projector only sees
//! current events. Publication order does not guarantee causal order, so an
//! event whose document is not ready yet is deferred to a later pass; the
//! rebuild ends when a pass makes no progress.

use super::{OpsReadModel, ReadModelError};
use crate::data_lake::{DataLake, DataLakeError, DataLakeEvent};
use crate::messages::TicketsEvent;
use std::time::Duration;
use thiserror::Error;
use tickets_core::message::MessageError;
use tracing::{info, warn};
use uuid::Uuid;

/// Rebuild errors.
#[derive(Error, Debug)]
pub enum RebuildError {
    /// The data lake stayed empty.
    #[error("No events appeared in the data lake within {0:?}")]
    Timeout(Duration),

    /// The data lake could not be read.
    #[error(transparent)]
    DataLake(#[from] DataLakeError),

    /// An archived event does not match the schema its name announces.
    #[error("Could not decode archived event {event_id}: {source}")]
    Decode {
        /// Archived event id
        event_id: Uuid,
        /// Decoding error
        source: MessageError,
    },

    /// The read model rejected an event.
    #[error("Could not apply archived event {event_id}: {source}")]
    Apply {
        /// Archived event id
        event_id: Uuid,
        /// Read model error
        source: ReadModelError,
    },
}

/// Rebuild tuning.
#[derive(Clone, Debug)]
pub struct RebuildOptions {
    /// How long to wait for the data lake to hold any event
    pub wait_timeout: Duration,
    /// Poll interval while waiting
    pub poll_interval: Duration,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// What a rebuild did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Events applied to the read model
    pub applied: usize,
    /// Events the read model does not consume
    pub skipped: usize,
    /// Events still not applicable when the rebuild stopped
    pub unresolved: usize,
}

/// Replays every archived event into `read_model`.
///
/// # Errors
///
/// Returns [`RebuildError::Timeout`] if the data lake stays empty, or the
/// first decoding, storage or apply error other than "not ready".
pub async fn rebuild_from_data_lake(
    data_lake: &dyn DataLake,
    read_model: &OpsReadModel,
    options: &RebuildOptions,
) -> Result<RebuildReport, RebuildError> {
    info!("Rebuilding ops read model from the data lake");
    let archived = wait_for_events(data_lake, options).await?;
    info!(events = archived.len(), "Has events to replay");

    let mut report = RebuildReport::default();
    let mut pending = Vec::with_capacity(archived.len());
    for stored in &archived {
        match TicketsEvent::from_payload(&stored.event_name, &stored.event_payload) {
            Ok(Some(event)) => pending.push((stored.event_id, event)),
            Ok(None) => report.skipped += 1,
            Err(source) => {
                return Err(RebuildError::Decode {
                    event_id: stored.event_id,
                    source,
                });
            },
        }
    }

    let mut pass = 0;
    while !pending.is_empty() {
        pass += 1;
        let before = pending.len();
        let mut deferred = Vec::new();

        for (event_id, event) in pending {
            match read_model.apply(&event).await {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(ReadModelError::NotReady(reason)) => {
                    tracing::debug!(%event_id, event = event.name(), %reason, "Deferring event");
                    deferred.push((event_id, event));
                },
                Err(source) => return Err(RebuildError::Apply { event_id, source }),
            }
        }

        if deferred.len() == before {
            warn!(pass, unresolved = deferred.len(), "Rebuild made no progress, giving up on remaining events");
            report.unresolved = deferred.len();
            break;
        }
        pending = deferred;
    }

    crate::metrics::record_rebuild(report.applied, report.skipped, report.unresolved);
    info!(
        applied = report.applied,
        skipped = report.skipped,
        unresolved = report.unresolved,
        "Ops read model rebuilt"
    );
    Ok(report)
}

async fn wait_for_events(
    data_lake: &dyn DataLake,
    options: &RebuildOptions,
) -> Result<Vec<DataLakeEvent>, RebuildError> {
    let deadline = tokio::time::Instant::now() + options.wait_timeout;
    loop {
        let events = data_lake.find_all().await?;
        if !events.is_empty() {
            return Ok(events);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RebuildError::Timeout(options.wait_timeout));
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}
