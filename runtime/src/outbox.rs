//! Outbox forwarder.
//!
//! Reads committed outbox rows in order and republishes them onto the
//! transport. A row is marked forwarded only after the publish returned
//! success, so a crash in between yields a duplicate delivery, never a lost
//! one. Consumers are idempotent, which makes the duplicate harmless.
//!
//! Within a pass the forwarder stops at the first failed publish. Later rows
//! wait for the earlier one, which keeps the events of one aggregate in the
//! order their transactions committed.

use std::sync::Arc;
use std::time::Duration;
use tickets_core::event_bus::MessageBus;
use tickets_core::outbox::{OutboxError, OutboxSource};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Polls an [`OutboxSource`] and publishes pending rows.
pub struct OutboxForwarder {
    source: Arc<dyn OutboxSource>,
    transport: Arc<dyn MessageBus>,
    poll_interval: Duration,
    batch_size: usize,
}

impl OutboxForwarder {
    /// Creates a forwarder with a 100ms poll interval and batches of 100.
    #[must_use]
    pub fn new(source: Arc<dyn OutboxSource>, transport: Arc<dyn MessageBus>) -> Self {
        Self {
            source,
            transport,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }

    /// Sets how long to sleep when the outbox is drained.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the maximum rows fetched per pass.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Forwards one batch of pending rows.
    ///
    /// Returns how many rows were published and marked. A publish failure ends
    /// the pass early without an error; the row stays pending for the next one.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the outbox cannot be read, or a row cannot
    /// be marked after it was published. The latter row is published again on
    /// the next pass.
    pub async fn forward_pending(&self) -> Result<usize, OutboxError> {
        let pending = self.source.fetch_pending(self.batch_size).await?;
        let mut forwarded = 0;

        for row in pending {
            if let Err(e) = self.transport.publish(&row.topic, &row.message).await {
                warn!(
                    outbox_id = %row.id,
                    topic = %row.topic,
                    error = %e,
                    "Failed to publish outbox message, will retry"
                );
                break;
            }

            self.source.mark_forwarded(row.id).await?;
            metrics::counter!(crate::metrics::OUTBOX_FORWARDED).increment(1);
            debug!(outbox_id = %row.id, topic = %row.topic, message = %row.message, "Forwarded outbox message");
            forwarded += 1;
        }

        Ok(forwarded)
    }

    /// Forwards until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis(),
            batch_size = self.batch_size,
            "Outbox forwarder started"
        );

        loop {
            let drained = match self.forward_pending().await {
                Ok(forwarded) => forwarded < self.batch_size,
                Err(e) => {
                    error!(error = %e, "Outbox forwarding pass failed");
                    true
                },
            };

            if drained {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(self.poll_interval) => {},
                }
            } else if shutdown.try_recv().is_ok() {
                break;
            }
        }

        info!("Outbox forwarder stopped");
    }

    /// Spawns [`run`](Self::run) as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

impl std::fmt::Debug for OutboxForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxForwarder")
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
