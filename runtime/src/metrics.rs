//! Prometheus exporter for the processor and forwarder metrics.
//!
//! The processor and the outbox forwarder record through the `metrics`
//! facade. Without an installed recorder those calls are no-ops, so tests
//! need nothing. The server installs [`MetricsServer`] once at startup.
//!
//! # Example
//!
//! ```rust,no_run
//! use tickets_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Messages a handler finished successfully, by handler.
pub const MESSAGES_PROCESSED: &str = "tickets_messages_processed_total";
/// Failed handler attempts, by handler.
pub const MESSAGES_FAILED: &str = "tickets_messages_failed_total";
/// Messages moved to the dead-letter queue, by handler.
pub const MESSAGES_DEAD_LETTERED: &str = "tickets_messages_dead_lettered_total";
/// Handler latency, by handler.
pub const MESSAGE_HANDLING_SECONDS: &str = "tickets_message_handling_seconds";
/// Outbox rows published to the transport.
pub const OUTBOX_FORWARDED: &str = "tickets_outbox_forwarded_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Creates a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Installs the global recorder and starts the HTTP listener. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a
    /// different recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Current metrics in Prometheus text format, once started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(MESSAGES_PROCESSED, "Messages a handler finished successfully");
    describe_counter!(MESSAGES_FAILED, "Failed handler attempts, retried or not");
    describe_counter!(MESSAGES_DEAD_LETTERED, "Messages moved to the dead-letter queue");
    describe_histogram!(MESSAGE_HANDLING_SECONDS, "Time spent in a handler per attempt");
    describe_counter!(OUTBOX_FORWARDED, "Outbox rows published to the transport");
}
