//! Tickets server.
//!
//! This binary:
//! - Runs the `PostgreSQL` migrations
//! - Connects to `RedPanda`
//! - Exposes Prometheus metrics
//! - Runs every handler and the outbox forwarder until Ctrl+C
//!
//! The external providers are the in-process mocks.
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin tickets-server
//! ```

use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tickets::services::mocks::MockServices;
use tickets::{Config, Repositories, TicketsService};
use tickets_postgres::{DeadLetterQueue, PostgresOutbox};
use tickets_redpanda::RedpandaBus;
use tickets_runtime::metrics::MetricsServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tickets=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tickets server...");

    let config = Config::from_env()?;
    tracing::info!(
        postgres = %config.postgres.url,
        redpanda = %config.redpanda.brokers,
        service = %config.processor.service_name,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(config.postgres.connect_timeout())
        .connect(&config.postgres.url)
        .await?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    let transport = RedpandaBus::builder()
        .brokers(config.redpanda.brokers.clone())
        .auto_offset_reset(config.redpanda.auto_offset_reset.clone())
        .build()?;

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;
    tickets::metrics::register_business_metrics();

    let service = TicketsService::new(
        Arc::new(transport),
        Arc::new(PostgresOutbox::new(pool.clone())),
        Arc::new(DeadLetterQueue::new(pool.clone())),
        Repositories::postgres(&pool),
        MockServices::new().services(),
    )
    .configured(&config);

    tracing::info!("Press Ctrl+C to shutdown");
    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await?;

    pool.close().await;
    Ok(())
}
