// Main entry point for the enrichment worker process.
//
// Composition root: loads config, connects to the database, runs
// migrations, and starts the lease reclaimer plus the worker pool. Stage
// bodies are registered in build_handlers() by the deployment; the stock
// binary ships none and therefore only runs queue maintenance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::config::{Config, PipelineConfig};
use pipeline_core::jobs::{JobStore, LeaseReclaimer, PgJobStore};
use pipeline_core::rate_limit::RateLimiter;
use pipeline_core::stages::HandlerRegistry;
use pipeline_core::state::{PgStateTracker, StateTracker};
use pipeline_core::workers::WorkerPool;

#[derive(Parser)]
#[command(name = "enrichment_worker", about = "Run the enrichment worker pool")]
struct Args {
    /// Run only queue maintenance (lease reclaim), no stage workers.
    #[arg(long)]
    queue_only: bool,

    /// Graceful shutdown deadline in seconds.
    #[arg(long, default_value_t = 30)]
    graceful_secs: u64,
}

/// Register stage bodies here. Each deployment wires its own enrichment
/// implementations (LLM analyses, citation lookups, embedding jobs).
fn build_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipeline_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting enrichment worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    let pipeline_config = Arc::new(PipelineConfig::default());

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let tracker: Arc<dyn StateTracker> = Arc::new(PgStateTracker::new(pool.clone()));
    let limiter = Arc::new(RateLimiter::new(pipeline_config.rate_limits.clone()));
    let handlers = Arc::new(build_handlers());

    let shutdown = CancellationToken::new();
    let reclaimer = LeaseReclaimer::new(store.clone(), pipeline_config.reclaim_interval);
    let reclaimer_handle = tokio::spawn(reclaimer.run(shutdown.clone()));
    tracing::info!(
        interval_secs = pipeline_config.reclaim_interval.as_secs(),
        "lease reclaimer running"
    );

    let worker_pool = Arc::new(WorkerPool::new(
        store.clone(),
        tracker.clone(),
        limiter.clone(),
        handlers.clone(),
        pipeline_config.clone(),
    ));

    let workers_running = if args.queue_only {
        tracing::info!("queue-only mode; stage workers not started");
        false
    } else if handlers.is_empty() {
        tracing::warn!(
            "no stage handlers registered; running queue maintenance only \
             (wire handlers in build_handlers())"
        );
        false
    } else {
        worker_pool.start()?;
        true
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if workers_running {
        worker_pool
            .stop(Duration::from_secs(args.graceful_secs))
            .await?;
    }
    shutdown.cancel();
    let _ = reclaimer_handle.await;

    tracing::info!("Enrichment worker stopped");
    Ok(())
}
