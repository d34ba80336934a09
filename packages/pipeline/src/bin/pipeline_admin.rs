// Admin CLI over the pipeline control surface.
//
// Every subcommand is a queue-only operation (enqueue, backfill, listing,
// retry/cancel, stats) and needs no stage bodies, so this binary can be
// pointed at any environment's database.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use pipeline_core::config::{Config, PipelineConfig};
use pipeline_core::control::{BackfillRequest, PaperRegistration, Pipeline};
use pipeline_core::jobs::{JobFilter, JobPriority, JobStatus, JobStore, PgJobStore};
use pipeline_core::rate_limit::RateLimiter;
use pipeline_core::stages::Stage;
use pipeline_core::state::{PgStateTracker, StateTracker};

#[derive(Parser)]
#[command(name = "pipeline_admin", about = "Administer the enrichment pipeline queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue one stage for one paper.
    Enqueue {
        stage: Stage,
        paper_id: String,
        #[arg(long, default_value = "normal")]
        priority: JobPriority,
        #[arg(long)]
        batch: Option<Uuid>,
    },
    /// Enqueue stages for a set of papers at elevated priority.
    Enrich {
        #[arg(required = true)]
        paper_ids: Vec<String>,
        /// Comma-separated stage subset; defaults to all stages.
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<Stage>>,
        #[arg(long, default_value = "high")]
        priority: JobPriority,
    },
    /// Scan for incomplete papers and enqueue their missing stages.
    Backfill {
        /// Comma-separated stage subset; defaults to per-paper auto-detect.
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<Stage>>,
        #[arg(long)]
        max_papers: Option<i64>,
        #[arg(long, default_value = "normal")]
        priority: JobPriority,
        #[arg(long, default_value_t = 0)]
        min_completeness: i32,
        #[arg(long, default_value_t = 99)]
        max_completeness: i32,
        /// Only papers published on or after this date (YYYY-MM-DD).
        #[arg(long)]
        published_after: Option<String>,
        /// Only papers published on or before this date (YYYY-MM-DD).
        #[arg(long)]
        published_before: Option<String>,
    },
    /// Register freshly ingested papers and enqueue every stage.
    Register {
        #[arg(required = true)]
        paper_ids: Vec<String>,
        /// Publication date applied to all given papers (YYYY-MM-DD).
        #[arg(long)]
        published: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: JobPriority,
    },
    /// List jobs with optional filters.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        paper: Option<String>,
        #[arg(long)]
        batch: Option<Uuid>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Re-queue a failed job.
    Retry {
        job_id: i64,
        /// Also reset the retry counter for a fresh budget.
        #[arg(long)]
        reset_budget: bool,
    },
    /// Cancel a pending job.
    Cancel { job_id: i64 },
    /// Cancel all pending jobs in a batch.
    CancelBatch { batch_id: Uuid },
    /// Print the pipeline health snapshot.
    ///
    /// Rate-limit figures reflect this process's buckets (seed values),
    /// not a running worker's; queue and completeness figures are shared.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let tracker: Arc<dyn StateTracker> = Arc::new(PgStateTracker::new(pool));
    let pipeline = Pipeline::new(
        store,
        tracker,
        Arc::new(RateLimiter::seeded()),
        Arc::new(PipelineConfig::default()),
    );

    match cli.command {
        Command::Enqueue {
            stage,
            paper_id,
            priority,
            batch,
        } => {
            let result = pipeline
                .enqueue_stage(stage, &paper_id, priority, batch, serde_json::json!({}))
                .await?;
            print_json(&serde_json::json!({
                "job_id": result.job_id(),
                "created": result.is_created(),
            }))?;
        }
        Command::Enrich {
            paper_ids,
            stages,
            priority,
        } => {
            let summary = pipeline
                .create_enrichment(&paper_ids, stages.as_deref(), priority)
                .await?;
            print_json(&summary)?;
        }
        Command::Backfill {
            stages,
            max_papers,
            priority,
            min_completeness,
            max_completeness,
            published_after,
            published_before,
        } => {
            let summary = pipeline
                .create_backfill(BackfillRequest {
                    stages,
                    max_papers,
                    priority,
                    min_completeness,
                    max_completeness,
                    published_after: parse_date(published_after.as_deref())?,
                    published_before: parse_date(published_before.as_deref())?,
                })
                .await?;
            print_json(&summary)?;
        }
        Command::Register {
            paper_ids,
            published,
            priority,
        } => {
            let published_at = parse_date(published.as_deref())?;
            let papers: Vec<PaperRegistration> = paper_ids
                .into_iter()
                .map(|paper_id| PaperRegistration {
                    paper_id,
                    published_at,
                })
                .collect();
            let summary = pipeline.register_papers(&papers, priority).await?;
            print_json(&summary)?;
        }
        Command::List {
            status,
            stage,
            paper,
            batch,
            limit,
            offset,
        } => {
            let page = pipeline
                .list_jobs(&JobFilter {
                    status,
                    stage,
                    paper_id: paper,
                    batch_id: batch,
                    limit: Some(limit),
                    offset,
                })
                .await?;
            print_json(&page)?;
        }
        Command::Retry {
            job_id,
            reset_budget,
        } => {
            let retried = pipeline.retry_job(job_id, reset_budget).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "retried": retried }))?;
        }
        Command::Cancel { job_id } => {
            let cancelled = pipeline.cancel_job(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "cancelled": cancelled }))?;
        }
        Command::CancelBatch { batch_id } => {
            let cancelled = pipeline.cancel_batch(batch_id).await?;
            print_json(&serde_json::json!({ "batch_id": batch_id, "cancelled": cancelled }))?;
        }
        Command::Stats => {
            let health = pipeline.health().await?;
            print_json(&health)?;
        }
    }

    Ok(())
}

fn parse_date(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid date (expected YYYY-MM-DD): {s}"))?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .context("invalid midnight timestamp")?;
            Ok(midnight.and_utc())
        })
        .transpose()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
