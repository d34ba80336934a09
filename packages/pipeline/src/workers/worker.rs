//! The worker loop: one task pulling jobs for one pool group.
//!
//! Loop shape (per dispatch group, so every worker bills exactly one
//! rate-limit bucket):
//!
//! 1. Acquire a token for the group's provider with a bounded wait. The
//!    token comes *before* the claim so a claimed job never sits on its
//!    lease behind an indefinite rate-limit wait.
//! 2. Claim the next runnable job for the group's stages.
//! 3. Run the stage body under its wall-clock budget.
//! 4. Mark success (stamping the paper's processing state) or classify
//!    and record the failure.
//!
//! Store or tracker errors never exit the loop; the iteration logs,
//! sleeps briefly and tries again. The only non-error exit paths are the
//! shutdown token and a scale-down target below this worker's slot.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::jobs::{Job, JobStore};
use crate::rate_limit::RateLimiter;
use crate::stages::{HandlerRegistry, PoolGroup, Stage, StageError};
use crate::state::StateTracker;

/// Shared dependencies handed to every worker task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub tracker: Arc<dyn StateTracker>,
    pub limiter: Arc<RateLimiter>,
    pub handlers: Arc<HandlerRegistry>,
    pub config: Arc<PipelineConfig>,
}

/// Counters shared between a group's workers and `WorkerPool::status`.
#[derive(Default)]
pub(crate) struct GroupMetrics {
    pub busy: AtomicUsize,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub last_error_unix_ms: AtomicI64,
}

struct StageFailure {
    message: String,
    permanent: bool,
    rate_limit_backoff: Option<Duration>,
}

pub(crate) async fn run_worker(
    ctx: WorkerContext,
    group: PoolGroup,
    slot: usize,
    target: Arc<AtomicUsize>,
    metrics: Arc<GroupMetrics>,
    shutdown: CancellationToken,
) {
    let worker_id = format!("{}-{}-{}", group.as_str(), slot, Uuid::new_v4());

    // Only dispatch stages that actually have a body registered; jobs for
    // other stages stay pending for a process that can run them.
    let stages: Vec<Stage> = group
        .stages()
        .into_iter()
        .filter(|s| ctx.handlers.is_registered(*s))
        .collect();

    if stages.is_empty() {
        debug!(worker_id = %worker_id, "no registered stages for group; worker idle");
        shutdown.cancelled().await;
        return;
    }

    let lease = stages
        .iter()
        .map(|s| ctx.config.lease_duration(*s))
        .max()
        .unwrap_or(Duration::from_secs(60));

    debug!(worker_id = %worker_id, group = %group, "worker starting");

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        // Scale-down: excess workers exit once idle, never mid-job.
        if slot >= target.load(Ordering::SeqCst) {
            debug!(worker_id = %worker_id, "exiting for scale-down");
            break;
        }

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = ctx.limiter.acquire(group.provider(), ctx.config.acquire_wait) => outcome,
        };
        if !outcome.is_granted() {
            continue;
        }

        let job = match ctx.store.claim_next(&stages, &worker_id, lease).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                idle_sleep(&shutdown, ctx.config.poll_interval_empty).await;
                continue;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "failed to claim job");
                idle_sleep(&shutdown, Duration::from_secs(1)).await;
                continue;
            }
        };

        metrics.busy.fetch_add(1, Ordering::SeqCst);
        process_job(&ctx, &metrics, &job).await;
        metrics.busy.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker_id = %worker_id, "worker stopped");
}

async fn process_job(ctx: &WorkerContext, metrics: &GroupMetrics, job: &Job) {
    debug!(job_id = job.id, stage = %job.stage, paper_id = %job.paper_id, "executing job");

    match execute(ctx, job).await {
        Ok(()) => {
            match ctx.store.mark_success(job.id).await {
                Ok(true) => {
                    if let Err(e) = ctx.tracker.stamp(&job.paper_id, job.stage).await {
                        error!(job_id = job.id, error = %e, "failed to stamp processing state");
                    }
                    info!(job_id = job.id, stage = %job.stage, paper_id = %job.paper_id, "job completed");
                }
                Ok(false) => {
                    // The lease was reclaimed while we ran; the retry will
                    // re-execute the stage body (at-least-once).
                    warn!(job_id = job.id, "job no longer held; completion not recorded");
                }
                Err(e) => {
                    error!(job_id = job.id, error = %e, "failed to mark job completed");
                }
            }
            metrics.processed.fetch_add(1, Ordering::SeqCst);
        }
        Err(failure) => {
            if let Some(backoff) = failure.rate_limit_backoff {
                ctx.limiter.report_limit_hit(job.stage.provider(), backoff);
            }

            match ctx
                .store
                .mark_failure(job.id, &failure.message, failure.permanent)
                .await
            {
                Ok(updated) => {
                    warn!(
                        job_id = job.id,
                        stage = %job.stage,
                        paper_id = %job.paper_id,
                        status = %updated.status,
                        retry_count = updated.retry_count,
                        error = %failure.message,
                        "job failed"
                    );
                }
                Err(e) => {
                    error!(job_id = job.id, error = %e, "failed to mark job failed");
                }
            }

            if let Err(e) = ctx.tracker.record_error(&job.paper_id).await {
                error!(paper_id = %job.paper_id, error = %e, "failed to record paper error");
            }

            metrics.failed.fetch_add(1, Ordering::SeqCst);
            metrics
                .last_error_unix_ms
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        }
    }
}

/// Run the stage body under its wall-clock budget and classify the result.
async fn execute(ctx: &WorkerContext, job: &Job) -> Result<(), StageFailure> {
    let Some(handler) = ctx.handlers.get(job.stage) else {
        return Err(StageFailure {
            message: format!("no handler registered for stage {}", job.stage),
            permanent: true,
            rate_limit_backoff: None,
        });
    };

    let budget = job.stage.attempt_budget();
    match tokio::time::timeout(budget, handler.run(&job.paper_id, &job.metadata)).await {
        Err(_) => Err(StageFailure {
            message: format!("attempt exceeded {}s budget", budget.as_secs()),
            permanent: false,
            rate_limit_backoff: None,
        }),
        Ok(Ok(())) => Ok(()),
        Ok(Err(StageError::Transient(message))) => Err(StageFailure {
            message,
            permanent: false,
            rate_limit_backoff: None,
        }),
        Ok(Err(StageError::Permanent(message))) => Err(StageFailure {
            message,
            permanent: true,
            rate_limit_backoff: None,
        }),
        Ok(Err(StageError::RateLimited {
            backoff_seconds,
            message,
        })) => {
            let backoff = if backoff_seconds > 0 {
                Duration::from_secs(backoff_seconds as u64)
            } else {
                ctx.config.default_backoff
            };
            Err(StageFailure {
                message: format!("rate limited: {message}"),
                permanent: false,
                rate_limit_backoff: Some(backoff),
            })
        }
    }
}

async fn idle_sleep(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
