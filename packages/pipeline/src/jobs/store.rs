//! Job store: durable queue operations over PostgreSQL.
//!
//! The store is the coordination substrate for every worker in every
//! process. The hot path is [`JobStore::claim_next`], which atomically
//! moves one pending row to `processing` under a lease; `FOR UPDATE SKIP
//! LOCKED` guarantees no two workers capture the same row.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::job::{retry_backoff, EnqueueResult, Job, JobStatus, NewJob};
use crate::stages::Stage;

const JOB_COLUMNS: &str = "id, stage, paper_id, batch_id, priority, status, idempotency_key, \
     metadata, retry_count, max_retries, not_before, worker_id, lease_expires_at, \
     created_at, started_at, completed_at, error_message";

/// Read filters for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub stage: Option<Stage>,
    pub paper_id: Option<String>,
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl JobFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

/// One page of a job listing, with the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Queue depth for one (stage, status) pair.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobCount {
    pub stage: Stage,
    pub status: JobStatus,
    pub count: i64,
}

/// Trait for job queue operations.
///
/// The production implementation is [`PgJobStore`]; tests run against the
/// in-memory store in [`crate::testing`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, collapsing duplicates by idempotency key.
    ///
    /// Safe under contention from many concurrent producers: the unique
    /// index arbitrates, and losers receive the existing row's id.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueResult>;

    /// Claim the next runnable job for one of the given stages.
    ///
    /// Picks the highest-priority pending row (FIFO within a priority
    /// level), transitions it to `processing` and assigns a lease. Rows
    /// still inside their retry backoff (`not_before` in the future) are
    /// skipped. Returns `None` when nothing is runnable.
    async fn claim_next(
        &self,
        stages: &[Stage],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>>;

    /// Mark a processing job completed. Returns false if the job was not
    /// in `processing` (a second call is a no-op).
    async fn mark_success(&self, job_id: i64) -> Result<bool>;

    /// Record a failed attempt.
    ///
    /// Transient failures consume retry budget and re-queue with
    /// exponential backoff; permanent failures (and exhausted budgets) end
    /// in `failed`. Returns the job's resulting state.
    async fn mark_failure(&self, job_id: i64, error: &str, permanent: bool) -> Result<Job>;

    /// Operator retry: `failed -> pending`. Preserves the retry counter
    /// unless `reset_budget` is set. Returns false if the job was not
    /// `failed`.
    async fn retry(&self, job_id: i64, reset_budget: bool) -> Result<bool>;

    /// Cancel a pending job. Returns false if the job was not `pending`.
    async fn cancel(&self, job_id: i64) -> Result<bool>;

    /// Cancel all pending jobs in a batch; returns how many were cancelled.
    async fn cancel_batch(&self, batch_id: Uuid) -> Result<u64>;

    async fn get(&self, job_id: i64) -> Result<Option<Job>>;

    async fn list(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Queue depth grouped by (stage, status).
    async fn counts(&self) -> Result<Vec<JobCount>>;

    /// Recover jobs whose worker died: `processing` rows past their lease
    /// go back to `pending` (a crash costs one retry), or to `failed` once
    /// the budget is exhausted. Returns how many rows were touched.
    async fn reclaim_expired_leases(&self) -> Result<u64>;
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueResult> {
        let key = job.idempotency_key();

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (stage, paper_id, batch_id, priority, status, idempotency_key, metadata, max_retries)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.stage)
        .bind(&job.paper_id)
        .bind(job.batch_id)
        .bind(job.priority)
        .bind(&key)
        .bind(&job.metadata)
        .bind(job.max_retries)
        .fetch_optional(&self.pool)
        .await
        .context("failed to enqueue job")?;

        if let Some(id) = inserted {
            return Ok(EnqueueResult::Created(id));
        }

        // Lost the insert race (or the row predates this call): hand back
        // the existing row's id.
        let existing: i64 = sqlx::query_scalar("SELECT id FROM jobs WHERE idempotency_key = $1")
            .bind(&key)
            .fetch_one(&self.pool)
            .await
            .context("failed to resolve duplicate job")?;

        Ok(EnqueueResult::Duplicate(existing))
    }

    async fn claim_next(
        &self,
        stages: &[Stage],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        if stages.is_empty() {
            return Ok(None);
        }

        let stage_names: Vec<String> = stages.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND stage = ANY($1::stage[])
                  AND retry_count <= max_retries
                  AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY priority DESC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                worker_id = $2,
                started_at = NOW(),
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(&stage_names)
            .bind(worker_id)
            .bind(lease.as_millis().to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to claim job")?;

        Ok(job)
    }

    async fn mark_success(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL,
                error_message = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to mark job completed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failure(&self, job_id: i64, error: &str, permanent: bool) -> Result<Job> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;

        // A lease reclaim or explicit cancel may have raced us; the row is
        // no longer ours to transition.
        if job.status != JobStatus::Processing {
            return Ok(job);
        }

        let requeue = !permanent && job.retry_count < job.max_retries;

        let updated = if requeue {
            let backoff = retry_backoff(job.retry_count);
            let sql = format!(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    not_before = NOW() + ($2 || ' milliseconds')::INTERVAL,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    started_at = NULL,
                    error_message = $3
                WHERE id = $1 AND status = 'processing'
                RETURNING {JOB_COLUMNS}
                "#
            );
            sqlx::query_as::<_, Job>(&sql)
                .bind(job_id)
                .bind(backoff.as_millis().to_string())
                .bind(error)
                .fetch_optional(&self.pool)
                .await
                .context("failed to re-queue job")?
        } else {
            let sql = format!(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    completed_at = NOW(),
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    error_message = $2
                WHERE id = $1 AND status = 'processing'
                RETURNING {JOB_COLUMNS}
                "#
            );
            sqlx::query_as::<_, Job>(&sql)
                .bind(job_id)
                .bind(error)
                .fetch_optional(&self.pool)
                .await
                .context("failed to mark job failed")?
        };

        match updated {
            Some(job) => Ok(job),
            // Raced a reclaim between the read and the guarded update.
            None => self
                .get(job_id)
                .await?
                .ok_or_else(|| anyhow!("job {job_id} not found")),
        }
    }

    async fn retry(&self, job_id: i64, reset_budget: bool) -> Result<bool> {
        let sql = if reset_budget {
            r#"
            UPDATE jobs
            SET status = 'pending', retry_count = 0, not_before = NULL,
                started_at = NULL, completed_at = NULL,
                worker_id = NULL, lease_expires_at = NULL, error_message = NULL
            WHERE id = $1 AND status = 'failed'
            "#
        } else {
            r#"
            UPDATE jobs
            SET status = 'pending', not_before = NULL,
                started_at = NULL, completed_at = NULL,
                worker_id = NULL, lease_expires_at = NULL, error_message = NULL
            WHERE id = $1 AND status = 'failed'
            "#
        };

        let result = sqlx::query(sql)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to retry job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to cancel job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = NOW()
            WHERE batch_id = $1 AND status = 'pending'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .context("failed to cancel batch")?;

        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job")?;

        Ok(job)
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let limit = filter.effective_limit();

        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"));
        push_filters(&mut query, filter);
        query.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(filter.offset);

        let jobs = query
            .build_query_as::<Job>()
            .fetch_all(&self.pool)
            .await
            .context("failed to list jobs")?;

        let mut count: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE 1=1");
        push_filters(&mut count, filter);

        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("failed to count jobs")?;

        Ok(JobPage {
            jobs,
            total,
            limit,
            offset: filter.offset,
        })
    }

    async fn counts(&self) -> Result<Vec<JobCount>> {
        let counts = sqlx::query_as::<_, JobCount>(
            r#"
            SELECT stage, status, COUNT(*) AS count
            FROM jobs
            GROUP BY stage, status
            ORDER BY stage, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count jobs by stage and status")?;

        Ok(counts)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("failed to open reclaim tx")?;

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                worker_id = NULL,
                lease_expires_at = NULL,
                started_at = NULL,
                error_message = 'lease expired'
            WHERE status = 'processing'
              AND lease_expires_at < NOW()
              AND retry_count < max_retries
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("failed to reclaim expired leases")?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL,
                error_message = 'lease expired; retry budget exhausted'
            WHERE status = 'processing'
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("failed to fail lease-exhausted jobs")?
        .rows_affected();

        tx.commit().await.context("failed to commit reclaim tx")?;

        Ok(requeued + failed)
    }
}

fn push_filters(query: &mut QueryBuilder<Postgres>, filter: &JobFilter) {
    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(status);
    }
    if let Some(stage) = filter.stage {
        query.push(" AND stage = ");
        query.push_bind(stage);
    }
    if let Some(paper_id) = &filter.paper_id {
        query.push(" AND paper_id = ");
        query.push_bind(paper_id.clone());
    }
    if let Some(batch_id) = filter.batch_id {
        query.push(" AND batch_id = ");
        query.push_bind(batch_id);
    }
}
