//! Control surface: the operations an operator (or the admin API layer)
//! drives the pipeline with.
//!
//! Everything here is synchronous in the store: backfill and enrichment
//! walk candidate papers and enqueue idempotent jobs, returning counts
//! immediately. Only workers run stage bodies, so no control operation
//! inherits a long-running body's lifetime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::jobs::{EnqueueResult, JobCount, JobFilter, JobPage, JobPriority, JobStore, NewJob};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::stages::{Provider, Stage};
use crate::state::{
    BackfillFilter, CompletenessDistribution, StageCompletionCounts, StateTracker,
};
use crate::workers::{PoolStatus, WorkerPool};

/// Page size for walking backfill candidates; the corpus exceeds memory.
const BACKFILL_PAGE_SIZE: i64 = 500;

/// Parameters for a backfill run.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    /// Stages to enqueue for every candidate; `None` auto-detects each
    /// paper's missing stages.
    pub stages: Option<Vec<Stage>>,
    /// Cap on candidate papers; `None` walks the whole corpus.
    pub max_papers: Option<i64>,
    pub priority: JobPriority,
    pub min_completeness: i32,
    pub max_completeness: i32,
    pub published_after: Option<DateTime<Utc>>,
    pub published_before: Option<DateTime<Utc>>,
}

impl Default for BackfillRequest {
    fn default() -> Self {
        Self {
            stages: None,
            max_papers: None,
            priority: JobPriority::Normal,
            min_completeness: 0,
            max_completeness: 99,
            published_after: None,
            published_before: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub batch_id: Uuid,
    pub papers_found: u64,
    pub jobs_created: u64,
    pub jobs_skipped: u64,
    pub priority: JobPriority,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentSummary {
    pub batch_id: Uuid,
    pub paper_count: usize,
    pub jobs_created: u64,
    pub jobs_skipped: u64,
    pub priority: JobPriority,
}

/// A freshly ingested paper to register and enqueue.
#[derive(Debug, Clone)]
pub struct PaperRegistration {
    pub paper_id: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Aggregate health snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queue: Vec<JobCount>,
    pub rate_limits: Vec<RateLimitStats>,
    pub workers: Option<PoolStatus>,
    pub completeness: CompletenessDistribution,
    pub stage_completion: StageCompletionCounts,
}

/// The pipeline's composition root for control operations.
///
/// Holds the store, tracker and limiter; the worker pool is optional so
/// queue-only processes (the admin CLI) can share the same surface.
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    tracker: Arc<dyn StateTracker>,
    limiter: Arc<RateLimiter>,
    pool: Option<Arc<WorkerPool>>,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        tracker: Arc<dyn StateTracker>,
        limiter: Arc<RateLimiter>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            tracker,
            limiter,
            pool: None,
            config,
        }
    }

    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<dyn StateTracker> {
        &self.tracker
    }

    // ------------------------------------------------------------------
    // Enqueue flows
    // ------------------------------------------------------------------

    /// Enqueue one stage for one paper.
    pub async fn enqueue_stage(
        &self,
        stage: Stage,
        paper_id: &str,
        priority: JobPriority,
        batch_id: Option<Uuid>,
        metadata: serde_json::Value,
    ) -> Result<EnqueueResult> {
        self.store
            .enqueue(
                NewJob::builder()
                    .stage(stage)
                    .paper_id(paper_id)
                    .priority(priority)
                    .batch_id(batch_id)
                    .metadata(metadata)
                    .max_retries(self.config.max_retries)
                    .build(),
            )
            .await
    }

    /// On-demand enrichment for a caller-chosen set of papers.
    pub async fn create_enrichment(
        &self,
        paper_ids: &[String],
        stages: Option<&[Stage]>,
        priority: JobPriority,
    ) -> Result<EnrichmentSummary> {
        let batch_id = Uuid::new_v4();
        let stages = stages.unwrap_or(&Stage::EXECUTION_ORDER);

        let mut created = 0u64;
        let mut skipped = 0u64;

        for paper_id in paper_ids {
            for stage in stages {
                let result = self
                    .enqueue_stage(*stage, paper_id, priority, Some(batch_id), serde_json::json!({}))
                    .await?;
                if result.is_created() {
                    created += 1;
                } else {
                    skipped += 1;
                }
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            papers = paper_ids.len(),
            created,
            skipped,
            "enrichment jobs enqueued"
        );

        Ok(EnrichmentSummary {
            batch_id,
            paper_count: paper_ids.len(),
            jobs_created: created,
            jobs_skipped: skipped,
            priority,
        })
    }

    /// Ingestion entry point: register state rows for new papers and
    /// enqueue every stage for each of them.
    pub async fn register_papers(
        &self,
        papers: &[PaperRegistration],
        priority: JobPriority,
    ) -> Result<EnrichmentSummary> {
        for paper in papers {
            self.tracker
                .register_paper(&paper.paper_id, paper.published_at, priority.as_i32())
                .await?;
        }

        let paper_ids: Vec<String> = papers.iter().map(|p| p.paper_id.clone()).collect();
        self.create_enrichment(&paper_ids, None, priority).await
    }

    /// Scan-driven bulk enqueue for papers whose processing state is
    /// incomplete. Walks candidates page by page; every job is
    /// idempotency-keyed under one batch, so re-running a backfill only
    /// tops up what is still missing.
    pub async fn create_backfill(&self, request: BackfillRequest) -> Result<BackfillSummary> {
        let batch_id = Uuid::new_v4();

        let mut papers_found = 0u64;
        let mut created = 0u64;
        let mut skipped = 0u64;
        let mut offset = 0i64;

        loop {
            let page_limit = match request.max_papers {
                Some(max) => (max - papers_found as i64).min(BACKFILL_PAGE_SIZE),
                None => BACKFILL_PAGE_SIZE,
            };
            if page_limit <= 0 {
                break;
            }

            let candidates = self
                .tracker
                .find_incomplete(&BackfillFilter {
                    min_completeness: request.min_completeness,
                    max_completeness: request.max_completeness,
                    published_after: request.published_after,
                    published_before: request.published_before,
                    max_error_count: self.config.error_count_threshold,
                    min_priority: None,
                    limit: page_limit,
                    offset,
                })
                .await?;

            if candidates.is_empty() {
                break;
            }
            offset += candidates.len() as i64;

            for candidate in &candidates {
                papers_found += 1;

                let stages: Vec<Stage> = match &request.stages {
                    Some(explicit) => explicit.clone(),
                    None => candidate.missing.clone(),
                };

                for stage in stages {
                    let result = self
                        .enqueue_stage(
                            stage,
                            &candidate.paper_id,
                            request.priority,
                            Some(batch_id),
                            serde_json::json!({}),
                        )
                        .await?;
                    if result.is_created() {
                        created += 1;
                    } else {
                        skipped += 1;
                    }
                }
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            papers_found,
            created,
            skipped,
            "backfill jobs enqueued"
        );

        Ok(BackfillSummary {
            batch_id,
            papers_found,
            jobs_created: created,
            jobs_skipped: skipped,
            priority: request.priority,
        })
    }

    // ------------------------------------------------------------------
    // Job administration
    // ------------------------------------------------------------------

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        self.store.list(filter).await
    }

    pub async fn retry_job(&self, job_id: i64, reset_budget: bool) -> Result<bool> {
        self.store.retry(job_id, reset_budget).await
    }

    pub async fn cancel_job(&self, job_id: i64) -> Result<bool> {
        self.store.cancel(job_id).await
    }

    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<u64> {
        self.store.cancel_batch(batch_id).await
    }

    // ------------------------------------------------------------------
    // Workers and rate limits
    // ------------------------------------------------------------------

    pub fn start_workers(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.start(),
            None => anyhow::bail!("no worker pool attached"),
        }
    }

    pub async fn stop_workers(&self, graceful: Duration) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.stop(graceful).await,
            None => Ok(()),
        }
    }

    pub fn scale_workers(&self, group: crate::stages::PoolGroup, count: usize) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.scale(group, count),
            None => anyhow::bail!("no worker pool attached"),
        }
    }

    pub fn rate_limit_stats(&self) -> Vec<RateLimitStats> {
        self.limiter.all_stats()
    }

    pub fn clear_backoff(&self, provider: Provider) {
        self.limiter.clear_backoff(provider);
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn health(&self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            generated_at: Utc::now(),
            queue: self.store.counts().await?,
            rate_limits: self.limiter.all_stats(),
            workers: self.pool.as_ref().map(|p| p.status()),
            completeness: self.tracker.completeness_distribution().await?,
            stage_completion: self.tracker.stage_completion_counts().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::testing::{MemoryJobStore, MemoryStateTracker};

    fn pipeline() -> (Pipeline, Arc<MemoryJobStore>, Arc<MemoryStateTracker>) {
        let store = Arc::new(MemoryJobStore::new());
        let tracker = Arc::new(MemoryStateTracker::new());
        let pipeline = Pipeline::new(
            store.clone(),
            tracker.clone(),
            Arc::new(RateLimiter::seeded()),
            Arc::new(PipelineConfig::default()),
        );
        (pipeline, store, tracker)
    }

    #[tokio::test]
    async fn enrichment_enqueues_every_stage_per_paper() {
        let (pipeline, store, _) = pipeline();

        let papers = vec!["p1".to_string(), "p2".to_string()];
        let summary = pipeline
            .create_enrichment(&papers, None, JobPriority::High)
            .await
            .unwrap();

        assert_eq!(summary.jobs_created, 18);
        assert_eq!(summary.jobs_skipped, 0);
        assert_eq!(store.all_jobs().len(), 18);

        // Re-enqueueing a stage within the same batch scope dedupes.
        let batch = summary.batch_id;
        let dup = pipeline
            .enqueue_stage(
                Stage::Embedding,
                "p1",
                JobPriority::High,
                Some(batch),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(!dup.is_created());
    }

    #[tokio::test]
    async fn enrichment_with_explicit_stage_subset() {
        let (pipeline, store, _) = pipeline();

        let summary = pipeline
            .create_enrichment(
                &["p1".to_string()],
                Some(&[Stage::Embedding, Stage::Citations]),
                JobPriority::Normal,
            )
            .await
            .unwrap();

        assert_eq!(summary.jobs_created, 2);
        let stages: Vec<Stage> = store.all_jobs().iter().map(|j| j.stage).collect();
        assert_eq!(stages, vec![Stage::Embedding, Stage::Citations]);
    }

    #[tokio::test]
    async fn backfill_enqueues_exactly_the_missing_stages() {
        let (pipeline, store, tracker) = pipeline();

        tracker.register_paper("p1", None, 50).await.unwrap();
        tracker.stamp("p1", Stage::Embedding).await.unwrap();
        tracker.stamp("p1", Stage::AiAnalysis).await.unwrap();

        let summary = pipeline
            .create_backfill(BackfillRequest::default())
            .await
            .unwrap();

        assert_eq!(summary.papers_found, 1);
        assert_eq!(summary.jobs_created, 7);

        let stages: Vec<Stage> = store.all_jobs().iter().map(|j| j.stage).collect();
        assert!(!stages.contains(&Stage::Embedding));
        assert!(!stages.contains(&Stage::AiAnalysis));
        assert_eq!(stages.len(), 7);
    }

    #[tokio::test]
    async fn backfill_rerun_skips_existing_jobs_in_the_same_batch_scope() {
        let (pipeline, _, tracker) = pipeline();
        tracker.register_paper("p1", None, 50).await.unwrap();

        let first = pipeline
            .create_backfill(BackfillRequest::default())
            .await
            .unwrap();
        assert_eq!(first.jobs_created, 9);

        let dup = pipeline
            .enqueue_stage(
                Stage::Embedding,
                "p1",
                JobPriority::Normal,
                Some(first.batch_id),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(!dup.is_created());
    }

    #[tokio::test]
    async fn backfill_respects_max_papers() {
        let (pipeline, _, tracker) = pipeline();
        for i in 0..5 {
            tracker
                .register_paper(&format!("p{i}"), None, 50)
                .await
                .unwrap();
        }

        let summary = pipeline
            .create_backfill(BackfillRequest {
                max_papers: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.papers_found, 2);
        assert_eq!(summary.jobs_created, 18);
    }

    #[tokio::test]
    async fn backfill_skips_papers_over_the_error_threshold() {
        let (pipeline, store, tracker) = pipeline();
        tracker.register_paper("sick", None, 50).await.unwrap();
        for _ in 0..5 {
            tracker.record_error("sick").await.unwrap();
        }
        tracker.register_paper("healthy", None, 50).await.unwrap();

        let summary = pipeline
            .create_backfill(BackfillRequest::default())
            .await
            .unwrap();

        assert_eq!(summary.papers_found, 1);
        assert!(store.all_jobs().iter().all(|j| j.paper_id == "healthy"));
    }

    #[tokio::test]
    async fn register_papers_creates_state_and_jobs() {
        let (pipeline, store, tracker) = pipeline();

        let summary = pipeline
            .register_papers(
                &[PaperRegistration {
                    paper_id: "p1".to_string(),
                    published_at: Some(Utc::now()),
                }],
                JobPriority::Normal,
            )
            .await
            .unwrap();

        assert_eq!(summary.jobs_created, 9);
        assert!(tracker.get("p1").await.unwrap().is_some());
        assert_eq!(store.all_jobs().len(), 9);
    }

    #[tokio::test]
    async fn cancel_batch_through_the_controller() {
        let (pipeline, store, _) = pipeline();

        let summary = pipeline
            .create_enrichment(&["p1".to_string()], None, JobPriority::Normal)
            .await
            .unwrap();
        let cancelled = pipeline.cancel_batch(summary.batch_id).await.unwrap();

        assert_eq!(cancelled, 9);
        assert!(store
            .all_jobs()
            .iter()
            .all(|j| j.status == JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn rate_limit_surface_reports_and_clears_backoff() {
        let (pipeline, _, _) = pipeline();

        pipeline
            .limiter
            .report_limit_hit(Provider::LlmProvider, Duration::from_secs(300));
        let stats = pipeline.rate_limit_stats();
        let llm = stats
            .iter()
            .find(|s| s.provider == Provider::LlmProvider)
            .unwrap();
        assert!(llm.is_backed_off);

        pipeline.clear_backoff(Provider::LlmProvider);
        let stats = pipeline.rate_limit_stats();
        let llm = stats
            .iter()
            .find(|s| s.provider == Provider::LlmProvider)
            .unwrap();
        assert!(!llm.is_backed_off);
    }

    #[tokio::test]
    async fn health_aggregates_queue_state_and_completeness() {
        let (pipeline, _, tracker) = pipeline();

        tracker.register_paper("p1", None, 50).await.unwrap();
        tracker.stamp("p1", Stage::Embedding).await.unwrap();
        pipeline
            .create_enrichment(&["p1".to_string()], Some(&[Stage::Citations]), JobPriority::Low)
            .await
            .unwrap();

        let health = pipeline.health().await.unwrap();

        assert_eq!(health.queue.len(), 1);
        assert_eq!(health.queue[0].stage, Stage::Citations);
        assert_eq!(health.completeness.from_1_to_24, 1);
        assert_eq!(health.stage_completion.total_papers, 1);
        assert!(health.workers.is_none());
        assert_eq!(health.rate_limits.len(), 4);
    }
}
