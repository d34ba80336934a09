//! Test doubles for the queue, the state tracker, and stage bodies.
//!
//! The in-memory store and tracker mirror the semantics of their
//! PostgreSQL counterparts (claim ordering, idempotent enqueue, lease
//! reclaim, completeness recompute) so scheduler and worker-pool behavior
//! can be exercised without a database. [`RecordingHandler`] is a scripted
//! stage body that records every invocation for later inspection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::jobs::{
    retry_backoff, EnqueueResult, Job, JobCount, JobFilter, JobPage, JobStatus, JobStore, NewJob,
};
use crate::stages::{Stage, StageError, StageHandler};
use crate::state::{
    BackfillFilter, CompletenessDistribution, IncompletePaper, ProcessingState, StageCompletion,
    StageCompletionCounts, StateTracker,
};

// ============================================================================
// In-memory job store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    jobs: BTreeMap<i64, Job>,
    next_id: i64,
}

/// In-memory [`JobStore`] with the same observable behavior as
/// [`crate::jobs::PgJobStore`]. The single lock stands in for the
/// database's row-level atomicity: claims are serialized, so at most one
/// caller captures any pending job.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<StoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job row, ordered by id.
    pub fn all_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.values().cloned().collect()
    }

    /// Directly overwrite a job row (test setup for lease/backoff cases).
    pub fn put_job(&self, job: Job) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueResult> {
        let key = job.idempotency_key();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = inner.jobs.values().find(|j| j.idempotency_key == key) {
            return Ok(EnqueueResult::Duplicate(existing.id));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.insert(
            id,
            Job {
                id,
                stage: job.stage,
                paper_id: job.paper_id,
                batch_id: job.batch_id,
                priority: job.priority,
                status: JobStatus::Pending,
                idempotency_key: key,
                metadata: job.metadata,
                retry_count: 0,
                max_retries: job.max_retries,
                not_before: None,
                worker_id: None,
                lease_expires_at: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error_message: None,
            },
        );

        Ok(EnqueueResult::Created(id))
    }

    async fn claim_next(
        &self,
        stages: &[Stage],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let candidate = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && stages.contains(&j.stage)
                    && j.retry_count <= j.max_retries
                    && j.not_before.map(|nb| nb <= now).unwrap_or(true)
            })
            .max_by_key(|j| (j.priority.as_i32(), -j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("candidate id exists");
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.lease_expires_at = Some(now + chrono::Duration::milliseconds(lease.as_millis() as i64));

        Ok(Some(job.clone()))
    }

    async fn mark_success(&self, job_id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing {
            return Ok(false);
        }

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.worker_id = None;
        job.lease_expires_at = None;
        job.error_message = None;
        Ok(true)
    }

    async fn mark_failure(&self, job_id: i64, error: &str, permanent: bool) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;

        if job.status != JobStatus::Processing {
            return Ok(job.clone());
        }

        if !permanent && job.retry_count < job.max_retries {
            let backoff = retry_backoff(job.retry_count);
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.not_before =
                Some(Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64));
            job.worker_id = None;
            job.lease_expires_at = None;
            job.started_at = None;
            job.error_message = Some(error.to_string());
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.worker_id = None;
            job.lease_expires_at = None;
            job.error_message = Some(error.to_string());
        }

        Ok(job.clone())
    }

    async fn retry(&self, job_id: i64, reset_budget: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        if reset_budget {
            job.retry_count = 0;
        }
        job.not_before = None;
        job.started_at = None;
        job.completed_at = None;
        job.worker_id = None;
        job.lease_expires_at = None;
        job.error_message = None;
        Ok(true)
    }

    async fn cancel(&self, job_id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for job in inner.jobs.values_mut() {
            if job.batch_id == Some(batch_id) && job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| {
                filter.status.map(|s| j.status == s).unwrap_or(true)
                    && filter.stage.map(|s| j.stage == s).unwrap_or(true)
                    && filter
                        .paper_id
                        .as_ref()
                        .map(|p| &j.paper_id == p)
                        .unwrap_or(true)
                    && filter.batch_id.map(|b| j.batch_id == Some(b)).unwrap_or(true)
            })
            .collect();

        matching.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));

        let total = matching.len() as i64;
        let limit = filter.effective_limit();
        let jobs = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            jobs,
            total,
            limit,
            offset: filter.offset,
        })
    }

    async fn counts(&self) -> Result<Vec<JobCount>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut grouped: BTreeMap<(Stage, JobStatus), i64> = BTreeMap::new();

        for job in inner.jobs.values() {
            *grouped.entry((job.stage, job.status)).or_insert(0) += 1;
        }

        Ok(grouped
            .into_iter()
            .map(|((stage, status), count)| JobCount {
                stage,
                status,
                count,
            })
            .collect())
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut reclaimed = 0;

        for job in inner.jobs.values_mut() {
            if job.status != JobStatus::Processing {
                continue;
            }
            let Some(expires) = job.lease_expires_at else {
                continue;
            };
            if expires >= now {
                continue;
            }

            if job.retry_count < job.max_retries {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.worker_id = None;
                job.lease_expires_at = None;
                job.started_at = None;
                job.error_message = Some("lease expired".to_string());
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.worker_id = None;
                job.lease_expires_at = None;
                job.error_message = Some("lease expired; retry budget exhausted".to_string());
            }
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

// ============================================================================
// In-memory state tracker
// ============================================================================

/// In-memory [`StateTracker`] mirroring [`crate::state::PgStateTracker`].
#[derive(Default)]
pub struct MemoryStateTracker {
    papers: Mutex<HashMap<String, ProcessingState>>,
}

impl MemoryStateTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateTracker for MemoryStateTracker {
    async fn register_paper(
        &self,
        paper_id: &str,
        published_at: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<()> {
        let mut papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let state = papers
            .entry(paper_id.to_string())
            .or_insert_with(|| ProcessingState::new(paper_id));
        if published_at.is_some() {
            state.published_at = published_at;
        }
        state.priority = priority;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn stamp(&self, paper_id: &str, stage: Stage) -> Result<()> {
        let mut papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let state = papers
            .entry(paper_id.to_string())
            .or_insert_with(|| ProcessingState::new(paper_id));
        let now = Utc::now();
        state.set_stage_completed_at(stage, now);
        state.completeness_score = state.computed_completeness();
        state.updated_at = now;
        Ok(())
    }

    async fn get(&self, paper_id: &str) -> Result<Option<ProcessingState>> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(papers.get(paper_id).cloned())
    }

    async fn completeness(&self, paper_id: &str) -> Result<i32> {
        Ok(self
            .get(paper_id)
            .await?
            .map(|s| s.completeness_score)
            .unwrap_or(0))
    }

    async fn pending_stages(&self, paper_id: &str) -> Result<Vec<Stage>> {
        Ok(self
            .get(paper_id)
            .await?
            .map(|s| s.missing_stages())
            .unwrap_or_else(|| Stage::EXECUTION_ORDER.to_vec()))
    }

    async fn record_error(&self, paper_id: &str) -> Result<()> {
        let mut papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let state = papers
            .entry(paper_id.to_string())
            .or_insert_with(|| ProcessingState::new(paper_id));
        state.error_count += 1;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_errors(&self, paper_id: &str) -> Result<()> {
        let mut papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = papers.get_mut(paper_id) {
            state.error_count = 0;
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_incomplete(&self, filter: &BackfillFilter) -> Result<Vec<IncompletePaper>> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<&ProcessingState> = papers
            .values()
            .filter(|s| {
                s.completeness_score >= filter.min_completeness
                    && s.completeness_score <= filter.max_completeness
                    && s.completeness_score < 100
                    && s.error_count < filter.max_error_count
                    && filter
                        .published_after
                        .map(|after| s.published_at.map(|p| p >= after).unwrap_or(false))
                        .unwrap_or(true)
                    && filter
                        .published_before
                        .map(|before| s.published_at.map(|p| p <= before).unwrap_or(false))
                        .unwrap_or(true)
                    && filter.min_priority.map(|min| s.priority >= min).unwrap_or(true)
            })
            .collect();

        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.completeness_score.cmp(&b.completeness_score))
                .then(a.paper_id.cmp(&b.paper_id))
        });

        Ok(matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.clamp(1, 10_000) as usize)
            .filter_map(|state| {
                let missing = state.missing_stages();
                if missing.is_empty() {
                    return None;
                }
                Some(IncompletePaper {
                    paper_id: state.paper_id.clone(),
                    completeness_score: state.completeness_score,
                    priority: state.priority,
                    missing,
                })
            })
            .collect())
    }

    async fn completeness_distribution(&self) -> Result<CompletenessDistribution> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let mut distribution = CompletenessDistribution::default();
        for state in papers.values() {
            distribution.add(state.completeness_score);
        }
        Ok(distribution)
    }

    async fn stage_completion_counts(&self) -> Result<StageCompletionCounts> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        let stages = Stage::EXECUTION_ORDER
            .into_iter()
            .map(|stage| StageCompletion {
                stage,
                completed: papers
                    .values()
                    .filter(|s| s.stage_completed_at(stage).is_some())
                    .count() as i64,
            })
            .collect();

        Ok(StageCompletionCounts {
            total_papers: papers.len() as i64,
            stages,
        })
    }
}

// ============================================================================
// Scripted stage handler
// ============================================================================

/// Outcome script entries for [`RecordingHandler`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    FailTransient,
    FailPermanent,
    RateLimited { backoff_seconds: u32 },
}

impl ScriptedOutcome {
    fn into_result(self) -> Result<(), StageError> {
        match self {
            ScriptedOutcome::Succeed => Ok(()),
            ScriptedOutcome::FailTransient => Err(StageError::transient("scripted failure")),
            ScriptedOutcome::FailPermanent => Err(StageError::permanent("scripted failure")),
            ScriptedOutcome::RateLimited { backoff_seconds } => {
                Err(StageError::rate_limited(backoff_seconds, "scripted 429"))
            }
        }
    }
}

/// One recorded stage-body invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub paper_id: String,
    pub at: tokio::time::Instant,
}

/// Stage body that records invocations and replays a scripted outcome
/// queue, falling back to a fixed outcome once the queue drains.
pub struct RecordingHandler {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    delay: Duration,
    invocations: Mutex<Vec<Invocation>>,
}

impl RecordingHandler {
    pub fn succeeding() -> Self {
        Self::with_fallback(ScriptedOutcome::Succeed)
    }

    pub fn with_fallback(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Simulate work taking this long per invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue an outcome for the next invocation.
    pub fn queue(&self, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Paper ids in invocation order.
    pub fn invoked_papers(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|i| i.paper_id)
            .collect()
    }
}

#[async_trait]
impl StageHandler for RecordingHandler {
    async fn run(&self, paper_id: &str, _metadata: &serde_json::Value) -> Result<(), StageError> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invocation {
                paper_id: paper_id.to_string(),
                at: tokio::time::Instant::now(),
            });

        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        outcome.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPriority;

    fn new_job(stage: Stage, paper: &str, priority: JobPriority) -> NewJob {
        NewJob::builder()
            .stage(stage)
            .paper_id(paper)
            .priority(priority)
            .build()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_stage_paper_batch() {
        let store = MemoryJobStore::new();

        let first = store
            .enqueue(new_job(Stage::AiAnalysis, "p1", JobPriority::Normal))
            .await
            .unwrap();
        assert!(first.is_created());

        for _ in 0..2 {
            let dup = store
                .enqueue(new_job(Stage::AiAnalysis, "p1", JobPriority::Normal))
                .await
                .unwrap();
            assert!(!dup.is_created());
            assert_eq!(dup.job_id(), first.job_id());
        }

        assert_eq!(store.all_jobs().len(), 1);
        let job = store.get(first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn claim_respects_priority_then_insertion_order() {
        let store = MemoryJobStore::new();
        store
            .enqueue(new_job(Stage::Embedding, "p1", JobPriority::Normal))
            .await
            .unwrap();
        store
            .enqueue(new_job(Stage::Embedding, "p2", JobPriority::Critical))
            .await
            .unwrap();
        store
            .enqueue(new_job(Stage::Embedding, "p3", JobPriority::Normal))
            .await
            .unwrap();

        let stages = [Stage::Embedding];
        let lease = Duration::from_secs(60);

        let first = store.claim_next(&stages, "w", lease).await.unwrap().unwrap();
        assert_eq!(first.paper_id, "p2");

        let second = store.claim_next(&stages, "w", lease).await.unwrap().unwrap();
        assert_eq!(second.paper_id, "p1");

        let third = store.claim_next(&stages, "w", lease).await.unwrap().unwrap();
        assert_eq!(third.paper_id, "p3");

        assert!(store.claim_next(&stages, "w", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_filters_by_stage_set() {
        let store = MemoryJobStore::new();
        store
            .enqueue(new_job(Stage::AiAnalysis, "p1", JobPriority::Critical))
            .await
            .unwrap();

        let claimed = store
            .claim_next(&[Stage::Embedding, Stage::Relationships], "w", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn at_most_one_claim_per_job_under_contention() {
        let store = std::sync::Arc::new(MemoryJobStore::new());
        store
            .enqueue(new_job(Stage::Embedding, "p1", JobPriority::Normal))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .claim_next(&[Stage::Embedding], &format!("w{i}"), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff_gate() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(new_job(Stage::Citations, "p1", JobPriority::Normal))
            .await
            .unwrap()
            .job_id();

        store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let job = store.mark_failure(id, "connection reset", false).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.not_before.unwrap() > Utc::now());

        // Still inside the backoff window: not claimable.
        let claimed = store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_failed() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(new_job(Stage::Citations, "p1", JobPriority::Normal))
            .await
            .unwrap()
            .job_id();

        store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let job = store.mark_failure(id, "schema violation", true).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_and_retry_preserves_counter() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(
                NewJob::builder()
                    .stage(Stage::Citations)
                    .paper_id("p1")
                    .max_retries(1)
                    .build(),
            )
            .await
            .unwrap()
            .job_id();

        // First transient failure consumes the single retry.
        store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let job = store.mark_failure(id, "timeout", false).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);

        // Make it immediately claimable again and fail once more.
        let mut job = store.get(id).await.unwrap().unwrap();
        job.not_before = None;
        store.put_job(job);

        store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let job = store.mark_failure(id, "timeout", false).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);

        // Operator retry preserves the counter and the job is claimable
        // for a forced final attempt.
        assert!(store.retry(id, false).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(store
            .claim_next(&[Stage::Citations], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn mark_success_is_idempotent() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(new_job(Stage::Embedding, "p1", JobPriority::Normal))
            .await
            .unwrap()
            .job_id();

        store
            .claim_next(&[Stage::Embedding], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(store.mark_success(id).await.unwrap());
        assert!(!store.mark_success(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_one_retry_charged() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(new_job(Stage::Embedding, "p1", JobPriority::Normal))
            .await
            .unwrap()
            .job_id();

        // Zero-length lease: expired the moment it is claimed.
        store
            .claim_next(&[Stage::Embedding], "w", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reclaim_expired_leases().await.unwrap(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn active_lease_is_not_reclaimed() {
        let store = MemoryJobStore::new();
        store
            .enqueue(new_job(Stage::Embedding, "p1", JobPriority::Normal))
            .await
            .unwrap();
        store
            .claim_next(&[Stage::Embedding], "w", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.reclaim_expired_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_batch_only_touches_pending_jobs() {
        let store = MemoryJobStore::new();
        let batch = Uuid::new_v4();

        let running = store
            .enqueue(
                NewJob::builder()
                    .stage(Stage::Embedding)
                    .paper_id("p1")
                    .batch_id(Some(batch))
                    .build(),
            )
            .await
            .unwrap()
            .job_id();
        store
            .enqueue(
                NewJob::builder()
                    .stage(Stage::Citations)
                    .paper_id("p1")
                    .batch_id(Some(batch))
                    .build(),
            )
            .await
            .unwrap();
        store
            .enqueue(new_job(Stage::Github, "p1", JobPriority::Normal))
            .await
            .unwrap();

        store
            .claim_next(&[Stage::Embedding], "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.cancel_batch(batch).await.unwrap(), 1);

        let running = store.get(running).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn list_filters_and_counts_totals() {
        let store = MemoryJobStore::new();
        for paper in ["p1", "p2", "p3"] {
            store
                .enqueue(new_job(Stage::Embedding, paper, JobPriority::Normal))
                .await
                .unwrap();
        }
        store
            .enqueue(new_job(Stage::Citations, "p1", JobPriority::Normal))
            .await
            .unwrap();

        let page = store
            .list(&JobFilter {
                stage: Some(Stage::Embedding),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.jobs.len(), 2);
        assert_eq!(page.total, 3);

        let page = store
            .list(&JobFilter {
                paper_id: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn tracker_stamp_keeps_completeness_consistent() {
        let tracker = MemoryStateTracker::new();

        tracker.stamp("p1", Stage::Embedding).await.unwrap();
        assert_eq!(tracker.completeness("p1").await.unwrap(), 11);

        tracker.stamp("p1", Stage::AiAnalysis).await.unwrap();
        assert_eq!(tracker.completeness("p1").await.unwrap(), 22);

        // Stamping the same stage again never lowers the score.
        tracker.stamp("p1", Stage::Embedding).await.unwrap();
        assert_eq!(tracker.completeness("p1").await.unwrap(), 22);

        let pending = tracker.pending_stages("p1").await.unwrap();
        assert_eq!(pending.len(), 7);
        assert!(!pending.contains(&Stage::Embedding));
    }

    #[tokio::test]
    async fn find_incomplete_is_the_inverse_of_stamping() {
        let tracker = MemoryStateTracker::new();
        tracker.register_paper("p1", None, 50).await.unwrap();
        tracker.stamp("p1", Stage::Embedding).await.unwrap();
        tracker.stamp("p1", Stage::AiAnalysis).await.unwrap();

        let candidates = tracker
            .find_incomplete(&BackfillFilter::default())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        let expected: Vec<Stage> = Stage::EXECUTION_ORDER
            .into_iter()
            .filter(|s| !matches!(s, Stage::Embedding | Stage::AiAnalysis))
            .collect();
        assert_eq!(candidates[0].missing, expected);
    }

    #[tokio::test]
    async fn find_incomplete_skips_error_budget_exhausted_papers() {
        let tracker = MemoryStateTracker::new();
        tracker.register_paper("p1", None, 50).await.unwrap();
        for _ in 0..5 {
            tracker.record_error("p1").await.unwrap();
        }

        let candidates = tracker
            .find_incomplete(&BackfillFilter::default())
            .await
            .unwrap();
        assert!(candidates.is_empty());

        tracker.reset_errors("p1").await.unwrap();
        let candidates = tracker
            .find_incomplete(&BackfillFilter::default())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn find_incomplete_orders_by_priority_then_completeness() {
        let tracker = MemoryStateTracker::new();
        tracker.register_paper("low", None, 25).await.unwrap();
        tracker.register_paper("high", None, 75).await.unwrap();
        tracker.register_paper("mid", None, 75).await.unwrap();
        tracker.stamp("mid", Stage::Embedding).await.unwrap();

        let candidates = tracker
            .find_incomplete(&BackfillFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = candidates.iter().map(|c| c.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn find_incomplete_paginates() {
        let tracker = MemoryStateTracker::new();
        for i in 0..5 {
            tracker
                .register_paper(&format!("p{i}"), None, 50)
                .await
                .unwrap();
        }

        let first = tracker
            .find_incomplete(&BackfillFilter {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let second = tracker
            .find_incomplete(&BackfillFilter {
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0].paper_id, second[0].paper_id);
    }

    #[tokio::test]
    async fn recording_handler_replays_script_then_fallback() {
        let handler = RecordingHandler::succeeding();
        handler.queue(ScriptedOutcome::FailTransient);

        let err = handler.run("p1", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, StageError::Transient(_)));
        assert!(handler.run("p1", &serde_json::json!({})).await.is_ok());
        assert_eq!(handler.invocation_count(), 2);
    }
}
