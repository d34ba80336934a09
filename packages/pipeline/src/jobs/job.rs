//! Job model for the enrichment queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::time::Duration;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::stages::Stage;

/// Default retry budget per job.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are absorbing; only an explicit operator retry
    /// moves a `failed` job back to `pending`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job status: {s}"))
    }
}

/// Priority levels for job processing. Higher values dispatch sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 25,
    #[default]
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl JobPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl std::str::FromStr for JobPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            other => Err(anyhow::anyhow!("unknown priority: {other}")),
        }
    }
}

// ============================================================================
// Models
// ============================================================================

/// Parameters for enqueueing one job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub stage: Stage,
    pub paper_id: String,
    #[builder(default)]
    pub batch_id: Option<Uuid>,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
}

impl NewJob {
    /// Deterministic fingerprint that collapses re-enqueues of the same
    /// logical job: same (stage, paper, batch scope) always hashes to the
    /// same key, and the unique index on it makes enqueue idempotent.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.stage, &self.paper_id, self.batch_id.as_ref())
    }
}

/// Compute the idempotency key for a (stage, paper, batch) triple.
///
/// Jobs enqueued outside any batch share the literal `single` scope, so
/// an on-demand re-enqueue of a stage that is already pending dedupes
/// against the existing row.
pub fn idempotency_key(stage: Stage, paper_id: &str, batch_id: Option<&Uuid>) -> String {
    let scope = batch_id
        .map(|b| b.to_string())
        .unwrap_or_else(|| "single".to_string());

    let mut hasher = Sha256::new();
    hasher.update(stage.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(paper_id.as_bytes());
    hasher.update(b":");
    hasher.update(scope.as_bytes());
    hex::encode(hasher.finalize())
}

/// One scheduled execution of one stage on one paper.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: i64,
    pub stage: Stage,
    pub paper_id: String,
    pub batch_id: Option<Uuid>,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,

    // Retry accounting
    pub retry_count: i32,
    pub max_retries: i32,
    pub not_before: Option<DateTime<Utc>>,

    // Lease management
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Timestamps and error tracking
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Remaining retry budget.
    pub fn retries_left(&self) -> i32 {
        (self.max_retries - self.retry_count).max(0)
    }
}

/// Exponential backoff before the nth re-queue of a transient failure,
/// capped at one hour.
pub fn retry_backoff(retry_count: i32) -> Duration {
    let secs = 2i64
        .checked_pow(retry_count.clamp(0, 30) as u32)
        .unwrap_or(3600)
        .min(3600);
    Duration::from_secs(secs as u64)
}

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new job row was created.
    Created(i64),
    /// A row for the same (stage, paper, batch) already exists.
    Duplicate(i64),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate.
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable() {
        let batch = Uuid::new_v4();
        let a = idempotency_key(Stage::AiAnalysis, "p1", Some(&batch));
        let b = idempotency_key(Stage::AiAnalysis, "p1", Some(&batch));
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_separates_batch_scopes() {
        let batch = Uuid::new_v4();
        let batched = idempotency_key(Stage::AiAnalysis, "p1", Some(&batch));
        let single = idempotency_key(Stage::AiAnalysis, "p1", None);
        assert_ne!(batched, single);
    }

    #[test]
    fn idempotency_key_separates_stages_and_papers() {
        let a = idempotency_key(Stage::Embedding, "p1", None);
        let b = idempotency_key(Stage::Citations, "p1", None);
        let c = idempotency_key(Stage::Embedding, "p2", None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn priority_values_match_dispatch_order() {
        assert!(JobPriority::Critical.as_i32() > JobPriority::High.as_i32());
        assert!(JobPriority::High.as_i32() > JobPriority::Normal.as_i32());
        assert!(JobPriority::Normal.as_i32() > JobPriority::Low.as_i32());
        assert_eq!(JobPriority::Normal.as_i32(), 50);
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(5), Duration::from_secs(32));
        assert_eq!(retry_backoff(20), Duration::from_secs(3600));
    }

    #[test]
    fn terminal_states_are_exactly_the_absorbing_ones() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn enqueue_result_helpers() {
        let created = EnqueueResult::Created(7);
        assert!(created.is_created());
        assert_eq!(created.job_id(), 7);

        let duplicate = EnqueueResult::Duplicate(7);
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job_id(), 7);
    }

    #[test]
    fn new_job_builder_defaults() {
        let job = NewJob::builder()
            .stage(Stage::Embedding)
            .paper_id("p1")
            .build();
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.batch_id.is_none());
    }
}
