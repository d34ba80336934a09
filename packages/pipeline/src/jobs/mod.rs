//! Job queue infrastructure.
//!
//! - [`Job`] / [`NewJob`] - the queue row model and enqueue parameters
//! - [`JobStore`] - queue operations trait; [`PgJobStore`] is the
//!   PostgreSQL implementation
//! - [`LeaseReclaimer`] - periodic sweep that recovers crashed workers
//!
//! # Architecture
//!
//! ```text
//! Producers (backfill / ingestion / on-demand)
//!     │
//!     └─► JobStore.enqueue (idempotency-keyed insert)
//!
//! Worker
//!     │
//!     ├─► JobStore.claim_next (FOR UPDATE SKIP LOCKED, lease assigned)
//!     ├─► run stage body
//!     └─► JobStore.mark_success / mark_failure
//!
//! LeaseReclaimer (every reclaim_interval)
//!     └─► processing rows past lease_expires_at → pending (+1 retry)
//! ```

mod job;
mod reclaimer;
mod store;

pub use job::{
    idempotency_key, retry_backoff, EnqueueResult, Job, JobPriority, JobStatus, NewJob,
    DEFAULT_MAX_RETRIES,
};
pub use reclaimer::LeaseReclaimer;
pub use store::{JobCount, JobFilter, JobPage, JobStore, PgJobStore};
