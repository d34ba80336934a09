//! Worker pools that drive stage execution.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► llm group       (15 workers) ── bucket: llm_provider
//!     ├─► citations group (2 workers)  ── bucket: citations_provider
//!     ├─► github group    (3 workers)  ── bucket: github
//!     └─► local group     (4 workers)  ── bucket: local
//!
//! each worker:
//!     acquire token ─► claim_next ─► stage body (budgeted) ─► mark + stamp
//! ```

mod pool;
mod worker;

pub use pool::{GroupStatus, PoolStatus, WorkerPool};
