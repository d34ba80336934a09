// Atlas Enrichment Pipeline - Core
//
// Durable, priority-scheduled enrichment of the paper corpus. Jobs live in
// PostgreSQL, are claimed under lease by per-kind worker pools, and are
// gated by per-provider rate limits. Backfill, ingestion and on-demand
// flows all funnel through the same idempotent enqueue path.
//
// Stage bodies (the code that actually calls an LLM or fetches citations)
// are external: deployments register them in a HandlerRegistry at process
// start. This crate owns everything around them.

pub mod config;
pub mod control;
pub mod jobs;
pub mod rate_limit;
pub mod stages;
pub mod state;
pub mod testing;
pub mod workers;

pub use config::*;
