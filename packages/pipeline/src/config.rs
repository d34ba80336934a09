//! Configuration.
//!
//! Deployment-specific values (database URL, pool size) come from the
//! environment via [`Config::from_env`]; pipeline tuning lives in
//! [`PipelineConfig`], constructed in code with defaults that match the
//! providers' published limits.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::rate_limit::{default_rate_limits, RateLimitConfig};
use crate::stages::{PoolGroup, Provider, Stage};

/// Margin added to a stage's attempt budget when deriving its lease, so a
/// healthy worker always marks the job before the lease can expire.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Process-level configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_pool_size: env::var("PIPELINE_DB_POOL_SIZE")
                .ok()
                .map(|v| v.parse().context("PIPELINE_DB_POOL_SIZE must be an integer"))
                .transpose()?
                .unwrap_or(10),
        })
    }
}

/// Tuning knobs for the scheduler, workers and rate limiter.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Initial worker count per dispatch group.
    pub pool_sizes: HashMap<PoolGroup, usize>,
    /// Bucket seeds per provider.
    pub rate_limits: HashMap<Provider, RateLimitConfig>,
    /// Per-stage lease overrides; unset stages use attempt budget + margin.
    pub lease_overrides: HashMap<Stage, Duration>,
    /// Default retry budget for enqueued jobs.
    pub max_retries: i32,
    /// How often the lease sweep runs.
    pub reclaim_interval: Duration,
    /// Worker sleep when the queue is empty.
    pub poll_interval_empty: Duration,
    /// Bounded wait for a rate-limit token before a worker re-loops.
    pub acquire_wait: Duration,
    /// Backoff applied on a 429 that carries no retry-after hint.
    pub default_backoff: Duration,
    /// Papers with more recorded errors are skipped by backfill.
    pub error_count_threshold: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_sizes: PoolGroup::ALL
                .into_iter()
                .map(|g| (g, g.default_size()))
                .collect(),
            rate_limits: default_rate_limits(),
            lease_overrides: HashMap::new(),
            max_retries: 5,
            reclaim_interval: Duration::from_secs(30),
            poll_interval_empty: Duration::from_millis(500),
            acquire_wait: Duration::from_secs(2),
            default_backoff: Duration::from_secs(60),
            error_count_threshold: 5,
        }
    }
}

impl PipelineConfig {
    pub fn pool_size(&self, group: PoolGroup) -> usize {
        self.pool_sizes
            .get(&group)
            .copied()
            .unwrap_or_else(|| group.default_size())
    }

    /// Lease length for one claimed attempt of the stage.
    pub fn lease_duration(&self, stage: Stage) -> Duration {
        self.lease_overrides
            .get(&stage)
            .copied()
            .unwrap_or_else(|| stage.attempt_budget() + LEASE_MARGIN)
    }
}
