//! Worker pool: per-group sub-pools with dynamic scale and graceful stop.
//!
//! Four sub-pools, one per dispatch group (`llm`, `citations`, `github`,
//! `local`). Growing a group spawns workers immediately; shrinking sets
//! the target and lets excess workers exit after their current job. Stop
//! broadcasts the shutdown token and waits up to the graceful deadline;
//! anything still in flight afterwards is recovered by the lease sweep.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::worker::{run_worker, GroupMetrics, WorkerContext};
use crate::config::PipelineConfig;
use crate::jobs::JobStore;
use crate::rate_limit::RateLimiter;
use crate::stages::{HandlerRegistry, PoolGroup};
use crate::state::StateTracker;

/// Observable state of one worker group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: PoolGroup,
    pub target: usize,
    pub live: usize,
    pub busy: usize,
    pub processed: u64,
    pub failed: u64,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Observable state of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub groups: Vec<GroupStatus>,
}

struct WorkerHandle {
    slot: usize,
    handle: JoinHandle<()>,
}

struct GroupState {
    target: Arc<AtomicUsize>,
    metrics: Arc<GroupMetrics>,
    workers: Vec<WorkerHandle>,
}

impl GroupState {
    fn new(target: usize) -> Self {
        Self {
            target: Arc::new(AtomicUsize::new(target)),
            metrics: Arc::new(GroupMetrics::default()),
            workers: Vec::new(),
        }
    }

    fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.handle.is_finished()).count()
    }
}

struct Running {
    shutdown: CancellationToken,
    groups: HashMap<PoolGroup, GroupState>,
}

/// Per-kind worker pools sharing one store, tracker and rate limiter.
pub struct WorkerPool {
    ctx: WorkerContext,
    inner: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        tracker: Arc<dyn StateTracker>,
        limiter: Arc<RateLimiter>,
        handlers: Arc<HandlerRegistry>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                store,
                tracker,
                limiter,
                handlers,
                config,
            },
            inner: Mutex::new(None),
        }
    }

    /// Spawn the configured number of workers for every group.
    ///
    /// Groups whose stages have no registered handler start with zero
    /// workers; their jobs stay pending for a process that can run them.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_some() {
            bail!("worker pool already running");
        }

        let shutdown = CancellationToken::new();
        let mut groups = HashMap::new();

        for group in PoolGroup::ALL {
            let configured = self.ctx.config.pool_size(group);
            let has_handlers = group
                .stages()
                .iter()
                .any(|s| self.ctx.handlers.is_registered(*s));

            let target = if has_handlers { configured } else { 0 };
            if !has_handlers && configured > 0 {
                warn!(group = %group, "no stage handlers registered; group starts with zero workers");
            }

            let mut state = GroupState::new(target);
            for slot in 0..target {
                let worker = self.spawn_worker(
                    group,
                    slot,
                    state.target.clone(),
                    state.metrics.clone(),
                    shutdown.clone(),
                );
                state.workers.push(worker);
            }

            info!(group = %group, workers = target, "worker group started");
            groups.insert(group, state);
        }

        *inner = Some(Running { shutdown, groups });
        Ok(())
    }

    /// Change a group's worker count.
    ///
    /// Growing spawns workers immediately. Shrinking only moves the
    /// target: excess workers finish their current job, then exit.
    pub fn scale(&self, group: PoolGroup, count: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let running = match inner.as_mut() {
            Some(running) => running,
            None => bail!("worker pool is not running"),
        };

        let shutdown = running.shutdown.clone();
        let state = match running.groups.get_mut(&group) {
            Some(state) => state,
            None => bail!("unknown worker group: {group}"),
        };

        state.target.store(count, Ordering::SeqCst);
        state.workers.retain(|w| !w.handle.is_finished());

        let live_slots: HashSet<usize> = state.workers.iter().map(|w| w.slot).collect();
        let mut spawned = Vec::new();
        for slot in 0..count {
            if !live_slots.contains(&slot) {
                spawned.push(self.spawn_worker(
                    group,
                    slot,
                    state.target.clone(),
                    state.metrics.clone(),
                    shutdown.clone(),
                ));
            }
        }
        state.workers.extend(spawned);

        info!(group = %group, count, "scaled worker group");
        Ok(())
    }

    /// Broadcast shutdown and wait for workers up to the graceful
    /// deadline. Workers finish at most one more job; anything still
    /// processing afterwards is recovered by the lease reclaimer.
    pub async fn stop(&self, graceful: Duration) -> Result<()> {
        let running = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.take()
        };

        let Some(running) = running else {
            return Ok(());
        };

        info!("stopping worker pool");
        running.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = running
            .groups
            .into_values()
            .flat_map(|g| g.workers)
            .map(|w| w.handle)
            .collect();
        let count = handles.len();

        match tokio::time::timeout(graceful, futures::future::join_all(handles)).await {
            Ok(_) => info!(workers = count, "worker pool stopped"),
            Err(_) => warn!(
                "graceful deadline hit; in-flight jobs will be recovered by the lease sweep"
            ),
        }

        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.as_ref() {
            None => PoolStatus {
                running: false,
                groups: Vec::new(),
            },
            Some(running) => {
                let mut groups: Vec<GroupStatus> = PoolGroup::ALL
                    .into_iter()
                    .filter_map(|group| {
                        let state = running.groups.get(&group)?;
                        let last_error_ms =
                            state.metrics.last_error_unix_ms.load(Ordering::SeqCst);
                        Some(GroupStatus {
                            group,
                            target: state.target.load(Ordering::SeqCst),
                            live: state.live_count(),
                            busy: state.metrics.busy.load(Ordering::SeqCst),
                            processed: state.metrics.processed.load(Ordering::SeqCst),
                            failed: state.metrics.failed.load(Ordering::SeqCst),
                            last_error_at: (last_error_ms > 0)
                                .then(|| DateTime::from_timestamp_millis(last_error_ms))
                                .flatten(),
                        })
                    })
                    .collect();
                groups.sort_by_key(|g| g.group);

                PoolStatus {
                    running: true,
                    groups,
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        group: PoolGroup,
        slot: usize,
        target: Arc<AtomicUsize>,
        metrics: Arc<GroupMetrics>,
        shutdown: CancellationToken,
    ) -> WorkerHandle {
        let handle = tokio::spawn(run_worker(
            self.ctx.clone(),
            group,
            slot,
            target,
            metrics,
            shutdown,
        ));
        WorkerHandle { slot, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryJobStore, MemoryStateTracker};

    fn pool() -> WorkerPool {
        WorkerPool::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryStateTracker::new()),
            Arc::new(RateLimiter::seeded()),
            Arc::new(HandlerRegistry::new()),
            Arc::new(PipelineConfig::default()),
        )
    }

    #[tokio::test]
    async fn status_reports_not_running_before_start() {
        let pool = pool();
        let status = pool.status();
        assert!(!status.running);
        assert!(status.groups.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_an_error_and_stop_is_idempotent() {
        let pool = pool();
        pool.start().unwrap();
        assert!(pool.start().is_err());

        pool.stop(Duration::from_secs(1)).await.unwrap();
        pool.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!pool.status().running);
    }

    #[tokio::test]
    async fn groups_without_handlers_start_empty() {
        let pool = pool();
        pool.start().unwrap();

        let status = pool.status();
        assert!(status.running);
        for group in status.groups {
            assert_eq!(group.target, 0);
            assert_eq!(group.busy, 0);
        }

        pool.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn scale_requires_a_running_pool() {
        let pool = pool();
        assert!(pool.scale(PoolGroup::Local, 2).is_err());
    }
}
