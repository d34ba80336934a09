//! Stage-body contract and handler registry.
//!
//! Stage bodies do the actual enrichment work (call an LLM, fetch
//! citations, compute an embedding). The core never sees their internals:
//! it calls a registered [`StageHandler`] with `(paper_id, metadata)` and
//! classifies the outcome. Handlers own their I/O and never touch the job
//! store; the rate-limit token for the stage's provider is already held
//! when a handler runs.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn(Stage::Citations, |paper_id, _metadata| async move {
//!     citations::fetch_and_store(&paper_id).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::Stage;

/// Failure classification for a stage attempt.
///
/// The worker maps these onto queue behavior: transient failures are
/// re-queued against the retry budget, permanent failures are not, and
/// rate-limited failures additionally push the provider bucket into
/// backoff before re-queueing.
#[derive(Debug, Error)]
pub enum StageError {
    /// Network timeout, 5xx, connection reset. Retried against the budget.
    #[error("transient: {0}")]
    Transient(String),

    /// Validation failure, 4xx other than 429, schema violation. Not retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// 429 or a provider-specific throttle signal.
    #[error("rate limited ({backoff_seconds}s backoff): {message}")]
    RateLimited {
        backoff_seconds: u32,
        message: String,
    },
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StageError::Permanent(message.into())
    }

    pub fn rate_limited(backoff_seconds: u32, message: impl Into<String>) -> Self {
        StageError::RateLimited {
            backoff_seconds,
            message: message.into(),
        }
    }
}

/// A stage body.
///
/// The core guarantees at most one concurrent invocation per job and
/// enforces the stage's wall-clock budget around this call.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, paper_id: &str, metadata: &serde_json::Value) -> Result<(), StageError>;
}

#[async_trait]
impl<T: StageHandler + ?Sized> StageHandler for Arc<T> {
    async fn run(&self, paper_id: &str, metadata: &serde_json::Value) -> Result<(), StageError> {
        (**self).run(paper_id, metadata).await
    }
}

type BoxedHandlerFn = Box<
    dyn Fn(String, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>>
        + Send
        + Sync,
>;

struct FnHandler {
    f: BoxedHandlerFn,
}

#[async_trait]
impl StageHandler for FnHandler {
    async fn run(&self, paper_id: &str, metadata: &serde_json::Value) -> Result<(), StageError> {
        (self.f)(paper_id.to_string(), metadata.clone()).await
    }
}

/// Registry mapping each stage to its body.
///
/// Built once at process start by the composition root; workers only read
/// it. A stage without a registered handler is simply not dispatched by
/// the pool.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a stage, replacing any previous registration.
    pub fn register<H>(&mut self, stage: Stage, handler: H)
    where
        H: StageHandler + 'static,
    {
        self.handlers.insert(stage, Arc::new(handler));
    }

    /// Register an async closure as the handler for a stage.
    pub fn register_fn<F, Fut>(&mut self, stage: Stage, f: F)
    where
        F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        let boxed: BoxedHandlerFn = Box::new(move |paper_id, metadata| {
            Box::pin(f(paper_id, metadata))
        });
        self.register(stage, FnHandler { f: boxed });
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    pub fn is_registered(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered stages, in execution order.
    pub fn registered_stages(&self) -> Vec<Stage> {
        Stage::EXECUTION_ORDER
            .into_iter()
            .filter(|s| self.handlers.contains_key(s))
            .collect()
    }
}
