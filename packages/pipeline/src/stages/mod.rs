//! Stage registry: the closed set of enrichment stages and their routing.
//!
//! Every unit of enrichment work is one [`Stage`] applied to one paper.
//! This module owns the static routing tables:
//! - [`Stage::EXECUTION_ORDER`] - canonical stage order
//! - [`Stage::kind`] - which worker kind runs the stage
//! - [`Stage::provider`] - which rate-limit bucket the stage consumes
//! - [`Stage::attempt_budget`] - wall-clock budget for a single attempt
//!
//! The registry is pure and read-only. Adding a stage means adding an enum
//! variant plus its rows in the match tables below; the compiler enforces
//! exhaustiveness.

mod handler;

pub use handler::{HandlerRegistry, StageError, StageHandler};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One named unit of enrichment work applied to a paper.
///
/// Variant order is execution order: later stages may semantically depend
/// on earlier ones (e.g. `Relationships` consumes `Embedding` output). The
/// scheduler does not enforce those dependencies; backfill respects them by
/// enqueueing only what is still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "stage", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embedding,
    AiAnalysis,
    Citations,
    Concepts,
    Techniques,
    Benchmarks,
    Github,
    DeepAnalysis,
    Relationships,
}

/// Coarse classification of stages by resource profile.
///
/// Each kind owns a worker-pool budget; stages of the same kind compete for
/// the same workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Llm,
    External,
    Local,
}

/// Rate-limit bucket names, one per upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    LlmProvider,
    CitationsProvider,
    Github,
    Local,
}

impl Stage {
    /// All stages in canonical execution order.
    pub const EXECUTION_ORDER: [Stage; 9] = [
        Stage::Embedding,
        Stage::AiAnalysis,
        Stage::Citations,
        Stage::Concepts,
        Stage::Techniques,
        Stage::Benchmarks,
        Stage::Github,
        Stage::DeepAnalysis,
        Stage::Relationships,
    ];

    /// Number of stages; the denominator of the completeness score.
    pub const COUNT: usize = Self::EXECUTION_ORDER.len();

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding",
            Stage::AiAnalysis => "ai_analysis",
            Stage::Citations => "citations",
            Stage::Concepts => "concepts",
            Stage::Techniques => "techniques",
            Stage::Benchmarks => "benchmarks",
            Stage::Github => "github",
            Stage::DeepAnalysis => "deep_analysis",
            Stage::Relationships => "relationships",
        }
    }

    /// The worker kind that executes this stage.
    pub fn kind(&self) -> WorkerKind {
        match self {
            Stage::AiAnalysis
            | Stage::Concepts
            | Stage::Techniques
            | Stage::Benchmarks
            | Stage::DeepAnalysis => WorkerKind::Llm,
            Stage::Citations | Stage::Github => WorkerKind::External,
            Stage::Embedding | Stage::Relationships => WorkerKind::Local,
        }
    }

    /// The rate-limit bucket this stage consumes a token from.
    pub fn provider(&self) -> Provider {
        match self {
            Stage::AiAnalysis
            | Stage::Concepts
            | Stage::Techniques
            | Stage::Benchmarks
            | Stage::DeepAnalysis => Provider::LlmProvider,
            Stage::Citations => Provider::CitationsProvider,
            Stage::Github => Provider::Github,
            Stage::Embedding | Stage::Relationships => Provider::Local,
        }
    }

    /// Wall-clock budget for a single attempt of this stage.
    ///
    /// The worker enforces this with a timeout around the stage body; the
    /// default lease duration is derived from it.
    pub fn attempt_budget(&self) -> Duration {
        let secs = match self {
            Stage::Embedding => 120,
            Stage::AiAnalysis => 180,
            Stage::Citations => 60,
            Stage::Concepts => 120,
            Stage::Techniques => 120,
            Stage::Benchmarks => 120,
            Stage::Github => 60,
            Stage::DeepAnalysis => 300,
            Stage::Relationships => 240,
        };
        Duration::from_secs(secs)
    }

    /// Timestamp column for this stage in `paper_processing_state`.
    pub fn state_column(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding_at",
            Stage::AiAnalysis => "ai_analysis_at",
            Stage::Citations => "citations_at",
            Stage::Concepts => "concepts_at",
            Stage::Techniques => "techniques_at",
            Stage::Benchmarks => "benchmarks_at",
            Stage::Github => "github_at",
            Stage::DeepAnalysis => "deep_analysis_at",
            Stage::Relationships => "relationships_at",
        }
    }

    /// All stages of the given worker kind, in execution order.
    pub fn of_kind(kind: WorkerKind) -> Vec<Stage> {
        Self::EXECUTION_ORDER
            .into_iter()
            .filter(|s| s.kind() == kind)
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::EXECUTION_ORDER
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown stage: {s}"))
    }
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::LlmProvider,
        Provider::CitationsProvider,
        Provider::Github,
        Provider::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::LlmProvider => "llm_provider",
            Provider::CitationsProvider => "citations_provider",
            Provider::Github => "github",
            Provider::Local => "local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown provider: {s}"))
    }
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Llm => "llm",
            WorkerKind::External => "external",
            WorkerKind::Local => "local",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch group for a worker sub-pool.
///
/// Stages partition by (worker kind, rate bucket) so that every group
/// consults exactly one bucket. This is what lets a worker acquire its
/// rate-limit token before claiming a job: the `external` kind splits into
/// `citations` and `github` groups because those stages bill different
/// providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolGroup {
    Llm,
    Citations,
    Github,
    Local,
}

impl PoolGroup {
    pub const ALL: [PoolGroup; 4] = [
        PoolGroup::Llm,
        PoolGroup::Citations,
        PoolGroup::Github,
        PoolGroup::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolGroup::Llm => "llm",
            PoolGroup::Citations => "citations",
            PoolGroup::Github => "github",
            PoolGroup::Local => "local",
        }
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            PoolGroup::Llm => WorkerKind::Llm,
            PoolGroup::Citations | PoolGroup::Github => WorkerKind::External,
            PoolGroup::Local => WorkerKind::Local,
        }
    }

    /// The single rate-limit bucket every stage in this group bills.
    pub fn provider(&self) -> Provider {
        match self {
            PoolGroup::Llm => Provider::LlmProvider,
            PoolGroup::Citations => Provider::CitationsProvider,
            PoolGroup::Github => Provider::Github,
            PoolGroup::Local => Provider::Local,
        }
    }

    /// Stages dispatched by this group, in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        let provider = self.provider();
        Stage::EXECUTION_ORDER
            .into_iter()
            .filter(|s| s.kind() == self.kind() && s.provider() == provider)
            .collect()
    }

    /// Default worker count for this group.
    pub fn default_size(&self) -> usize {
        match self {
            PoolGroup::Llm => 15,
            PoolGroup::Citations => 2,
            PoolGroup::Github => 3,
            PoolGroup::Local => 4,
        }
    }

    /// The group that dispatches the given stage.
    pub fn for_stage(stage: Stage) -> PoolGroup {
        match stage {
            Stage::AiAnalysis
            | Stage::Concepts
            | Stage::Techniques
            | Stage::Benchmarks
            | Stage::DeepAnalysis => PoolGroup::Llm,
            Stage::Citations => PoolGroup::Citations,
            Stage::Github => PoolGroup::Github,
            Stage::Embedding | Stage::Relationships => PoolGroup::Local,
        }
    }
}

impl fmt::Display for PoolGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown pool group: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn execution_order_covers_all_stages_once() {
        let unique: HashSet<Stage> = Stage::EXECUTION_ORDER.into_iter().collect();
        assert_eq!(unique.len(), Stage::COUNT);
    }

    #[test]
    fn embedding_runs_first_and_relationships_last() {
        assert_eq!(Stage::EXECUTION_ORDER[0], Stage::Embedding);
        assert_eq!(Stage::EXECUTION_ORDER[8], Stage::Relationships);
    }

    #[test]
    fn llm_stages_bill_the_llm_provider() {
        for stage in Stage::of_kind(WorkerKind::Llm) {
            assert_eq!(stage.provider(), Provider::LlmProvider);
        }
    }

    #[test]
    fn local_stages_are_embedding_and_relationships() {
        assert_eq!(
            Stage::of_kind(WorkerKind::Local),
            vec![Stage::Embedding, Stage::Relationships]
        );
    }

    #[test]
    fn pool_groups_partition_the_stage_set() {
        let mut seen = Vec::new();
        for group in PoolGroup::ALL {
            seen.extend(group.stages());
        }
        seen.sort();
        let mut all = Stage::EXECUTION_ORDER.to_vec();
        all.sort();
        assert_eq!(seen, all);
    }

    #[test]
    fn group_for_stage_is_consistent_with_group_stages() {
        for stage in Stage::EXECUTION_ORDER {
            let group = PoolGroup::for_stage(stage);
            assert!(group.stages().contains(&stage));
        }
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in Stage::EXECUTION_ORDER {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("not_a_stage".parse::<Stage>().is_err());
    }

    #[test]
    fn provider_round_trips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
    }

    #[test]
    fn attempt_budgets_are_positive() {
        for stage in Stage::EXECUTION_ORDER {
            assert!(stage.attempt_budget() >= Duration::from_secs(60));
        }
    }
}
