//! Per-paper processing state.
//!
//! One row per paper records, for each stage, the timestamp of its last
//! successful completion. The derived completeness score (0..100) is kept
//! consistent with the stage columns by every write that touches them,
//! which makes the backfill query the exact inverse of what has already
//! succeeded: a paper is a backfill candidate iff at least one stage
//! column is null and its error count is under the threshold.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};

use crate::stages::Stage;

const STATE_COLUMNS: &str = "paper_id, embedding_at, ai_analysis_at, citations_at, concepts_at, \
     techniques_at, benchmarks_at, github_at, deep_analysis_at, relationships_at, \
     completeness_score, error_count, priority, published_at, created_at, updated_at";

/// Papers with more errors than this are skipped by backfill until reset.
pub const DEFAULT_ERROR_THRESHOLD: i32 = 5;

// ============================================================================
// Models
// ============================================================================

/// Processing-state row for one paper.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProcessingState {
    pub paper_id: String,

    pub embedding_at: Option<DateTime<Utc>>,
    pub ai_analysis_at: Option<DateTime<Utc>>,
    pub citations_at: Option<DateTime<Utc>>,
    pub concepts_at: Option<DateTime<Utc>>,
    pub techniques_at: Option<DateTime<Utc>>,
    pub benchmarks_at: Option<DateTime<Utc>>,
    pub github_at: Option<DateTime<Utc>>,
    pub deep_analysis_at: Option<DateTime<Utc>>,
    pub relationships_at: Option<DateTime<Utc>>,

    pub completeness_score: i32,
    pub error_count: i32,
    pub priority: i32,
    pub published_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingState {
    /// Fresh state for a paper with nothing processed yet.
    pub fn new(paper_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            paper_id: paper_id.into(),
            embedding_at: None,
            ai_analysis_at: None,
            citations_at: None,
            concepts_at: None,
            techniques_at: None,
            benchmarks_at: None,
            github_at: None,
            deep_analysis_at: None,
            relationships_at: None,
            completeness_score: 0,
            error_count: 0,
            priority: 50,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Embedding => self.embedding_at,
            Stage::AiAnalysis => self.ai_analysis_at,
            Stage::Citations => self.citations_at,
            Stage::Concepts => self.concepts_at,
            Stage::Techniques => self.techniques_at,
            Stage::Benchmarks => self.benchmarks_at,
            Stage::Github => self.github_at,
            Stage::DeepAnalysis => self.deep_analysis_at,
            Stage::Relationships => self.relationships_at,
        }
    }

    pub fn set_stage_completed_at(&mut self, stage: Stage, at: DateTime<Utc>) {
        let slot = match stage {
            Stage::Embedding => &mut self.embedding_at,
            Stage::AiAnalysis => &mut self.ai_analysis_at,
            Stage::Citations => &mut self.citations_at,
            Stage::Concepts => &mut self.concepts_at,
            Stage::Techniques => &mut self.techniques_at,
            Stage::Benchmarks => &mut self.benchmarks_at,
            Stage::Github => &mut self.github_at,
            Stage::DeepAnalysis => &mut self.deep_analysis_at,
            Stage::Relationships => &mut self.relationships_at,
        };
        *slot = Some(at);
    }

    /// Stages without a completion timestamp, in execution order.
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::EXECUTION_ORDER
            .into_iter()
            .filter(|stage| self.stage_completed_at(*stage).is_none())
            .collect()
    }

    /// Completeness as a pure function of the stage columns: completed
    /// stages over all stages, rounded to percent.
    pub fn computed_completeness(&self) -> i32 {
        let done = Stage::EXECUTION_ORDER
            .into_iter()
            .filter(|stage| self.stage_completed_at(*stage).is_some())
            .count();
        ((done as f64 / Stage::COUNT as f64) * 100.0).round() as i32
    }
}

/// Filter for the backfill candidate query.
#[derive(Debug, Clone)]
pub struct BackfillFilter {
    pub min_completeness: i32,
    pub max_completeness: i32,
    pub published_after: Option<DateTime<Utc>>,
    pub published_before: Option<DateTime<Utc>>,
    /// Papers with `error_count` at or above this are excluded.
    pub max_error_count: i32,
    pub min_priority: Option<i32>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for BackfillFilter {
    fn default() -> Self {
        Self {
            min_completeness: 0,
            max_completeness: 99,
            published_after: None,
            published_before: None,
            max_error_count: DEFAULT_ERROR_THRESHOLD,
            min_priority: None,
            limit: 500,
            offset: 0,
        }
    }
}

/// One backfill candidate with its missing stages.
#[derive(Debug, Clone, Serialize)]
pub struct IncompletePaper {
    pub paper_id: String,
    pub completeness_score: i32,
    pub priority: i32,
    pub missing: Vec<Stage>,
}

/// Corpus-wide completeness histogram.
#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct CompletenessDistribution {
    pub zero: i64,
    pub from_1_to_24: i64,
    pub from_25_to_49: i64,
    pub from_50_to_74: i64,
    pub from_75_to_99: i64,
    pub complete: i64,
}

impl CompletenessDistribution {
    /// Add one paper's score to the histogram.
    pub fn add(&mut self, score: i32) {
        match score {
            i32::MIN..=0 => self.zero += 1,
            1..=24 => self.from_1_to_24 += 1,
            25..=49 => self.from_25_to_49 += 1,
            50..=74 => self.from_50_to_74 += 1,
            75..=99 => self.from_75_to_99 += 1,
            _ => self.complete += 1,
        }
    }
}

/// Per-stage completion counts across the corpus.
#[derive(Debug, Clone, Serialize)]
pub struct StageCompletion {
    pub stage: Stage,
    pub completed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageCompletionCounts {
    pub total_papers: i64,
    pub stages: Vec<StageCompletion>,
}

// ============================================================================
// Tracker
// ============================================================================

/// Trait for per-paper processing-state tracking.
///
/// The production implementation is [`PgStateTracker`]; tests run against
/// the in-memory tracker in [`crate::testing`].
#[async_trait]
pub trait StateTracker: Send + Sync {
    /// Create or refresh the state row for a paper (ingestion entry point).
    async fn register_paper(
        &self,
        paper_id: &str,
        published_at: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<()>;

    /// Record a successful stage completion, recomputing the completeness
    /// score in the same write. Creates the row if the paper is unknown.
    async fn stamp(&self, paper_id: &str, stage: Stage) -> Result<()>;

    async fn get(&self, paper_id: &str) -> Result<Option<ProcessingState>>;

    /// Completeness score in 0..100; 0 for unknown papers.
    async fn completeness(&self, paper_id: &str) -> Result<i32>;

    /// Stages not yet completed for the paper, in execution order. All
    /// stages for unknown papers.
    async fn pending_stages(&self, paper_id: &str) -> Result<Vec<Stage>>;

    /// Charge one failure against the paper's error budget.
    async fn record_error(&self, paper_id: &str) -> Result<()>;

    /// Reset the error budget so backfill picks the paper up again.
    async fn reset_errors(&self, paper_id: &str) -> Result<()>;

    /// Backfill candidates: papers with at least one missing stage,
    /// matching the filter, ordered by priority then ascending
    /// completeness. Paginated via `limit`/`offset`.
    async fn find_incomplete(&self, filter: &BackfillFilter) -> Result<Vec<IncompletePaper>>;

    async fn completeness_distribution(&self) -> Result<CompletenessDistribution>;

    async fn stage_completion_counts(&self) -> Result<StageCompletionCounts>;
}

/// PostgreSQL-backed state tracker.
#[derive(Clone)]
pub struct PgStateTracker {
    pool: PgPool,
}

impl PgStateTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateTracker for PgStateTracker {
    async fn register_paper(
        &self,
        paper_id: &str,
        published_at: Option<DateTime<Utc>>,
        priority: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO paper_processing_state (paper_id, published_at, priority)
            VALUES ($1, $2, $3)
            ON CONFLICT (paper_id) DO UPDATE SET
                published_at = COALESCE(EXCLUDED.published_at, paper_processing_state.published_at),
                priority = EXCLUDED.priority,
                updated_at = NOW()
            "#,
        )
        .bind(paper_id)
        .bind(published_at)
        .bind(priority)
        .execute(&self.pool)
        .await
        .context("failed to register paper")?;

        Ok(())
    }

    async fn stamp(&self, paper_id: &str, stage: Stage) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open stamp tx")?;

        sqlx::query(
            r#"
            INSERT INTO paper_processing_state (paper_id)
            VALUES ($1)
            ON CONFLICT (paper_id) DO NOTHING
            "#,
        )
        .bind(paper_id)
        .execute(&mut *tx)
        .await
        .context("failed to ensure state row")?;

        // Column name comes from the closed stage enum, not caller input.
        let column = stage.state_column();
        let sql = format!(
            "UPDATE paper_processing_state SET {column} = NOW(), updated_at = NOW() WHERE paper_id = $1"
        );
        sqlx::query(&sql)
            .bind(paper_id)
            .execute(&mut *tx)
            .await
            .context("failed to stamp stage completion")?;

        // Recompute the derived score from the stage columns in the same
        // transaction so the row never carries a stale completeness.
        sqlx::query(
            r#"
            UPDATE paper_processing_state
            SET completeness_score = ROUND((
                    (embedding_at IS NOT NULL)::int +
                    (ai_analysis_at IS NOT NULL)::int +
                    (citations_at IS NOT NULL)::int +
                    (concepts_at IS NOT NULL)::int +
                    (techniques_at IS NOT NULL)::int +
                    (benchmarks_at IS NOT NULL)::int +
                    (github_at IS NOT NULL)::int +
                    (deep_analysis_at IS NOT NULL)::int +
                    (relationships_at IS NOT NULL)::int
                ) * 100.0 / 9.0)::int
            WHERE paper_id = $1
            "#,
        )
        .bind(paper_id)
        .execute(&mut *tx)
        .await
        .context("failed to recompute completeness score")?;

        tx.commit().await.context("failed to commit stamp tx")?;

        Ok(())
    }

    async fn get(&self, paper_id: &str) -> Result<Option<ProcessingState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM paper_processing_state WHERE paper_id = $1");
        let state = sqlx::query_as::<_, ProcessingState>(&sql)
            .bind(paper_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch processing state")?;

        Ok(state)
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
        sqlx::query(
            r#"
            INSERT INTO paper_processing_state (paper_id, error_count)
            VALUES ($1, 1)
            ON CONFLICT (paper_id) DO UPDATE SET
                error_count = paper_processing_state.error_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(paper_id)
        .execute(&self.pool)
        .await
        .context("failed to record paper error")?;

        Ok(())
    }

    async fn reset_errors(&self, paper_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE paper_processing_state
            SET error_count = 0, updated_at = NOW()
            WHERE paper_id = $1
            "#,
        )
        .bind(paper_id)
        .execute(&self.pool)
        .await
        .context("failed to reset paper errors")?;

        Ok(())
    }

    async fn find_incomplete(&self, filter: &BackfillFilter) -> Result<Vec<IncompletePaper>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {STATE_COLUMNS} FROM paper_processing_state WHERE completeness_score >= "
        ));
        query.push_bind(filter.min_completeness);
        query.push(" AND completeness_score <= ");
        query.push_bind(filter.max_completeness);
        query.push(" AND error_count < ");
        query.push_bind(filter.max_error_count);
        // Score consistency makes this exactly "has a missing stage".
        query.push(" AND completeness_score < 100");

        if let Some(after) = filter.published_after {
            query.push(" AND published_at >= ");
            query.push_bind(after);
        }
        if let Some(before) = filter.published_before {
            query.push(" AND published_at <= ");
            query.push_bind(before);
        }
        if let Some(min_priority) = filter.min_priority {
            query.push(" AND priority >= ");
            query.push_bind(min_priority);
        }

        query.push(" ORDER BY priority DESC, completeness_score ASC, paper_id ASC LIMIT ");
        query.push_bind(filter.limit.clamp(1, 10_000));
        query.push(" OFFSET ");
        query.push_bind(filter.offset);

        let rows = query
            .build_query_as::<ProcessingState>()
            .fetch_all(&self.pool)
            .await
            .context("failed to query incomplete papers")?;

        Ok(rows
            .into_iter()
            .filter_map(|state| {
                let missing = state.missing_stages();
                if missing.is_empty() {
                    return None;
                }
                Some(IncompletePaper {
                    paper_id: state.paper_id,
                    completeness_score: state.completeness_score,
                    priority: state.priority,
                    missing,
                })
            })
            .collect())
    }

    async fn completeness_distribution(&self) -> Result<CompletenessDistribution> {
        let distribution = sqlx::query_as::<_, CompletenessDistribution>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE completeness_score = 0) AS zero,
                COUNT(*) FILTER (WHERE completeness_score BETWEEN 1 AND 24) AS from_1_to_24,
                COUNT(*) FILTER (WHERE completeness_score BETWEEN 25 AND 49) AS from_25_to_49,
                COUNT(*) FILTER (WHERE completeness_score BETWEEN 50 AND 74) AS from_50_to_74,
                COUNT(*) FILTER (WHERE completeness_score BETWEEN 75 AND 99) AS from_75_to_99,
                COUNT(*) FILTER (WHERE completeness_score >= 100) AS complete
            FROM paper_processing_state
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute completeness distribution")?;

        Ok(distribution)
    }

    async fn stage_completion_counts(&self) -> Result<StageCompletionCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(embedding_at) AS embedding,
                COUNT(ai_analysis_at) AS ai_analysis,
                COUNT(citations_at) AS citations,
                COUNT(concepts_at) AS concepts,
                COUNT(techniques_at) AS techniques,
                COUNT(benchmarks_at) AS benchmarks,
                COUNT(github_at) AS github,
                COUNT(deep_analysis_at) AS deep_analysis,
                COUNT(relationships_at) AS relationships,
                COUNT(*) AS total
            FROM paper_processing_state
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute stage completion counts")?;

        let stages = Stage::EXECUTION_ORDER
            .into_iter()
            .map(|stage| {
                let completed: i64 = row.get(stage.as_str());
                StageCompletion { stage, completed }
            })
            .collect();

        Ok(StageCompletionCounts {
            total_papers: row.get("total"),
            stages,
        })
    }
}
