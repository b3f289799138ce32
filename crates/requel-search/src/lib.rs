//! Requel Search: generator boundary + search controller.
//!
//! This crate drives candidate generation toward a target speedup. An
//! external generator — an LLM behind a feature-gated provider, a rule
//! engine, or a scripted fixture — proposes patch plans; the controller
//! applies, validates, and benchmarks them, feeding structured failure and
//! progress signals back into subsequent requests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        SEARCH PIPELINE                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  ┌───────────┐    GenerationRequest     ┌────────────────────────┐   │
//! │  │ Generator │◄─────────────────────────│  Search Controller     │   │
//! │  │ (LLM,     │                          │  retry | tournament |  │   │
//! │  │  rules,   │───────PatchPlan─────────►│  evolutionary          │   │
//! │  │  human)   │                          └───────────┬────────────┘   │
//! │  └───────────┘                                      │                │
//! │        ▲                                 apply + reconstruct         │
//! │        │ prior attempts,                            │                │
//! │        │ contracts, hints,               validate (3 gates)          │
//! │        │ corpus examples                            │                │
//! │        │                                      benchmark              │
//! │        └────────────────── attempt record ◄─────────┘                │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every per-candidate failure is caught at the controller boundary and
//! converted into a structured [`AttemptRecord`]; only a parse failure on
//! the *original* query is fatal to a run.

pub mod controller;
pub mod corpus;
pub mod hints;
pub mod providers;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use requel_dag::anchor::Anchor;
use requel_dag::{ErrorKind, NodeId, PatchPlan};
use requel_verify::{Aggregation, BenchmarkConfig, EquivalenceConfig, ValidationReport};

pub use controller::{SearchController, SearchEvent, SearchEventHandler};
pub use corpus::{CorpusExample, RewriteCorpus};
pub use hints::{BottleneckHint, NoopAnalyzer, PlanAnalyzer};
pub use providers::{FailingGenerator, RecordingGenerator, ReplayGenerator, ScriptedGenerator};

// ============================================================================
// Generator Boundary
// ============================================================================

/// Everything a generator sees about the current search position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Which lane (tournament) this request belongs to; lanes keep
    /// disjoint generation contexts.
    #[serde(default)]
    pub lane: usize,
    /// Which attempt/iteration within the lane.
    #[serde(default)]
    pub iteration: usize,
    /// One-screen rendering of the current DAG (ids, kinds, edges).
    pub dag_summary: String,
    /// Per-node contracts as JSON.
    pub contracts: serde_json::Value,
    /// Per-node anchors so plans can target sub-expressions precisely.
    pub anchors: BTreeMap<NodeId, Vec<Anchor>>,
    /// Ranked operator costs from a plan-analysis collaborator, if any.
    pub bottleneck_hints: Vec<BottleneckHint>,
    /// Structured feedback from earlier attempts in this run.
    pub prior_attempts: Vec<AttemptFeedback>,
    /// Example rewrites selected from the corpus snapshot for this lane.
    pub corpus_examples: Vec<CorpusExample>,
    pub target_speedup: f64,
    /// Best validated-and-benchmarked candidate so far (evolutionary).
    pub current_best: Option<CurrentBest>,
}

/// Progress feedback for hill-climbing requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentBest {
    pub sql: String,
    pub speedup: f64,
    /// How far the best candidate still is from the target.
    pub gap_to_target: f64,
}

/// Negative/positive feedback distilled from one prior attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFeedback {
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub candidate_sql: Option<String>,
    pub speedup: Option<f64>,
}

#[derive(Debug, Clone, Error)]
pub enum GeneratorError {
    #[error("API error: {0}")]
    Api(String),
    #[error("generator timed out: {0}")]
    Timeout(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("parsing error: {0}")]
    Parse(String),
}

/// The opaque candidate generator. `Ok(None)` is the explicit
/// "no improvement found" signal.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError>;

    fn name(&self) -> &str {
        "generator"
    }
}

// ============================================================================
// Search configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Strategy {
    /// Single lane; each failure feeds the next generation call.
    Retry { max_retries: usize },
    /// `lanes` concurrent lanes with disjoint generation contexts; one
    /// retry per lane; first lane meeting the target wins, ties broken by
    /// highest speedup.
    Tournament { lanes: usize },
    /// Single lane hill-climbing from the best candidate so far.
    Evolutionary { max_iterations: usize },
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub strategy: Strategy,
    /// A candidate is a win only at or above this ratio.
    pub target_speedup: f64,
    pub bench: BenchmarkConfig,
    pub equivalence: EquivalenceConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Retry { max_retries: 3 },
            target_speedup: 2.0,
            bench: BenchmarkConfig {
                warmup_runs: 1,
                rounds: 5,
                aggregation: Aggregation::Median,
                tuning: None,
            },
            equivalence: EquivalenceConfig::default(),
        }
    }
}

/// Controller state machine positions, surfaced through events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Init,
    Generating,
    Validating,
    Benchmarking,
    Accepted,
    Retry,
    Exhausted,
}

// ============================================================================
// Attempt history
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Validated and met the target speedup.
    Accepted,
    /// Validated but below the target; remains a candidate for iteration.
    ValidInsufficient,
    /// Validated but timed runs failed; excluded from acceptance.
    ValidUnmeasured,
    /// Failed a gate or the generator call errored.
    Failed,
    /// The generator explicitly found no improvement.
    NoProposal,
    /// The lane was cancelled after another lane won.
    Cancelled,
}

/// One structured record per attempt; the full history is part of every
/// run's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub lane: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: Option<PatchPlan>,
    pub candidate_sql: Option<String>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub speedup: Option<f64>,
    pub validation: Option<ValidationReport>,
}

impl AttemptRecord {
    /// Feedback payload for later generation calls.
    pub fn feedback(&self) -> AttemptFeedback {
        AttemptFeedback {
            error_kind: self.error_kind,
            error: self.error.clone(),
            candidate_sql: self.candidate_sql.clone(),
            speedup: self.speedup,
        }
    }
}

/// The accepted rewrite, when a run succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedRewrite {
    pub sql: String,
    pub speedup: f64,
    pub lane: usize,
    pub plan: PatchPlan,
}

/// Terminal result of a run: an accepted rewrite, or the original query
/// unchanged plus the full attempt history explaining why nothing
/// qualified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub accepted: Option<AcceptedRewrite>,
    /// Best validated candidate even when it missed the target.
    pub best_valid: Option<AcceptedRewrite>,
    pub attempts: Vec<AttemptRecord>,
    /// The accepted SQL, or the original text.
    pub final_sql: String,
}
