//! Search controller: the state machine driving candidate generation.
//!
//! `INIT → GENERATING → VALIDATING → BENCHMARKING → {ACCEPTED | RETRY |
//! EXHAUSTED}`. Three strategies share the machine and the per-candidate
//! evaluation path but differ in transition policy:
//!
//! - **Retry**: one lane, corrective — every failure is fed back into the
//!   next generation call.
//! - **Tournament**: concurrent lanes with disjoint corpus slices, one
//!   corrective retry per lane, cooperative cancellation once a lane wins.
//! - **Evolutionary**: one lane hill-climbing from the best validated
//!   candidate so far; failures are logged, not replayed into prompts.
//!
//! Every per-candidate error is converted into an [`AttemptRecord`] here;
//! nothing a generator or a candidate does can abort the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use uuid::Uuid;

use requel_dag::{
    reconstruct, Catalog, ContractStore, ErrorKind, PatchEngine, PatchPlan, QueryDag,
    RewriteError,
};
use requel_verify::{BenchmarkHarness, TargetEngine, Validator};

use crate::corpus::RewriteCorpus;
use crate::hints::{NoopAnalyzer, PlanAnalyzer};
use crate::{
    AcceptedRewrite, AttemptFeedback, AttemptOutcome, AttemptRecord, CurrentBest,
    GenerationRequest, Generator, GeneratorError, SearchConfig, SearchOutcome, SearchState,
    Strategy,
};

/// How many disjoint context groups the evolutionary rotation cycles over.
const CONTEXT_ROTATION: usize = 3;
/// Cap on corpus examples shipped per request.
const MAX_EXAMPLES: usize = 4;

// ============================================================================
// Events for observability
// ============================================================================

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum SearchEvent {
    StateChanged { lane: usize, state: SearchState },
    PlanProposed { lane: usize, ops: usize },
    CandidateRejected { lane: usize, kind: ErrorKind, error: String },
    CandidateBenchmarked { lane: usize, speedup: f64 },
    LaneCancelled { lane: usize },
    RunAccepted { lane: usize, speedup: f64 },
    RunExhausted { attempts: usize },
}

/// Callback for search events.
pub type SearchEventHandler = Box<dyn Fn(SearchEvent) + Send + Sync>;

// ============================================================================
// Controller
// ============================================================================

/// Orchestrates one rewrite run for one original query.
pub struct SearchController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SearchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchController")
            .field("original_sql", &self.inner.original_sql)
            .finish_non_exhaustive()
    }
}

struct Inner {
    original_sql: String,
    dag: QueryDag,
    engine: Arc<dyn TargetEngine>,
    generator: Arc<dyn Generator>,
    analyzer: Arc<dyn PlanAnalyzer>,
    corpus: Arc<RewriteCorpus>,
    catalog: Option<Catalog>,
    config: SearchConfig,
    handlers: RwLock<Vec<SearchEventHandler>>,
    cancelled: AtomicBool,
}

impl SearchController {
    /// Build the controller for one query. A parse or DAG failure on the
    /// original query is the only error that is fatal to the whole run —
    /// there is nothing to optimize.
    pub fn new(
        original_sql: &str,
        engine: Arc<dyn TargetEngine>,
        generator: Arc<dyn Generator>,
        config: SearchConfig,
    ) -> Result<Self, RewriteError> {
        let dag = QueryDag::build(original_sql)?;
        Ok(Self {
            inner: Arc::new(Inner {
                original_sql: original_sql.to_string(),
                dag,
                engine,
                generator,
                analyzer: Arc::new(NoopAnalyzer),
                corpus: Arc::new(RewriteCorpus::empty()),
                catalog: None,
                config,
                handlers: RwLock::new(Vec::new()),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    pub fn with_analyzer(self, analyzer: Arc<dyn PlanAnalyzer>) -> Self {
        self.update(|inner| inner.analyzer = analyzer)
    }

    pub fn with_corpus(self, corpus: Arc<RewriteCorpus>) -> Self {
        self.update(|inner| inner.corpus = corpus)
    }

    pub fn with_catalog(self, catalog: Catalog) -> Self {
        self.update(|inner| inner.catalog = Some(catalog))
    }

    /// Register an event handler.
    pub fn on_event(&self, handler: SearchEventHandler) {
        self.inner.handlers.write().push(handler);
    }

    /// Builder updates run before the controller is shared with any lane
    /// task; once shared they become no-ops.
    fn update(mut self, f: impl FnOnce(&mut Inner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }

    /// Drive the configured strategy to a terminal state. Always returns:
    /// an accepted rewrite, or the original query plus the full history.
    pub async fn run(&self) -> SearchOutcome {
        let strategy = self.inner.config.strategy.clone();
        match strategy {
            Strategy::Retry { max_retries } => self.inner.run_retry(max_retries).await,
            Strategy::Tournament { lanes } => self.run_tournament(lanes).await,
            Strategy::Evolutionary { max_iterations } => {
                self.inner.run_evolutionary(max_iterations).await
            }
        }
    }

    async fn run_tournament(&self, lanes: usize) -> SearchOutcome {
        let lanes = lanes.max(1);
        let mut set: JoinSet<Vec<AttemptRecord>> = JoinSet::new();
        for lane in 0..lanes {
            let inner = Arc::clone(&self.inner);
            set.spawn(async move { inner.tournament_lane(lane, lanes).await });
        }

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(records) => attempts.extend(records),
                Err(e) => tracing::warn!(error = %e, "tournament lane panicked"),
            }
        }
        attempts.sort_by_key(|r| (r.lane, r.started_at));

        // First lane meeting the target wins; ties on the wire are broken
        // by highest speedup.
        let accepted = attempts
            .iter()
            .filter(|r| r.outcome == AttemptOutcome::Accepted)
            .max_by(|a, b| {
                a.speedup
                    .partial_cmp(&b.speedup)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .and_then(candidate_of);
        let best_valid = best_valid_of(&attempts);

        self.inner.finish(accepted, best_valid, attempts)
    }
}

impl Inner {
    fn emit(&self, event: SearchEvent) {
        for handler in self.handlers.read().iter() {
            handler(event.clone());
        }
    }

    fn state(&self, lane: usize, state: SearchState) {
        self.emit(SearchEvent::StateChanged { lane, state });
    }

    // ========================================================================
    // Request assembly
    // ========================================================================

    async fn build_request(
        &self,
        base: &QueryDag,
        lane: usize,
        slots: usize,
        slot: usize,
        prior_attempts: Vec<AttemptFeedback>,
        current_best: Option<CurrentBest>,
    ) -> GenerationRequest {
        let contracts = match ContractStore::derive(base, self.catalog.as_ref()) {
            Ok(store) => store.summary(),
            Err(_) => serde_json::Value::Null,
        };
        let anchors = base
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), n.anchors()))
            .collect();
        let bottleneck_hints = self
            .analyzer
            .analyze(&self.original_sql)
            .await
            .unwrap_or_default();
        let corpus_examples = if slots <= 1 {
            self.corpus.relevant(&self.original_sql, MAX_EXAMPLES)
        } else {
            let mut slice = self.corpus.rotation(slot, slots);
            slice.truncate(MAX_EXAMPLES);
            slice
        };

        GenerationRequest {
            lane,
            iteration: slot,
            dag_summary: base.summary(),
            contracts,
            anchors,
            bottleneck_hints,
            prior_attempts,
            corpus_examples,
            target_speedup: self.config.target_speedup,
            current_best,
        }
    }

    // ========================================================================
    // Shared candidate evaluation
    // ========================================================================

    /// Apply, validate, and benchmark one plan. Returns the attempt record
    /// and, when the candidate validated, the patched DAG it produced.
    async fn evaluate(
        &self,
        base: &QueryDag,
        plan: PatchPlan,
        lane: usize,
    ) -> (AttemptRecord, Option<QueryDag>) {
        let mut record = blank_record(lane);
        record.plan = Some(plan.clone());

        self.state(lane, SearchState::Validating);
        let patcher = match &self.catalog {
            Some(catalog) => PatchEngine::with_catalog(catalog.clone()),
            None => PatchEngine::new(),
        };
        let patched = match patcher.apply(base, &plan) {
            Ok(dag) => dag,
            Err(e) => return (self.reject(record, e, lane), None),
        };
        let candidate_sql = match reconstruct(&patched) {
            Ok(sql) => sql,
            Err(e) => return (self.reject(record, e, lane), None),
        };
        record.candidate_sql = Some(candidate_sql.clone());

        let mut validator = Validator::new(Arc::clone(&self.engine))
            .with_equivalence(self.config.equivalence.clone());
        if let Some(catalog) = &self.catalog {
            validator = validator.with_catalog(catalog.clone());
        }
        match validator.validate(&self.original_sql, &candidate_sql).await {
            Ok(report) => record.validation = Some(report),
            Err(e) => return (self.reject(record, e, lane), None),
        }

        self.state(lane, SearchState::Benchmarking);
        let harness =
            BenchmarkHarness::new(Arc::clone(&self.engine), self.config.bench.clone());
        match harness.run(&self.original_sql, &candidate_sql).await {
            Ok(result) => {
                let speedup = result.best_speedup();
                record.speedup = Some(speedup);
                self.emit(SearchEvent::CandidateBenchmarked { lane, speedup });
                record.outcome = if speedup >= self.config.target_speedup {
                    AttemptOutcome::Accepted
                } else {
                    AttemptOutcome::ValidInsufficient
                };
            }
            Err(e) => {
                // Valid but unmeasured: excluded from acceptance, kept in
                // the history.
                record.error_kind = Some(e.kind());
                record.error = Some(e.to_string());
                record.outcome = AttemptOutcome::ValidUnmeasured;
            }
        }
        record.finished_at = Utc::now();
        (record, Some(patched))
    }

    fn reject(&self, mut record: AttemptRecord, error: RewriteError, lane: usize) -> AttemptRecord {
        self.emit(SearchEvent::CandidateRejected {
            lane,
            kind: error.kind(),
            error: error.to_string(),
        });
        record.error_kind = Some(error.kind());
        record.error = Some(error.to_string());
        record.outcome = AttemptOutcome::Failed;
        record.finished_at = Utc::now();
        record
    }

    // ========================================================================
    // Retry (corrective)
    // ========================================================================

    async fn run_retry(&self, max_retries: usize) -> SearchOutcome {
        self.state(0, SearchState::Init);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut prior: Vec<AttemptFeedback> = Vec::new();
        let mut best: Option<AcceptedRewrite> = None;

        for attempt in 0..max_retries.max(1) {
            self.state(0, SearchState::Generating);
            let request = self
                .build_request(&self.dag, 0, 1, attempt, prior.clone(), None)
                .await;
            let plan = match self.generator.propose(&request).await {
                Ok(Some(plan)) => plan,
                Ok(None) => {
                    attempts.push(no_proposal_record(0));
                    break;
                }
                Err(e) => {
                    // Consumes a retry slot, never fatal to the run.
                    let record = generator_failure_record(0, e);
                    prior.push(record.feedback());
                    attempts.push(record);
                    continue;
                }
            };
            self.emit(SearchEvent::PlanProposed {
                lane: 0,
                ops: plan.ops.len(),
            });

            let (record, _) = self.evaluate(&self.dag, plan, 0).await;
            prior.push(record.feedback());
            let candidate = candidate_of(&record);
            let won = record.outcome == AttemptOutcome::Accepted;
            attempts.push(record);

            if won {
                return self.finish(candidate, best, attempts);
            }
            if let Some(candidate) = candidate {
                if best
                    .as_ref()
                    .map_or(true, |b| candidate.speedup > b.speedup)
                {
                    best = Some(candidate);
                }
            }
            self.state(0, SearchState::Retry);
        }

        self.finish(None, best, attempts)
    }

    // ========================================================================
    // Tournament lane
    // ========================================================================

    async fn tournament_lane(&self, lane: usize, lanes: usize) -> Vec<AttemptRecord> {
        let mut records = Vec::new();

        if self.cancelled.load(Ordering::SeqCst) {
            self.emit(SearchEvent::LaneCancelled { lane });
            records.push(cancelled_record(lane));
            return records;
        }

        self.state(lane, SearchState::Generating);
        let request = self
            .build_request(&self.dag, lane, lanes, lane, Vec::new(), None)
            .await;
        let first = match self.generator.propose(&request).await {
            Ok(Some(plan)) => {
                self.emit(SearchEvent::PlanProposed {
                    lane,
                    ops: plan.ops.len(),
                });
                let (record, _) = self.evaluate(&self.dag, plan, lane).await;
                record
            }
            Ok(None) => no_proposal_record(lane),
            Err(e) => generator_failure_record(lane, e),
        };

        let won = first.outcome == AttemptOutcome::Accepted;
        let retry_feedback =
            (first.outcome == AttemptOutcome::Failed).then(|| first.feedback());
        records.push(first);

        if won {
            self.cancelled.store(true, Ordering::SeqCst);
            return records;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return records;
        }

        // One corrective retry per lane; a decline ends the lane quietly.
        if let Some(feedback) = retry_feedback {
            let request = self
                .build_request(&self.dag, lane, lanes, lane, vec![feedback], None)
                .await;
            match self.generator.propose(&request).await {
                Ok(Some(plan)) => {
                    let (record, _) = self.evaluate(&self.dag, plan, lane).await;
                    if record.outcome == AttemptOutcome::Accepted {
                        self.cancelled.store(true, Ordering::SeqCst);
                    }
                    records.push(record);
                }
                Ok(None) => {}
                Err(e) => records.push(generator_failure_record(lane, e)),
            }
        }

        records
    }

    // ========================================================================
    // Evolutionary (hill-climbing)
    // ========================================================================

    async fn run_evolutionary(&self, max_iterations: usize) -> SearchOutcome {
        self.state(0, SearchState::Init);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut best: Option<(AcceptedRewrite, QueryDag)> = None;

        for iteration in 0..max_iterations.max(1) {
            self.state(0, SearchState::Generating);
            // Each iteration climbs from the best candidate so far, not
            // the original.
            let (base, current_best) = match &best {
                Some((candidate, dag)) => (
                    dag.clone(),
                    Some(CurrentBest {
                        sql: candidate.sql.clone(),
                        speedup: candidate.speedup,
                        gap_to_target: (self.config.target_speedup - candidate.speedup)
                            .max(0.0),
                    }),
                ),
                None => (self.dag.clone(), None),
            };
            let request = self
                .build_request(
                    &base,
                    0,
                    CONTEXT_ROTATION,
                    iteration,
                    Vec::new(),
                    current_best,
                )
                .await;

            let plan = match self.generator.propose(&request).await {
                Ok(Some(plan)) => plan,
                Ok(None) => {
                    attempts.push(no_proposal_record(0));
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, iteration, "generator call failed");
                    attempts.push(generator_failure_record(0, e));
                    continue;
                }
            };

            let (record, patched) = self.evaluate(&base, plan, 0).await;
            match record.outcome {
                AttemptOutcome::Accepted => {
                    let candidate = candidate_of(&record);
                    attempts.push(record);
                    return self.finish(candidate, best.map(|(c, _)| c), attempts);
                }
                AttemptOutcome::ValidInsufficient => {
                    if let (Some(candidate), Some(dag)) = (candidate_of(&record), patched) {
                        let improves = best
                            .as_ref()
                            .map_or(true, |(b, _)| candidate.speedup > b.speedup);
                        if improves {
                            best = Some((candidate, dag));
                        }
                    }
                }
                _ => {
                    // Failures are diagnostics here, never prompt material.
                    tracing::debug!(
                        iteration,
                        error = record.error.as_deref().unwrap_or(""),
                        "iteration produced no valid candidate"
                    );
                }
            }
            attempts.push(record);
            self.state(0, SearchState::Retry);
        }

        self.finish(None, best.map(|(c, _)| c), attempts)
    }

    // ========================================================================
    // Terminal assembly
    // ========================================================================

    fn finish(
        &self,
        accepted: Option<AcceptedRewrite>,
        best_valid: Option<AcceptedRewrite>,
        attempts: Vec<AttemptRecord>,
    ) -> SearchOutcome {
        match &accepted {
            Some(win) => {
                self.state(win.lane, SearchState::Accepted);
                self.emit(SearchEvent::RunAccepted {
                    lane: win.lane,
                    speedup: win.speedup,
                });
            }
            None => {
                self.state(0, SearchState::Exhausted);
                self.emit(SearchEvent::RunExhausted {
                    attempts: attempts.len(),
                });
            }
        }
        let final_sql = accepted
            .as_ref()
            .map(|a| a.sql.clone())
            .unwrap_or_else(|| self.original_sql.clone());
        SearchOutcome {
            accepted,
            best_valid,
            attempts,
            final_sql,
        }
    }
}

// ============================================================================
// Record constructors
// ============================================================================

fn blank_record(lane: usize) -> AttemptRecord {
    let now = Utc::now();
    AttemptRecord {
        id: Uuid::new_v4(),
        lane,
        started_at: now,
        finished_at: now,
        plan: None,
        candidate_sql: None,
        outcome: AttemptOutcome::Failed,
        error_kind: None,
        error: None,
        speedup: None,
        validation: None,
    }
}

fn no_proposal_record(lane: usize) -> AttemptRecord {
    let mut record = blank_record(lane);
    record.outcome = AttemptOutcome::NoProposal;
    record
}

fn cancelled_record(lane: usize) -> AttemptRecord {
    let mut record = blank_record(lane);
    record.outcome = AttemptOutcome::Cancelled;
    record
}

fn generator_failure_record(lane: usize, error: GeneratorError) -> AttemptRecord {
    let mut record = blank_record(lane);
    let wrapped = RewriteError::Generator(error.to_string());
    record.error_kind = Some(wrapped.kind());
    record.error = Some(wrapped.to_string());
    record.outcome = AttemptOutcome::Failed;
    record
}

/// A validated-and-benchmarked record as an acceptable candidate.
fn candidate_of(record: &AttemptRecord) -> Option<AcceptedRewrite> {
    if !matches!(
        record.outcome,
        AttemptOutcome::Accepted | AttemptOutcome::ValidInsufficient
    ) {
        return None;
    }
    Some(AcceptedRewrite {
        sql: record.candidate_sql.clone()?,
        speedup: record.speedup?,
        lane: record.lane,
        plan: record.plan.clone()?,
    })
}

fn best_valid_of(attempts: &[AttemptRecord]) -> Option<AcceptedRewrite> {
    attempts
        .iter()
        .filter(|r| r.outcome == AttemptOutcome::ValidInsufficient)
        .max_by(|a, b| {
            a.speedup
                .partial_cmp(&b.speedup)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .and_then(candidate_of)
}
