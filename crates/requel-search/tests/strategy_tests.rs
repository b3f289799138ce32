//! End-to-end tests for the three search strategies, driven by a
//! lane-keyed scripted generator and the scripted static engine.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use requel_dag::anchor::anchor_hash;
use requel_dag::{ErrorKind, PatchOperation, PatchPlan};
use requel_search::{
    AttemptOutcome, FailingGenerator, GenerationRequest, Generator, GeneratorError,
    SearchConfig, SearchController, SearchEvent, Strategy,
};
use requel_verify::{Aggregation, BenchmarkConfig, StaticEngine, Value};

// ============================================================================
// Fixtures
// ============================================================================

/// Generator with a separate response tape per lane; drained lanes
/// decline. Every request is captured for assertions.
struct LaneTable {
    tapes: Mutex<HashMap<usize, VecDeque<Option<PatchPlan>>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl LaneTable {
    fn new(tapes: Vec<(usize, Vec<Option<PatchPlan>>)>) -> Self {
        Self {
            tapes: Mutex::new(
                tapes
                    .into_iter()
                    .map(|(lane, plans)| (lane, plans.into_iter().collect()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Generator for LaneTable {
    async fn propose(
        &self,
        request: &GenerationRequest,
    ) -> Result<Option<PatchPlan>, GeneratorError> {
        self.requests.lock().push(request.clone());
        Ok(self
            .tapes
            .lock()
            .get_mut(&request.lane)
            .and_then(|tape| tape.pop_front())
            .flatten())
    }
}

fn rows() -> Vec<Vec<Value>> {
    vec![vec![Value::Int(1)], vec![Value::Int(2)]]
}

/// Engine where `original` runs at 100ms and each candidate at a scripted
/// constant, so speedups are deterministic under any interleaving.
fn engine(original: &str, candidates: &[(&str, f64)]) -> StaticEngine {
    let engine = StaticEngine::new();
    engine.script_with_timings(original, vec!["a"], rows(), vec![100.0]);
    for (sql, ms) in candidates {
        engine.script_with_timings(sql, vec!["a"], rows(), vec![*ms]);
    }
    engine
}

fn config(strategy: Strategy) -> SearchConfig {
    SearchConfig {
        strategy,
        target_speedup: 2.0,
        bench: BenchmarkConfig {
            warmup_runs: 1,
            rounds: 3,
            aggregation: Aggregation::Median,
            tuning: None,
        },
        ..SearchConfig::default()
    }
}

fn where_plan(predicate: &str) -> PatchPlan {
    PatchPlan::new(vec![PatchOperation::ReplaceWherePredicate {
        node: "main".into(),
        predicate: predicate.into(),
    }])
}

fn bogus_anchor_plan() -> PatchPlan {
    PatchPlan::new(vec![PatchOperation::ReplaceExprSubtree {
        node: "main".into(),
        anchor: anchor_hash("never.present = 1"),
        expr: "1 = 1".into(),
    }])
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn retry_feeds_failures_back_and_wins_on_second_attempt() {
    let original = "SELECT a FROM t";
    let winning = "SELECT a FROM t WHERE t.a < 100";
    let engine = engine(original, &[(winning, 40.0)]);
    let generator = Arc::new(LaneTable::new(vec![(
        0,
        vec![Some(bogus_anchor_plan()), Some(where_plan("t.a < 100"))],
    )]));

    let controller = SearchController::new(
        original,
        Arc::new(engine),
        Arc::clone(&generator) as Arc<dyn Generator>,
        config(Strategy::Retry { max_retries: 3 }),
    )
    .unwrap();
    let outcome = controller.run().await;

    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(
        outcome.attempts[0].error_kind,
        Some(ErrorKind::AnchorNotFound)
    );
    assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Accepted);

    let accepted = outcome.accepted.expect("second attempt wins");
    assert!((accepted.speedup - 2.5).abs() < 1e-9);
    assert_eq!(outcome.final_sql, winning);

    // The corrective request carried the failure as negative feedback.
    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prior_attempts.is_empty());
    assert_eq!(requests[1].prior_attempts.len(), 1);
    assert_eq!(
        requests[1].prior_attempts[0].error_kind,
        Some(ErrorKind::AnchorNotFound)
    );
}

#[tokio::test]
async fn generator_errors_consume_slots_but_never_kill_the_run() {
    let original = "SELECT a FROM t";
    let engine = engine(original, &[]);
    let controller = SearchController::new(
        original,
        Arc::new(engine),
        Arc::new(FailingGenerator),
        config(Strategy::Retry { max_retries: 2 }),
    )
    .unwrap();
    let outcome = controller.run().await;

    assert_eq!(outcome.attempts.len(), 2);
    for attempt in &outcome.attempts {
        assert_eq!(attempt.outcome, AttemptOutcome::Failed);
        assert_eq!(attempt.error_kind, Some(ErrorKind::GeneratorError));
    }
    assert!(outcome.accepted.is_none());
    assert_eq!(outcome.final_sql, original);
}

#[tokio::test]
async fn below_target_candidates_are_never_accepted() {
    let original = "SELECT a FROM t";
    let slow = "SELECT a FROM t WHERE t.a > 0";
    // 100/80 = 1.25x: valid but insufficient.
    let engine = engine(original, &[(slow, 80.0)]);
    let generator = Arc::new(LaneTable::new(vec![(
        0,
        vec![Some(where_plan("t.a > 0"))],
    )]));
    let controller = SearchController::new(
        original,
        Arc::new(engine),
        generator as Arc<dyn Generator>,
        config(Strategy::Retry { max_retries: 2 }),
    )
    .unwrap();
    let outcome = controller.run().await;

    assert!(outcome.accepted.is_none());
    assert_eq!(
        outcome.attempts[0].outcome,
        AttemptOutcome::ValidInsufficient
    );
    let best = outcome.best_valid.expect("kept as a candidate");
    assert!((best.speedup - 1.25).abs() < 1e-9);
    assert_eq!(outcome.final_sql, original);
}

// ============================================================================
// Tournament
// ============================================================================

#[tokio::test]
async fn tournament_accepts_the_winning_lane_with_one_record_per_lane() {
    let original = "SELECT a FROM t";
    let insufficient = "SELECT a FROM t WHERE t.a > 0";
    let winning = "SELECT a FROM t WHERE t.a < 100";
    let engine = engine(original, &[(insufficient, 80.0), (winning, 40.0)]);

    // Lane 0 validates at 1.25x, lane 1 wins at 2.5x, lane 2 fails
    // validation and its retry declines.
    let generator = Arc::new(LaneTable::new(vec![
        (0, vec![Some(where_plan("t.a > 0"))]),
        (1, vec![Some(where_plan("t.a < 100"))]),
        (2, vec![Some(bogus_anchor_plan()), None]),
    ]));

    let events = Arc::new(Mutex::new(Vec::new()));
    let controller = SearchController::new(
        original,
        Arc::new(engine),
        Arc::clone(&generator) as Arc<dyn Generator>,
        config(Strategy::Tournament { lanes: 3 }),
    )
    .unwrap();
    let sink = Arc::clone(&events);
    controller.on_event(Box::new(move |event| sink.lock().push(event)));

    let outcome = controller.run().await;

    // Exactly one record per lane, regardless of cancellation.
    assert_eq!(outcome.attempts.len(), 3);
    for lane in 0..3 {
        assert_eq!(
            outcome
                .attempts
                .iter()
                .filter(|r| r.lane == lane)
                .count(),
            1,
            "lane {lane} should contribute exactly one record"
        );
    }

    let accepted = outcome.accepted.expect("lane 1 meets the target");
    assert_eq!(accepted.lane, 1);
    assert!((accepted.speedup - 2.5).abs() < 1e-9);
    assert_eq!(outcome.final_sql, winning);

    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, SearchEvent::RunAccepted { lane: 1, .. })));
}

#[tokio::test]
async fn tournament_lanes_see_disjoint_contexts() {
    let original = "SELECT a FROM t";
    let engine = engine(original, &[]);
    let generator = Arc::new(LaneTable::new(vec![(0, vec![None]), (1, vec![None])]));
    let controller = SearchController::new(
        original,
        Arc::new(engine),
        Arc::clone(&generator) as Arc<dyn Generator>,
        config(Strategy::Tournament { lanes: 2 }),
    )
    .unwrap();
    controller.run().await;

    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    let lanes: Vec<usize> = requests.iter().map(|r| r.lane).collect();
    assert!(lanes.contains(&0) && lanes.contains(&1));
}

// ============================================================================
// Evolutionary
// ============================================================================

#[tokio::test]
async fn evolutionary_climbs_from_the_best_candidate() {
    let original = "SELECT a FROM t";
    let step_one = "SELECT a FROM t WHERE t.a > 0";
    let step_two = "SELECT a FROM t WHERE t.a > 0 AND t.a < 100";
    let engine = engine(original, &[(step_one, 80.0), (step_two, 40.0)]);

    // Iteration 3's plan targets the anchor that only exists on the best
    // candidate's DAG; applying it to the original would be
    // AnchorNotFound.
    let generator = Arc::new(LaneTable::new(vec![(
        0,
        vec![
            Some(where_plan("t.a > 0")),
            Some(bogus_anchor_plan()),
            Some(PatchPlan::new(vec![PatchOperation::ReplaceExprSubtree {
                node: "main".into(),
                anchor: anchor_hash("t.a > 0"),
                expr: "t.a > 0 AND t.a < 100".into(),
            }])),
        ],
    )]));

    let controller = SearchController::new(
        original,
        Arc::new(engine),
        Arc::clone(&generator) as Arc<dyn Generator>,
        config(Strategy::Evolutionary { max_iterations: 5 }),
    )
    .unwrap();
    let outcome = controller.run().await;

    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(
        outcome.attempts[0].outcome,
        AttemptOutcome::ValidInsufficient
    );
    assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Failed);
    assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::Accepted);
    assert_eq!(outcome.final_sql, step_two);

    // Later iterations were told where the climb stood.
    let requests = generator.requests();
    let best = requests[2].current_best.as_ref().expect("carried best");
    assert!((best.speedup - 1.25).abs() < 1e-9);
    assert!((best.gap_to_target - 0.75).abs() < 1e-9);
    // Failures are diagnostics, not prompt material.
    assert!(requests.iter().all(|r| r.prior_attempts.is_empty()));
}

#[tokio::test]
async fn evolutionary_retains_best_ever_across_regressions() {
    let original = "SELECT a FROM t";
    let good = "SELECT a FROM t WHERE t.a > 0";
    let worse = "SELECT a FROM t WHERE t.a > 0 AND t.b > 0";
    let engine = engine(original, &[(good, 50.0), (worse, 90.0)]);

    let generator = Arc::new(LaneTable::new(vec![(
        0,
        vec![
            Some(where_plan("t.a > 0")),
            Some(where_plan("t.a > 0 AND t.b > 0")),
            // Tape end: explicit no-improvement signal.
        ],
    )]));

    let mut config = config(Strategy::Evolutionary { max_iterations: 6 });
    config.target_speedup = 3.0;
    let controller = SearchController::new(
        original,
        Arc::new(engine),
        generator as Arc<dyn Generator>,
        config,
    )
    .unwrap();
    let outcome = controller.run().await;

    assert!(outcome.accepted.is_none());
    assert_eq!(outcome.final_sql, original);
    // 2.0x from iteration one survives the 1.1x regression.
    let best = outcome.best_valid.expect("best-ever candidate retained");
    assert_eq!(best.sql, good);
    assert!((best.speedup - 2.0).abs() < 1e-9);
    assert_eq!(
        outcome.attempts.last().map(|r| r.outcome),
        Some(AttemptOutcome::NoProposal)
    );
}

// ============================================================================
// Run-fatal boundary
// ============================================================================

#[test]
fn unparseable_original_query_is_fatal_to_the_run() {
    let err = SearchController::new(
        "SELEC oops",
        Arc::new(StaticEngine::new()),
        Arc::new(FailingGenerator),
        SearchConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
}
