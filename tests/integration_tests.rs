//! Integration tests for the complete Requel pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - SQL text → Query DAG → contracts
//! - PatchPlan → Patch Engine → reconstruction
//! - Search controller → validation gates → benchmark → acceptance
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use requel_dag::{PatchOperation, PatchPlan, QueryDag};
use requel_search::{
    AttemptOutcome, ScriptedGenerator, SearchConfig, SearchController, Strategy,
};
use requel_verify::{CompareMode, StaticEngine, Value};

// ============================================================================
// Decorrelation end-to-end (correlated scalar subquery → CTE + join)
// ============================================================================

const CORRELATED: &str =
    "SELECT * FROM t1 WHERE t1.sk = (SELECT AVG(x) FROM t2 WHERE t2.fk = t1.sk)";

const DECORRELATED: &str = "WITH agg AS (SELECT fk, AVG(x) AS avg_x FROM t2 GROUP BY fk) \
     SELECT t1.* FROM t1 JOIN agg ON agg.fk = t1.sk WHERE t1.sk = agg.avg_x";

fn decorrelation_plan() -> PatchPlan {
    PatchPlan::new(vec![
        PatchOperation::InsertCte {
            name: "agg".into(),
            body: "SELECT fk, AVG(x) AS avg_x FROM t2 GROUP BY fk".into(),
            consumers: vec!["main".into()],
        },
        PatchOperation::ReplaceBody {
            node: "main".into(),
            body: "SELECT t1.* FROM t1 JOIN agg ON agg.fk = t1.sk \
                   WHERE t1.sk = agg.avg_x"
                .into(),
        },
    ])
    .with_claim("decorrelates the scalar subquery into a grouped join")
}

fn sk_rows(values: &[i64]) -> Vec<Vec<Value>> {
    values.iter().map(|v| vec![Value::Int(*v)]).collect()
}

#[test]
fn correlated_query_builds_the_expected_dag() {
    let dag = QueryDag::build(CORRELATED).unwrap();
    assert_eq!(dag.nodes().len(), 2);
    let sub = dag.children_of("main");
    assert_eq!(sub.len(), 1);
    // The inner scope reaches t1.sk at evaluation time.
    assert!(dag
        .edges()
        .iter()
        .any(|e| e.kind == requel_dag::EdgeKind::Correlated));
}

#[test]
fn decorrelation_plan_passes_contract_checks_and_reconstructs() {
    let dag = QueryDag::build(CORRELATED).unwrap();
    let patched = requel_dag::PatchEngine::new()
        .apply(&dag, &decorrelation_plan())
        .unwrap();
    let out = requel_dag::reconstruct(&patched).unwrap();
    assert_eq!(out, DECORRELATED);
    requel_dag::parse_statement(&out).unwrap();
}

#[tokio::test]
async fn decorrelation_wins_through_the_full_search_pipeline() {
    // Two distinct fk groups; the rewrite returns the same bag in a
    // different physical order.
    let engine = StaticEngine::new();
    engine.script_with_timings(CORRELATED, vec!["sk"], sk_rows(&[10, 20]), vec![120.0]);
    engine.script_with_timings(DECORRELATED, vec!["sk"], sk_rows(&[20, 10]), vec![40.0]);

    let controller = SearchController::new(
        CORRELATED,
        Arc::new(engine),
        Arc::new(ScriptedGenerator::plans(vec![decorrelation_plan()])),
        SearchConfig {
            strategy: Strategy::Retry { max_retries: 2 },
            target_speedup: 2.0,
            ..SearchConfig::default()
        },
    )
    .unwrap();
    let outcome = controller.run().await;

    assert_eq!(outcome.attempts.len(), 1);
    let attempt = &outcome.attempts[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Accepted);
    assert_eq!(
        attempt.validation.as_ref().map(|v| v.mode),
        Some(CompareMode::Bag)
    );

    let accepted = outcome.accepted.expect("rewrite meets the 2x target");
    assert!((accepted.speedup - 3.0).abs() < 1e-9);
    assert_eq!(outcome.final_sql, DECORRELATED);
}

// ============================================================================
// Runs that find nothing still terminate with the original + history
// ============================================================================

#[tokio::test]
async fn silent_generator_returns_the_original_with_history() {
    let engine = StaticEngine::new();
    let controller = SearchController::new(
        "SELECT a FROM t WHERE a > 1",
        Arc::new(engine),
        Arc::new(ScriptedGenerator::silent()),
        SearchConfig::default(),
    )
    .unwrap();
    let outcome = controller.run().await;

    assert!(outcome.accepted.is_none());
    assert_eq!(outcome.final_sql, "SELECT a FROM t WHERE a > 1");
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::NoProposal);
}
