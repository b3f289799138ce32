//! Validation pipeline: three escalating gates.
//!
//! 1. **Syntactic** — the reconstructed text must re-parse.
//! 2. **Contract** — consumer/producer column resolution re-checked
//!    against the full reconstructed statement, in case a cross-node
//!    effect slipped past per-node validation during patch application.
//! 3. **Execution equivalence** — original and candidate run against the
//!    target engine and their result sets must agree under the mode the
//!    query dictates.
//!
//! Each gate short-circuits; a candidate only reaches the benchmark
//! harness with a clean report from all three.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use requel_dag::{Catalog, ContractStore, QueryDag, RewriteError};

use crate::engine::TargetEngine;
use crate::equivalence::{
    check_equivalence, classify_safety, CompareMode, EquivalenceConfig,
};

/// Outcome of a fully validated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub mode: CompareMode,
    pub unsafe_for_strict_check: bool,
    /// Caveats surfaced when gate 3 had to be relaxed.
    pub caveats: Vec<String>,
    pub original_rows: usize,
    pub candidate_rows: usize,
}

/// The three-gate validator.
pub struct Validator {
    engine: Arc<dyn TargetEngine>,
    equivalence: EquivalenceConfig,
    catalog: Option<Catalog>,
}

impl Validator {
    pub fn new(engine: Arc<dyn TargetEngine>) -> Self {
        Self {
            engine,
            equivalence: EquivalenceConfig::default(),
            catalog: None,
        }
    }

    pub fn with_equivalence(mut self, config: EquivalenceConfig) -> Self {
        self.equivalence = config;
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run all three gates for `candidate_sql` against `original_sql`.
    pub async fn validate(
        &self,
        original_sql: &str,
        candidate_sql: &str,
    ) -> Result<ValidationReport, RewriteError> {
        // Gate 1: the reconstructed text parses.
        requel_dag::parse_statement(candidate_sql)?;

        // Gate 2: defensive contract re-check on the whole statement.
        let dag = QueryDag::build(candidate_sql)?;
        ContractStore::check_consistency(&dag, self.catalog.as_ref())?;

        // Gate 3: execution equivalence. The safety classification of the
        // *original* query decides the comparison mode; the generator's
        // claimed transform type is never consulted.
        let safety = classify_safety(original_sql)?;
        let mode = safety.compare_mode();
        let mut caveats = Vec::new();
        if safety.unsafe_for_strict_check {
            caveats.push(format!(
                "strict value check relaxed to row count: {}",
                safety.reasons.join("; ")
            ));
            tracing::warn!(
                reasons = safety.reasons.join("; ").as_str(),
                "query is unsafe for strict equivalence; comparing row counts only"
            );
        }

        let mut session = self
            .engine
            .session()
            .await
            .map_err(|e| RewriteError::Benchmark(e.to_string()))?;
        let original = session
            .execute(original_sql)
            .await
            .map_err(|e| RewriteError::Benchmark(format!("original execution failed: {e}")))?;
        // An engine rejection of the candidate is fatal to the candidate,
        // like any other malformed statement.
        let candidate = session
            .execute(candidate_sql)
            .await
            .map_err(|e| RewriteError::syntax(format!("target engine rejected candidate: {e}")))?;

        check_equivalence(&original, &candidate, mode, &self.equivalence)?;

        Ok(ValidationReport {
            mode,
            unsafe_for_strict_check: safety.unsafe_for_strict_check,
            caveats,
            original_rows: original.rows.len(),
            candidate_rows: candidate.rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Row, StaticEngine, Value};

    fn rows(values: &[(i64, f64)]) -> Vec<Row> {
        values
            .iter()
            .map(|(a, b)| vec![Value::Int(*a), Value::Float(*b)])
            .collect()
    }

    #[tokio::test]
    async fn equivalent_candidate_passes_all_gates() {
        let engine = StaticEngine::new();
        engine.script(
            "SELECT a, b FROM t",
            vec!["a", "b"],
            rows(&[(1, 1.0), (2, 2.0)]),
        );
        // Same bag, different physical order.
        engine.script(
            "SELECT a, b FROM t WHERE TRUE",
            vec!["a", "b"],
            rows(&[(2, 2.0), (1, 1.0)]),
        );
        let validator = Validator::new(Arc::new(engine));
        let report = validator
            .validate("SELECT a, b FROM t", "SELECT a, b FROM t WHERE TRUE")
            .await
            .unwrap();
        assert_eq!(report.mode, CompareMode::Bag);
        assert!(report.caveats.is_empty());
    }

    #[tokio::test]
    async fn diverging_rows_fail_gate_three() {
        let engine = StaticEngine::new();
        engine.script("SELECT a, b FROM t", vec!["a", "b"], rows(&[(1, 1.0)]));
        engine.script(
            "SELECT a, b FROM t WHERE a > 0",
            vec!["a", "b"],
            rows(&[(1, 5.0)]),
        );
        let validator = Validator::new(Arc::new(engine));
        let err = validator
            .validate("SELECT a, b FROM t", "SELECT a, b FROM t WHERE a > 0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), requel_dag::ErrorKind::SemanticMismatch);
    }

    #[tokio::test]
    async fn unparseable_candidate_fails_gate_one() {
        let engine = StaticEngine::new();
        let validator = Validator::new(Arc::new(engine));
        let err = validator
            .validate("SELECT a FROM t", "SELEC a FRM t")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), requel_dag::ErrorKind::SyntaxError);
    }

    #[tokio::test]
    async fn unsafe_query_is_relaxed_to_row_count_with_caveat() {
        let engine = StaticEngine::new();
        engine.script(
            "SELECT a, b FROM t LIMIT 2",
            vec!["a", "b"],
            rows(&[(1, 1.0), (2, 2.0)]),
        );
        // Different values, same count: accepted under the relaxation.
        engine.script(
            "SELECT a, b FROM t2 LIMIT 2",
            vec!["a", "b"],
            rows(&[(3, 3.0), (4, 4.0)]),
        );
        let validator = Validator::new(Arc::new(engine));
        let report = validator
            .validate("SELECT a, b FROM t LIMIT 2", "SELECT a, b FROM t2 LIMIT 2")
            .await
            .unwrap();
        assert_eq!(report.mode, CompareMode::RowCountOnly);
        assert!(report.unsafe_for_strict_check);
        assert_eq!(report.caveats.len(), 1);
    }

    #[tokio::test]
    async fn broken_consumer_reference_fails_gate_two() {
        let engine = StaticEngine::new();
        let validator = Validator::new(Arc::new(engine));
        // `main` reads daily.total but the CTE no longer projects it.
        let err = validator
            .validate(
                "SELECT a FROM t",
                "WITH daily AS (SELECT d FROM sales GROUP BY d) \
                 SELECT d FROM daily WHERE daily.total > 10",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), requel_dag::ErrorKind::ContractViolation);
    }
}
