//! Property-based tests for the DAG core.
//!
//! Uses proptest to pin the engine's invariants:
//! 1. Anchor hashing is deterministic and collision-free over distinct text
//! 2. Identity reconstruction always re-parses
//! 3. Plan application is all-or-nothing
//! 4. Conjunct deletion removes exactly the targeted conjunct

use proptest::prelude::*;
use requel_dag::anchor::{anchor_hash, collect_anchors};
use requel_dag::{
    reconstruct, ErrorKind, PatchEngine, PatchOperation, PatchPlan, QueryDag,
};

// ============================================================================
// Strategies
// ============================================================================

fn column_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("t.a".to_string()),
        Just("t.b".to_string()),
        Just("t.c".to_string()),
    ]
}

fn comparison_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("=".to_string()),
        Just(">".to_string()),
        Just("<".to_string()),
    ]
}

/// A WHERE clause of 1..=4 structurally distinct conjuncts. Values share a
/// fixed width so no conjunct text is a prefix of another.
fn conjuncts_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        (column_strategy(), comparison_strategy(), 100u32..1000),
        1..=4,
    )
    .prop_map(|parts| {
        let mut out: Vec<String> = Vec::new();
        for (column, op, value) in parts {
            let text = format!("{column} {op} {value}");
            if !out.contains(&text) {
                out.push(text);
            }
        }
        out
    })
}

fn query_for(conjuncts: &[String]) -> String {
    format!("SELECT a FROM t WHERE {}", conjuncts.join(" AND "))
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn anchor_hash_is_deterministic(text in "[a-z]{1,12} = [0-9]{1,4}") {
        prop_assert_eq!(anchor_hash(&text), anchor_hash(&text));
    }

    #[test]
    fn distinct_conjuncts_get_distinct_anchors(conjuncts in conjuncts_strategy()) {
        let sql = query_for(&conjuncts);
        let anchors = collect_anchors(
            &QueryDag::build(&sql).unwrap().node("main").unwrap().body,
        );
        for conjunct in &conjuncts {
            prop_assert!(
                anchors.iter().any(|a| &a.text == conjunct),
                "conjunct `{}` missing from anchors", conjunct
            );
        }
        let mut hashes: Vec<&str> = anchors.iter().map(|a| a.hash.as_str()).collect();
        hashes.sort_unstable();
        hashes.dedup();
        prop_assert_eq!(hashes.len(), anchors.len());
    }

    #[test]
    fn identity_reconstruction_reparses(conjuncts in conjuncts_strategy()) {
        let sql = query_for(&conjuncts);
        let dag = QueryDag::build(&sql).unwrap();
        let out = reconstruct(&dag).unwrap();
        prop_assert!(requel_dag::parse_statement(&out).is_ok());
    }

    #[test]
    fn deleting_one_conjunct_keeps_the_rest(
        conjuncts in conjuncts_strategy(),
        pick in 0usize..4,
    ) {
        prop_assume!(conjuncts.len() >= 2);
        let victim = conjuncts[pick % conjuncts.len()].clone();
        let dag = QueryDag::build(&query_for(&conjuncts)).unwrap();
        let plan = PatchPlan::new(vec![PatchOperation::DeleteExprSubtree {
            node: "main".into(),
            anchor: anchor_hash(&victim),
        }]);
        let patched = PatchEngine::new().apply(&dag, &plan).unwrap();
        let body = &patched.node("main").unwrap().body;
        prop_assert!(!body.contains(&victim));
        for kept in conjuncts.iter().filter(|c| **c != victim) {
            prop_assert!(body.contains(kept.as_str()), "lost conjunct `{}`", kept);
        }
    }

    #[test]
    fn failed_plans_are_invisible(conjuncts in conjuncts_strategy()) {
        let dag = QueryDag::build(&query_for(&conjuncts)).unwrap();
        let before = serde_json::to_string(&dag).unwrap();
        let plan = PatchPlan::new(vec![
            PatchOperation::ReplaceWherePredicate {
                node: "main".into(),
                predicate: "t.a = 0".into(),
            },
            PatchOperation::ReplaceExprSubtree {
                node: "main".into(),
                anchor: anchor_hash("no.such = 1"),
                expr: "t.a = 1".into(),
            },
        ]);
        let err = PatchEngine::new().apply(&dag, &plan).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::AnchorNotFound);
        prop_assert_eq!(serde_json::to_string(&dag).unwrap(), before);
    }
}
