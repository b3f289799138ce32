//! Statement reconstruction: DAG back to one executable statement.
//!
//! CTE nodes are emitted in topological `Ref` order under a single `WITH`
//! preamble (only when any CTEs exist), followed by the main body with
//! union branches inlined in original order and patched subquery bodies
//! spliced back over the text segments they were extracted from.

use crate::error::RewriteError;
use crate::graph;
use crate::QueryDag;

/// Render the full statement for the DAG's current node bodies.
///
/// With zero patches applied this reproduces a re-parseable rendition of
/// the original statement (identity plan round-trip).
pub fn reconstruct(dag: &QueryDag) -> Result<String, RewriteError> {
    let mut sql = String::new();

    let cte_order = graph::topo_order_ctes(dag)?;
    if !cte_order.is_empty() {
        sql.push_str(if dag.with_recursive() {
            "WITH RECURSIVE "
        } else {
            "WITH "
        });
        let mut rendered = Vec::with_capacity(cte_order.len());
        for id in &cte_order {
            let node = dag
                .node(id)
                .ok_or_else(|| RewriteError::contract(id.clone(), "unknown node"))?;
            let name = node
                .name
                .clone()
                .ok_or_else(|| RewriteError::contract(id.clone(), "CTE without a name"))?;
            let header = if node.cte_columns.is_empty() {
                name
            } else {
                format!("{name} ({})", node.cte_columns.join(", "))
            };
            rendered.push(format!("{header} AS ({})", render_node(dag, id)?));
        }
        sql.push_str(&rendered.join(", "));
        sql.push(' ');
    }

    let main = dag
        .node(dag.main_id())
        .ok_or_else(|| RewriteError::contract(dag.main_id().clone(), "unknown node"))?;

    if let Some(spec) = &main.set_op {
        let mut parts = Vec::new();
        for (i, branch) in spec.branches.iter().enumerate() {
            if i > 0 {
                parts.push(
                    spec.operators
                        .get(i - 1)
                        .cloned()
                        .unwrap_or_else(|| "UNION".to_string()),
                );
            }
            parts.push(render_node(dag, branch)?);
        }
        sql.push_str(&parts.join(" "));
        sql.push_str(&spec.suffix);
    } else {
        sql.push_str(&render_node(dag, dag.main_id())?);
    }

    Ok(sql)
}

/// A node's body with each subquery child's rendition spliced over the
/// parenthesized segment it was extracted from.
fn render_node(dag: &QueryDag, id: &str) -> Result<String, RewriteError> {
    let node = dag
        .node(id)
        .ok_or_else(|| RewriteError::contract(id, "unknown node"))?;
    let mut body = node.body.clone();
    for child in dag.children_of(id) {
        let Some(origin) = child.origin.as_ref() else { continue };
        if body.contains(&origin.text) {
            let spliced = format!("({})", render_node(dag, &child.id)?);
            body = body.replacen(&origin.text, &spliced, 1);
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{PatchEngine, PatchOperation, PatchPlan};
    use crate::scope::parse_statement;

    fn round_trip(sql: &str) -> String {
        let dag = QueryDag::build(sql).unwrap();
        let out = reconstruct(&dag).unwrap();
        parse_statement(&out).expect("reconstruction re-parses");
        out
    }

    #[test]
    fn identity_plan_round_trips() {
        round_trip("SELECT a, b FROM t WHERE a > 1");
        round_trip("WITH d AS (SELECT k, SUM(v) AS s FROM t GROUP BY k) SELECT k FROM d");
        round_trip("SELECT * FROM t1 WHERE t1.sk = (SELECT AVG(x) FROM t2 WHERE t2.fk = t1.sk)");
        round_trip("SELECT a FROM t1 UNION ALL SELECT a FROM t2 ORDER BY a LIMIT 5");
        round_trip("SELECT s.total FROM (SELECT SUM(v) AS total FROM t GROUP BY k) AS s");
    }

    #[test]
    fn with_preamble_only_when_ctes_exist() {
        let out = round_trip("SELECT a FROM t");
        assert!(!out.to_uppercase().starts_with("WITH"));
        let out = round_trip("WITH c AS (SELECT 1 AS x) SELECT x FROM c");
        assert!(out.to_uppercase().starts_with("WITH"));
    }

    #[test]
    fn ctes_emit_in_dependency_order() {
        // `late` is defined second but feeds `early` after the patch swaps
        // bodies around; topological order must put producers first.
        let dag = QueryDag::build(
            "WITH b AS (SELECT x FROM base), c AS (SELECT x FROM b) SELECT * FROM c",
        )
        .unwrap();
        let out = reconstruct(&dag).unwrap();
        let b_at = out.find("b AS").unwrap();
        let c_at = out.find("c AS").unwrap();
        assert!(b_at < c_at);
    }

    #[test]
    fn patched_subquery_body_is_spliced_back() {
        let dag = QueryDag::build("SELECT a FROM t WHERE t.x IN (SELECT y FROM t2)").unwrap();
        let sub_id = dag.children_of("main")[0].id.clone();
        let plan = PatchPlan::new(vec![PatchOperation::ReplaceBody {
            node: sub_id,
            body: "SELECT y FROM t2 WHERE t2.active = 1".into(),
        }]);
        let patched = PatchEngine::new().apply(&dag, &plan).unwrap();
        let out = reconstruct(&patched).unwrap();
        assert!(out.contains("t2.active = 1"));
        parse_statement(&out).unwrap();
    }

    #[test]
    fn inserted_cte_lands_in_the_preamble() {
        let dag = QueryDag::build("SELECT a FROM t WHERE t.k > 0").unwrap();
        let plan = PatchPlan::new(vec![PatchOperation::InsertCte {
            name: "agg".into(),
            body: "SELECT fk, AVG(x) AS avg_x FROM t2 GROUP BY fk".into(),
            consumers: vec!["main".into()],
        }]);
        let patched = PatchEngine::new().apply(&dag, &plan).unwrap();
        let out = reconstruct(&patched).unwrap();
        assert!(out.starts_with("WITH agg AS ("));
        parse_statement(&out).unwrap();
    }

    #[test]
    fn union_branch_patch_stays_in_branch_order() {
        let dag =
            QueryDag::build("SELECT a FROM t1 UNION ALL SELECT a FROM t2 ORDER BY a").unwrap();
        let plan = PatchPlan::new(vec![PatchOperation::ReplaceWherePredicate {
            node: "branch:1".into(),
            predicate: "t2.a > 0".into(),
        }]);
        let patched = PatchEngine::new().apply(&dag, &plan).unwrap();
        let out = reconstruct(&patched).unwrap();
        let first = out.find("FROM t1").unwrap();
        let second = out.find("FROM t2").unwrap();
        assert!(first < second);
        assert!(out.contains("t2.a > 0"));
        assert!(out.ends_with("ORDER BY a"));
        parse_statement(&out).unwrap();
    }
}
