//! AST scope extraction.
//!
//! Partitions one SQL statement into addressable scope nodes by a
//! depth-first traversal: one `Cte` node per `WITH` definition (recursing
//! into its body), one `Subquery` node per subquery position (scalar,
//! `IN`, `EXISTS`, derived table — a subquery with zero free references
//! still gets a node), one `UnionBranch` per branch of a top-level set
//! operation, and exactly one `Main` node for the residual outer
//! statement.
//!
//! Bodies are normalized through the AST printer, so a child subquery's
//! parenthesized text appears verbatim inside its parent's body; that is
//! what makes splice-based reconstruction exact.

use sqlparser::ast::{Expr, Query, Select, SetExpr, SetQuantifier, Statement, TableFactor};

use crate::error::RewriteError;
use crate::walk;
use crate::{NodeKind, ScopeNode, SetOpSpec, SubqueryOrigin};

/// Parse one statement; the syntactic gate of the validation pipeline.
pub fn parse_statement(sql: &str) -> Result<Statement, RewriteError> {
    walk::parse_one(sql)
}

/// Extract the ordered scope set of one statement.
pub fn extract_scopes(sql: &str) -> Result<Vec<ScopeNode>, RewriteError> {
    Ok(extract(sql)?.0)
}

/// Extraction plus the `WITH RECURSIVE` flag needed for reconstruction.
pub(crate) fn extract(sql: &str) -> Result<(Vec<ScopeNode>, bool), RewriteError> {
    let query = walk::parse_query(sql)?;
    let with_recursive = query.with.as_ref().map_or(false, |w| w.recursive);

    let mut nodes = Vec::new();
    let mut counter = 0usize;

    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let name = cte.alias.name.value.clone();
            let id = format!("cte:{}", name.to_lowercase());
            let node = ScopeNode {
                id: id.clone(),
                kind: NodeKind::Cte,
                name: Some(name),
                body: cte.query.to_string(),
                origin: None,
                set_op: None,
                cte_columns: cte.alias.columns.iter().map(|c| c.value.clone()).collect(),
            };
            nodes.push(node);
            extract_subqueries(&id, &cte.query, &mut nodes, &mut counter);
        }
    }

    let mut outer = query.clone();
    outer.with = None;

    if matches!(outer.body.as_ref(), SetExpr::SetOperation { .. }) {
        let mut leaves = Vec::new();
        let mut operators = Vec::new();
        flatten_set_op(&outer.body, &mut leaves, &mut operators);

        let mut branch_ids = Vec::new();
        for leaf in leaves {
            let id = format!("branch:{}", branch_ids.len());
            nodes.push(ScopeNode {
                id: id.clone(),
                kind: NodeKind::UnionBranch,
                name: None,
                body: leaf.to_string(),
                origin: None,
                set_op: None,
                cte_columns: Vec::new(),
            });
            extract_subqueries_in_set_expr(&id, leaf, &mut nodes, &mut counter);
            branch_ids.push(id);
        }

        nodes.push(ScopeNode {
            id: "main".to_string(),
            kind: NodeKind::Main,
            name: None,
            body: outer.to_string(),
            origin: None,
            set_op: Some(SetOpSpec {
                branches: branch_ids,
                operators,
                suffix: query_suffix(&outer),
            }),
            cte_columns: Vec::new(),
        });
    } else {
        nodes.push(ScopeNode {
            id: "main".to_string(),
            kind: NodeKind::Main,
            name: None,
            body: outer.to_string(),
            origin: None,
            set_op: None,
            cte_columns: Vec::new(),
        });
        extract_subqueries("main", &outer, &mut nodes, &mut counter);
    }

    Ok((nodes, with_recursive))
}

/// Extract subquery children of `parent_id`, continuing `counter` so fresh
/// ids never collide with earlier extractions in the same statement.
pub(crate) fn extract_subqueries(
    parent_id: &str,
    query: &Query,
    nodes: &mut Vec<ScopeNode>,
    counter: &mut usize,
) {
    extract_subqueries_in_set_expr(parent_id, &query.body, nodes, counter);
}

fn extract_subqueries_in_set_expr(
    parent_id: &str,
    body: &SetExpr,
    nodes: &mut Vec<ScopeNode>,
    counter: &mut usize,
) {
    match body {
        SetExpr::Select(select) => extract_from_select(parent_id, select, nodes, counter),
        SetExpr::Query(query) => {
            extract_subqueries_in_set_expr(parent_id, &query.body, nodes, counter)
        }
        SetExpr::SetOperation { left, right, .. } => {
            extract_subqueries_in_set_expr(parent_id, left, nodes, counter);
            extract_subqueries_in_set_expr(parent_id, right, nodes, counter);
        }
        _ => {}
    }
}

fn extract_from_select(
    parent_id: &str,
    select: &Select,
    nodes: &mut Vec<ScopeNode>,
    counter: &mut usize,
) {
    // Derived tables first, in FROM order.
    for twj in &select.from {
        derived_child(parent_id, &twj.relation, nodes, counter);
        for join in &twj.joins {
            derived_child(parent_id, &join.relation, nodes, counter);
        }
    }

    // Then expression subqueries: scalar, IN, EXISTS.
    let mut found: Vec<Query> = Vec::new();
    let mut roots: Vec<&Expr> = Vec::new();
    for item in &select.projection {
        if let sqlparser::ast::SelectItem::UnnamedExpr(e)
        | sqlparser::ast::SelectItem::ExprWithAlias { expr: e, .. } = item
        {
            roots.push(e);
        }
    }
    if let Some(selection) = &select.selection {
        roots.push(selection);
    }
    if let Some(having) = &select.having {
        roots.push(having);
    }
    for twj in &select.from {
        for join in &twj.joins {
            if let Some(on) = walk::join_on_expr(join) {
                roots.push(on);
            }
        }
    }
    for root in roots {
        walk::walk_expr(root, &mut |e| match e {
            Expr::Subquery(q) | Expr::InSubquery { subquery: q, .. } | Expr::Exists { subquery: q, .. } => {
                found.push((**q).clone());
            }
            _ => {}
        });
    }
    for q in found {
        push_subquery_child(parent_id, &q, nodes, counter);
    }
}

fn derived_child(
    parent_id: &str,
    factor: &TableFactor,
    nodes: &mut Vec<ScopeNode>,
    counter: &mut usize,
) {
    match factor {
        TableFactor::Derived { subquery, .. } => {
            push_subquery_child(parent_id, subquery, nodes, counter);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            derived_child(parent_id, &table_with_joins.relation, nodes, counter);
            for join in &table_with_joins.joins {
                derived_child(parent_id, &join.relation, nodes, counter);
            }
        }
        _ => {}
    }
}

fn push_subquery_child(
    parent_id: &str,
    query: &Query,
    nodes: &mut Vec<ScopeNode>,
    counter: &mut usize,
) {
    let id = format!("sub:{}", *counter);
    *counter += 1;
    let body = query.to_string();
    nodes.push(ScopeNode {
        id: id.clone(),
        kind: NodeKind::Subquery,
        name: None,
        body: body.clone(),
        origin: Some(SubqueryOrigin {
            parent: parent_id.to_string(),
            text: format!("({body})"),
        }),
        set_op: None,
        cte_columns: Vec::new(),
    });
    extract_subqueries(&id, query, nodes, counter);
}

/// Flatten a left-associative set-operation tree into leaves plus the
/// operator tokens between consecutive leaves.
fn flatten_set_op<'a>(body: &'a SetExpr, leaves: &mut Vec<&'a SetExpr>, operators: &mut Vec<String>) {
    match body {
        SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            flatten_set_op(left, leaves, operators);
            let token = match set_quantifier {
                SetQuantifier::All => format!("{op} ALL"),
                SetQuantifier::Distinct => format!("{op} DISTINCT"),
                _ => op.to_string(),
            };
            operators.push(token);
            flatten_set_op(right, leaves, operators);
        }
        other => leaves.push(other),
    }
}

/// Trailing `ORDER BY` / `LIMIT` / `OFFSET` / `FETCH` of the whole set
/// expression, rendered for reconstruction.
fn query_suffix(query: &Query) -> String {
    let mut suffix = String::new();
    if !query.order_by.is_empty() {
        let exprs: Vec<String> = query.order_by.iter().map(|o| o.to_string()).collect();
        suffix.push_str(&format!(" ORDER BY {}", exprs.join(", ")));
    }
    if let Some(limit) = &query.limit {
        suffix.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = &query.offset {
        suffix.push_str(&format!(" {offset}"));
    }
    if let Some(fetch) = &query.fetch {
        suffix.push_str(&format!(" {fetch}"));
    }
    suffix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_yields_single_main() {
        let nodes = extract_scopes("SELECT a, b FROM t WHERE a > 1").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::Main);
        assert_eq!(nodes[0].id, "main");
    }

    #[test]
    fn ctes_become_nodes_in_definition_order() {
        let sql = "WITH a AS (SELECT 1 AS x), b AS (SELECT x FROM a) SELECT * FROM b";
        let nodes = extract_scopes(sql).unwrap();
        let kinds: Vec<_> = nodes.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NodeKind::Cte, NodeKind::Cte, NodeKind::Main]
        );
        assert_eq!(nodes[0].name.as_deref(), Some("a"));
        assert_eq!(nodes[1].name.as_deref(), Some("b"));
        // Main body carries no WITH preamble.
        assert!(!nodes[2].body.to_uppercase().contains("WITH"));
    }

    #[test]
    fn correlated_scalar_subquery_gets_a_node() {
        let sql =
            "SELECT * FROM t1 WHERE t1.sk = (SELECT AVG(x) FROM t2 WHERE t2.fk = t1.sk)";
        let nodes = extract_scopes(sql).unwrap();
        let sub = nodes
            .iter()
            .find(|n| n.kind == NodeKind::Subquery)
            .expect("subquery node");
        assert!(sub.body.starts_with("SELECT AVG(x)"));
        let origin = sub.origin.as_ref().unwrap();
        assert_eq!(origin.parent, "main");
        // The parenthesized text appears verbatim in the parent body.
        let main = nodes.iter().find(|n| n.kind == NodeKind::Main).unwrap();
        assert!(main.body.contains(&origin.text));
    }

    #[test]
    fn uncorrelated_subquery_still_gets_a_node() {
        let sql = "SELECT * FROM t1 WHERE t1.x IN (SELECT y FROM t2)";
        let nodes = extract_scopes(sql).unwrap();
        assert!(nodes.iter().any(|n| n.kind == NodeKind::Subquery));
    }

    #[test]
    fn union_branches_are_extracted_with_suffix() {
        let sql = "SELECT a FROM t1 UNION ALL SELECT a FROM t2 ORDER BY a LIMIT 5";
        let (nodes, _) = extract(sql).unwrap();
        let branches: Vec<_> = nodes
            .iter()
            .filter(|n| n.kind == NodeKind::UnionBranch)
            .collect();
        assert_eq!(branches.len(), 2);
        let main = nodes.iter().find(|n| n.kind == NodeKind::Main).unwrap();
        let spec = main.set_op.as_ref().unwrap();
        assert_eq!(spec.operators, vec!["UNION ALL".to_string()]);
        assert_eq!(spec.suffix, " ORDER BY a LIMIT 5");
    }

    #[test]
    fn derived_table_is_a_subquery_node() {
        let sql = "SELECT s.total FROM (SELECT SUM(v) AS total FROM t GROUP BY k) AS s";
        let nodes = extract_scopes(sql).unwrap();
        let sub = nodes.iter().find(|n| n.kind == NodeKind::Subquery).unwrap();
        assert!(sub.body.contains("SUM(v)"));
    }

    #[test]
    fn non_query_statement_is_a_syntax_error() {
        let err = extract_scopes("INSERT INTO t VALUES (1)").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SyntaxError);
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        assert!(extract_scopes("SELEC whoops FROM").is_err());
    }
}
