//! Dependency graph builder: labeled edges between scope nodes.
//!
//! Three edge labels:
//! - `Ref` — consumer scope reads a sibling CTE's output (consumer → producer)
//! - `Correlated` — an inner scope's predicate reaches a column of an
//!   enclosing scope (inner → outer)
//! - `Table` — the scope scans a base relation, a leaf outside the node set
//!
//! The `Ref`/`Correlated` subgraph stays acyclic by construction: a scope
//! cannot reference a CTE defined after it except through correlation,
//! which SQL syntax only permits outer → inner.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RewriteError;
use crate::walk;
use crate::{NodeId, NodeKind, QueryDag, ScopeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    Ref,
    Correlated,
    Table,
}

/// Edge endpoint: another scope node, or a base-table leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeTarget {
    Node(NodeId),
    BaseTable(String),
}

impl fmt::Display for EdgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeTarget::Node(id) => write!(f, "{id}"),
            EdgeTarget::BaseTable(name) => write!(f, "table:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: EdgeTarget,
    pub kind: EdgeKind,
}

/// Build the full edge set for the current node bodies.
pub fn build_edges(dag: &QueryDag) -> Result<Vec<Edge>, RewriteError> {
    let mut edges = Vec::new();

    for node in dag.nodes() {
        // A set-operation main owns no relations of its own; its branches do.
        if node.set_op.is_some() {
            continue;
        }
        let query = walk::parse_query(&node.body)?;

        let mut seen = BTreeSet::new();
        for relation in walk::relations_of_query(&query, true) {
            if !seen.insert(relation.to_lowercase()) {
                continue;
            }
            match dag.cte_by_name(&relation) {
                // A recursive CTE naming itself is not a dependency edge.
                Some(cte) if cte.id != node.id => edges.push(Edge {
                    from: node.id.clone(),
                    to: EdgeTarget::Node(cte.id.clone()),
                    kind: EdgeKind::Ref,
                }),
                Some(_) => {}
                None => edges.push(Edge {
                    from: node.id.clone(),
                    to: EdgeTarget::BaseTable(relation),
                    kind: EdgeKind::Table,
                }),
            }
        }

        if node.kind == NodeKind::Subquery {
            correlate(dag, node, &query, &mut edges);
        }
    }

    Ok(edges)
}

/// Add `Correlated` edges for every free qualifier of a subquery node that
/// resolves in an enclosing scope.
fn correlate(dag: &QueryDag, node: &ScopeNode, query: &sqlparser::ast::Query, edges: &mut Vec<Edge>) {
    let local: BTreeSet<String> = walk::local_sources(query)
        .into_iter()
        .map(|s| s.to_lowercase())
        .collect();

    let mut free: Vec<String> = Vec::new();
    for (qualifier, _column) in walk::qualified_columns(query, true) {
        let lower = qualifier.to_lowercase();
        if !local.contains(&lower) && !free.contains(&lower) {
            free.push(lower);
        }
    }
    if free.is_empty() {
        return;
    }

    let mut ancestor = node.origin.as_ref().map(|o| o.parent.clone());
    while let Some(ancestor_id) = ancestor {
        let Some(outer) = dag.node(&ancestor_id) else { break };
        let outer_sources: BTreeSet<String> = match walk::parse_query(&outer.body) {
            Ok(q) => walk::local_sources(&q)
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            Err(_) => BTreeSet::new(),
        };
        free.retain(|qualifier| {
            if outer_sources.contains(qualifier) {
                let edge = Edge {
                    from: node.id.clone(),
                    to: EdgeTarget::Node(outer.id.clone()),
                    kind: EdgeKind::Correlated,
                };
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
                false
            } else {
                true
            }
        });
        if free.is_empty() {
            break;
        }
        ancestor = outer.origin.as_ref().map(|o| o.parent.clone());
    }
}

/// Topological order of the CTE nodes (producers first), ties broken by
/// definition order. Fails if `Ref` edges between CTEs form a cycle.
pub fn topo_order_ctes(dag: &QueryDag) -> Result<Vec<NodeId>, RewriteError> {
    let ctes: Vec<&ScopeNode> = dag
        .nodes()
        .iter()
        .filter(|n| n.kind == NodeKind::Cte)
        .collect();

    // consumer -> producers, restricted to CTE nodes
    let producers_of = |id: &str| -> Vec<NodeId> {
        dag.edges()
            .iter()
            .filter(|e| e.kind == EdgeKind::Ref && e.from == id)
            .filter_map(|e| match &e.to {
                EdgeTarget::Node(to) if ctes.iter().any(|c| &c.id == to) => Some(to.clone()),
                _ => None,
            })
            .collect()
    };

    let mut ordered: Vec<NodeId> = Vec::new();
    let mut remaining: Vec<NodeId> = ctes.iter().map(|c| c.id.clone()).collect();

    while !remaining.is_empty() {
        let ready: Vec<NodeId> = remaining
            .iter()
            .filter(|id| {
                producers_of(id)
                    .iter()
                    .all(|p| ordered.contains(p) || !remaining.contains(p))
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            return Err(RewriteError::contract(
                remaining[0].clone(),
                "cyclic CTE references",
            ));
        }
        for id in ready {
            ordered.push(id.clone());
            remaining.retain(|r| r != &id);
        }
    }

    Ok(ordered)
}
