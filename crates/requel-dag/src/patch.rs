//! Patch engine: a closed set of structural edits over scope nodes.
//!
//! A [`PatchPlan`] is an ordered list of operations plus declared
//! postconditions. Application is atomic: the engine works on a clone of
//! the DAG and hands it back only when every operation applied and every
//! touched node still satisfies its contract; the caller's DAG is never
//! observable in a half-patched state.
//!
//! Anchor-addressed operations (`ReplaceExprSubtree`, `DeleteExprSubtree`)
//! splice at the exact sub-expression whose content hash matches. A hash
//! that no longer resolves — including one invalidated by an earlier
//! operation in the same plan — is a hard [`RewriteError::AnchorNotFound`],
//! never a best-effort substitution.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{BinaryOperator, Expr};

use crate::anchor::anchor_hash;
use crate::contract::{split_conjuncts, Catalog, ContractStore};
use crate::error::RewriteError;
use crate::{scope, walk};
use crate::{Edge, EdgeKind, EdgeTarget, NodeId, NodeKind, QueryDag, ScopeNode};

// ============================================================================
// Plan types
// ============================================================================

/// One structural edit. Targets name a node id and, for subtree splices,
/// an anchor hash; payloads are SQL fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOperation {
    /// Append a new CTE consumed by the named nodes.
    InsertCte {
        name: String,
        body: String,
        #[serde(default)]
        consumers: Vec<NodeId>,
    },
    /// Replace the target node's FROM clause wholesale.
    ReplaceFrom { node: NodeId, from_sql: String },
    /// Replace the target node's WHERE predicate wholesale; an empty
    /// payload clears it.
    ReplaceWherePredicate { node: NodeId, predicate: String },
    /// Replace the target node's whole body.
    ReplaceBody { node: NodeId, body: String },
    /// Splice a new expression over the sub-expression under `anchor`.
    ReplaceExprSubtree {
        node: NodeId,
        anchor: String,
        expr: String,
    },
    /// Remove the sub-expression under `anchor`. Defined for boolean
    /// context only: an `AND` conjunct, or a whole WHERE/HAVING predicate.
    DeleteExprSubtree { node: NodeId, anchor: String },
}

impl PatchOperation {
    /// The node this operation mutates (the fresh id for `InsertCte`).
    pub fn target(&self) -> NodeId {
        match self {
            Self::InsertCte { name, .. } => format!("cte:{}", name.to_lowercase()),
            Self::ReplaceFrom { node, .. }
            | Self::ReplaceWherePredicate { node, .. }
            | Self::ReplaceBody { node, .. }
            | Self::ReplaceExprSubtree { node, .. }
            | Self::DeleteExprSubtree { node, .. } => node.clone(),
        }
    }
}

/// Declared postconditions of a plan. `Parses` is the floor and is always
/// enforced regardless of what the generator declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Postcondition {
    Parses,
}

/// An ordered, atomic set of structural edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchPlan {
    pub ops: Vec<PatchOperation>,
    #[serde(default = "default_postconditions")]
    pub postconditions: Vec<Postcondition>,
    /// Free-text contract diff the generator claims; informational only,
    /// never a substitute for validation.
    #[serde(default)]
    pub claim: Option<String>,
}

fn default_postconditions() -> Vec<Postcondition> {
    vec![Postcondition::Parses]
}

impl PatchPlan {
    pub fn new(ops: Vec<PatchOperation>) -> Self {
        Self {
            ops,
            postconditions: default_postconditions(),
            claim: None,
        }
    }

    pub fn with_claim(mut self, claim: impl Into<String>) -> Self {
        self.claim = Some(claim.into());
        self
    }

    /// Node ids this plan names, in declaration order, deduplicated.
    pub fn touched(&self) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        self.ops
            .iter()
            .map(|op| op.target())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Applies patch plans against DAG snapshots.
#[derive(Debug, Clone, Default)]
pub struct PatchEngine {
    catalog: Option<Catalog>,
}

impl PatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            catalog: Some(catalog),
        }
    }

    /// Apply `plan` to a copy of `dag`.
    ///
    /// On success the patched copy is returned with its edges relinked and
    /// every touched node contract-validated against the patched graph. On
    /// any failure the input DAG is untouched and no partial application
    /// is observable.
    pub fn apply(&self, dag: &QueryDag, plan: &PatchPlan) -> Result<QueryDag, RewriteError> {
        let mut next = dag.clone();
        let mut inserted: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

        for op in &plan.ops {
            self.apply_op(&mut next, op, &mut inserted)?;
        }

        next.relink()?;
        for (cte_id, consumers) in &inserted {
            for consumer in consumers {
                next.add_edge(Edge {
                    from: consumer.clone(),
                    to: EdgeTarget::Node(cte_id.clone()),
                    kind: EdgeKind::Ref,
                });
            }
        }

        // Contract validation over the patched graph: per touched node,
        // then the cross-node consumer/producer consistency sweep.
        let fresh = ContractStore::derive(&next, self.catalog.as_ref())?;
        for node_id in plan.touched() {
            if let Some(node) = next.node(&node_id) {
                fresh.validate_contract(&node_id, &node.body)?;
            }
        }
        ContractStore::check_consistency(&next, self.catalog.as_ref())?;

        Ok(next)
    }

    fn apply_op(
        &self,
        dag: &mut QueryDag,
        op: &PatchOperation,
        inserted: &mut Vec<(NodeId, Vec<NodeId>)>,
    ) -> Result<(), RewriteError> {
        match op {
            PatchOperation::InsertCte {
                name,
                body,
                consumers,
            } => {
                if dag.cte_by_name(name).is_some() {
                    return Err(RewriteError::contract(
                        format!("cte:{}", name.to_lowercase()),
                        format!("CTE `{name}` already exists"),
                    ));
                }
                for consumer in consumers {
                    if dag.node(consumer).is_none() {
                        return Err(RewriteError::contract(
                            consumer.clone(),
                            "declared consumer does not exist",
                        ));
                    }
                }
                let query = walk::parse_query(body)?;
                let id = format!("cte:{}", name.to_lowercase());
                dag.push_node(ScopeNode {
                    id: id.clone(),
                    kind: NodeKind::Cte,
                    name: Some(name.clone()),
                    body: query.to_string(),
                    origin: None,
                    set_op: None,
                    cte_columns: Vec::new(),
                });
                let mut counter = next_sub_counter(dag);
                let mut children = Vec::new();
                scope::extract_subqueries(&id, &query, &mut children, &mut counter);
                for child in children {
                    dag.push_node(child);
                }
                inserted.push((id, consumers.clone()));
                Ok(())
            }

            PatchOperation::ReplaceFrom { node, from_sql } => {
                reject_set_op_main(dag, node)?;
                let from = walk::parse_from_fragment(from_sql)?;
                let mut query = walk::parse_query(&body_of(dag, node)?)?;
                let select = walk::first_select_mut(&mut query).ok_or_else(|| {
                    RewriteError::syntax(format!("node {node} has no FROM clause to replace"))
                })?;
                select.from = from;
                commit_body(dag, node, query.to_string())
            }

            PatchOperation::ReplaceWherePredicate { node, predicate } => {
                reject_set_op_main(dag, node)?;
                let replacement = if predicate.trim().is_empty() {
                    None
                } else {
                    Some(walk::parse_expr_fragment(predicate)?)
                };
                let mut query = walk::parse_query(&body_of(dag, node)?)?;
                let select = walk::first_select_mut(&mut query).ok_or_else(|| {
                    RewriteError::syntax(format!("node {node} has no WHERE clause position"))
                })?;
                select.selection = replacement;
                commit_body(dag, node, query.to_string())
            }

            PatchOperation::ReplaceBody { node, body } => {
                let query = walk::parse_query(body)?;
                if dag
                    .node(node)
                    .is_some_and(|n| n.set_op.is_some())
                {
                    // A wholesale main replacement absorbs its branches.
                    let branches: Vec<NodeId> = dag
                        .node(node)
                        .and_then(|n| n.set_op.as_ref())
                        .map(|s| s.branches.clone())
                        .unwrap_or_default();
                    for branch in branches {
                        retire_subtree(dag, &branch);
                    }
                    if let Some(n) = dag.node_mut(node) {
                        n.set_op = None;
                    }
                }
                commit_body(dag, node, query.to_string())
            }

            PatchOperation::ReplaceExprSubtree { node, anchor, expr } => {
                reject_set_op_main(dag, node)?;
                let replacement = walk::parse_expr_fragment(expr)?;
                let mut query = walk::parse_query(&body_of(dag, node)?)?;
                let target = anchor.clone();
                let matched = walk::replace_in_query(
                    &mut query,
                    &|e: &Expr| anchor_hash(&e.to_string()) == target,
                    &replacement,
                );
                if !matched {
                    return Err(RewriteError::AnchorNotFound {
                        node: node.clone(),
                        anchor: anchor.clone(),
                    });
                }
                commit_body(dag, node, query.to_string())
            }

            PatchOperation::DeleteExprSubtree { node, anchor } => {
                reject_set_op_main(dag, node)?;
                let mut query = walk::parse_query(&body_of(dag, node)?)?;
                let select = walk::first_select_mut(&mut query).ok_or_else(|| {
                    RewriteError::AnchorNotFound {
                        node: node.clone(),
                        anchor: anchor.clone(),
                    }
                })?;
                let mut deleted = false;
                if let Some(selection) = select.selection.take() {
                    let (kept, hit) = drop_conjunct(selection, anchor);
                    select.selection = kept;
                    deleted = hit;
                }
                if !deleted {
                    if let Some(having) = select.having.take() {
                        let (kept, hit) = drop_conjunct(having, anchor);
                        select.having = kept;
                        deleted = hit;
                    }
                }
                if !deleted {
                    return Err(RewriteError::AnchorNotFound {
                        node: node.clone(),
                        anchor: anchor.clone(),
                    });
                }
                commit_body(dag, node, query.to_string())
            }
        }
    }
}

// ============================================================================
// Body bookkeeping
// ============================================================================

fn body_of(dag: &QueryDag, node: &str) -> Result<String, RewriteError> {
    dag.node(node)
        .map(|n| n.body.clone())
        .ok_or_else(|| RewriteError::contract(node, "unknown node"))
}

/// Clause- and expression-level edits cannot land on a set-operation main:
/// reconstruction renders its branches, so the edit would vanish. Plans
/// must target a branch node (or replace the body wholesale).
fn reject_set_op_main(dag: &QueryDag, node: &str) -> Result<(), RewriteError> {
    if dag.node(node).is_some_and(|n| n.set_op.is_some()) {
        return Err(RewriteError::contract(
            node,
            "set-operation main has no single clause; target a branch node",
        ));
    }
    Ok(())
}

/// Store a new body on `node` and bring its subquery children back in sync:
/// children whose text vanished are retired (with their descendants), new
/// subqueries get fresh nodes.
fn commit_body(dag: &mut QueryDag, node: &str, body: String) -> Result<(), RewriteError> {
    if dag.node(node).is_none() {
        return Err(RewriteError::contract(node, "unknown node"));
    }
    if let Some(n) = dag.node_mut(node) {
        n.body = body;
    }
    resync_children(dag, node)
}

fn resync_children(dag: &mut QueryDag, parent: &str) -> Result<(), RewriteError> {
    let body = body_of(dag, parent)?;
    // Reserve fresh ids before retiring anything: a retired child's id must
    // never be reused for a different subquery.
    let mut counter = next_sub_counter(dag);

    let stale: Vec<NodeId> = dag
        .children_of(parent)
        .iter()
        .filter(|c| {
            c.origin
                .as_ref()
                .is_some_and(|o| !body.contains(&o.text))
        })
        .map(|c| c.id.clone())
        .collect();
    for id in stale {
        retire_subtree(dag, &id);
    }

    let surviving: BTreeSet<String> = dag
        .children_of(parent)
        .iter()
        .filter_map(|c| c.origin.as_ref().map(|o| o.text.clone()))
        .collect();

    let query = walk::parse_query(&body)?;
    let mut extracted = Vec::new();
    scope::extract_subqueries(parent, &query, &mut extracted, &mut counter);

    // Keep a fresh node when it is a genuinely new direct child, or a
    // descendant of one we keep.
    let mut kept: BTreeSet<NodeId> = BTreeSet::new();
    for node in extracted {
        let Some(origin) = node.origin.as_ref() else { continue };
        let new_direct_child = origin.parent == parent && !surviving.contains(&origin.text);
        if new_direct_child || kept.contains(&origin.parent) {
            kept.insert(node.id.clone());
            dag.push_node(node);
        }
    }
    Ok(())
}

fn retire_subtree(dag: &mut QueryDag, id: &str) {
    let children: Vec<NodeId> = dag.children_of(id).iter().map(|c| c.id.clone()).collect();
    for child in children {
        retire_subtree(dag, &child);
    }
    dag.retire_node(id);
}

fn next_sub_counter(dag: &QueryDag) -> usize {
    dag.nodes()
        .iter()
        .filter_map(|n| n.id.strip_prefix("sub:"))
        .filter_map(|n| n.parse::<usize>().ok())
        .map(|n| n + 1)
        .max()
        .unwrap_or(0)
}

/// Remove the conjunct whose hash matches `anchor` from an `AND` chain.
/// Returns the rebuilt predicate (None when nothing is left) and whether a
/// conjunct was removed.
fn drop_conjunct(predicate: Expr, anchor: &str) -> (Option<Expr>, bool) {
    let conjuncts: Vec<Expr> = split_conjuncts(&predicate)
        .into_iter()
        .cloned()
        .collect();
    let before = conjuncts.len();
    let kept: Vec<Expr> = conjuncts
        .into_iter()
        .filter(|c| anchor_hash(&c.to_string()) != anchor)
        .collect();
    if kept.len() == before {
        // Whole-predicate deletion is also allowed.
        if anchor_hash(&predicate.to_string()) == anchor {
            return (None, true);
        }
        return (Some(predicate), false);
    }
    let rebuilt = kept.into_iter().reduce(|acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new(next),
    });
    (rebuilt, true)
}
