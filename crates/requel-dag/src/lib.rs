//! Requel Query DAG: scope graph + patch-based rewrite core
//!
//! This crate holds the pure, in-memory half of the rewrite pipeline: it
//! partitions a SQL statement into scope nodes, links them into a dependency
//! graph, derives per-node contracts, and applies structural patch plans
//! proposed by an external generator.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        QUERY DAG PIPELINE                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   SQL text ──► Scope Extractor ──► Dependency Graph ──► Contracts    │
//! │                    (scope.rs)          (graph.rs)      (contract.rs) │
//! │                                            │                         │
//! │                                            ▼                         │
//! │   PatchPlan ──────────────────────► Patch Engine ──► reconstruct()   │
//! │   (from generator)                   (patch.rs)         ──► SQL text │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is synchronous and side-effect free: parsing, graph
//! construction, contract checks, and patch application never touch a
//! database. Execution-based checks live in `requel-verify`.
//!
//! ## Lifecycle
//!
//! A [`QueryDag`] is built once per input query and treated as logically
//! immutable; [`patch::PatchEngine::apply`] clones it, mutates exactly the
//! nodes a plan names, and returns the patched copy. Anchor hashes are
//! recomputed from node bodies on demand, so a later plan can target
//! expressions introduced by an earlier successful apply.

pub mod anchor;
pub mod contract;
pub mod error;
pub mod graph;
pub mod patch;
pub mod reconstruct;
pub mod scope;
pub(crate) mod walk;

use serde::{Deserialize, Serialize};

pub use contract::{Catalog, ContractStore, NodeContract, OutputColumn, TableSchema};
pub use error::{ErrorKind, RewriteError};
pub use graph::{Edge, EdgeKind, EdgeTarget};
pub use patch::{PatchEngine, PatchOperation, PatchPlan, Postcondition};
pub use reconstruct::reconstruct;
pub use scope::{extract_scopes, parse_statement};

// ============================================================================
// Core Types
// ============================================================================

/// Stable identifier for a scope node (`"main"`, `"cte:daily_rev"`, `"sub:0"`,
/// `"branch:1"`).
pub type NodeId = String;

/// What kind of scope a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A common-table-expression body.
    Cte,
    /// A scalar, `IN`, `EXISTS`, or derived-table subquery.
    Subquery,
    /// The residual outer statement.
    Main,
    /// One branch of a `UNION`/`INTERSECT`/`EXCEPT`.
    UnionBranch,
}

/// Where a subquery node sits inside its parent's body.
///
/// `text` is the parenthesized form of the subquery exactly as the printer
/// emits it inside the parent body; reconstruction splices the (possibly
/// patched) child body back over this segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubqueryOrigin {
    pub parent: NodeId,
    pub text: String,
}

/// Set-operation layout of the main node: branch order, the joining operator
/// tokens (`"UNION ALL"`, `"EXCEPT"`, ...), and the trailing
/// `ORDER BY`/`LIMIT` suffix that applies to the whole set expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOpSpec {
    pub branches: Vec<NodeId>,
    pub operators: Vec<String>,
    pub suffix: String,
}

/// One addressable scope of the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// CTE name, when the node is a CTE.
    pub name: Option<String>,
    /// Normalized SQL fragment (printed through the parser's AST printer).
    pub body: String,
    /// For subqueries: parent node + occupied text segment.
    pub origin: Option<SubqueryOrigin>,
    /// For the main node of a set-operation query.
    pub set_op: Option<SetOpSpec>,
    /// Declared alias columns of a CTE (`WITH r(a, b) AS ...`).
    #[serde(default)]
    pub cte_columns: Vec<String>,
}

impl ScopeNode {
    /// Anchor hashes over every sub-expression of this node's body.
    ///
    /// Recomputed from the current body text, so anchors stay valid across
    /// patch applications that did not touch this node.
    pub fn anchors(&self) -> Vec<anchor::Anchor> {
        anchor::collect_anchors(&self.body)
    }
}

/// The query DAG: scope nodes plus labeled dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDag {
    nodes: Vec<ScopeNode>,
    edges: Vec<Edge>,
    main: NodeId,
    with_recursive: bool,
}

impl QueryDag {
    /// Build the DAG for one SQL statement: extract scopes, then link them.
    ///
    /// Fails with [`RewriteError::Syntax`] on unparseable input; nothing is
    /// repaired.
    pub fn build(sql: &str) -> Result<Self, RewriteError> {
        let (nodes, with_recursive) = scope::extract(sql)?;
        let main = nodes
            .iter()
            .find(|n| n.kind == NodeKind::Main)
            .map(|n| n.id.clone())
            .ok_or_else(|| RewriteError::syntax("statement has no outer query"))?;
        let mut dag = Self {
            nodes,
            edges: Vec::new(),
            main,
            with_recursive,
        };
        dag.edges = graph::build_edges(&dag)?;
        Ok(dag)
    }

    pub fn main_id(&self) -> &NodeId {
        &self.main
    }

    pub fn with_recursive(&self) -> bool {
        self.with_recursive
    }

    pub fn nodes(&self) -> &[ScopeNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&ScopeNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut ScopeNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// CTE node for `name`, matched case-insensitively like SQL identifiers.
    pub fn cte_by_name(&self, name: &str) -> Option<&ScopeNode> {
        self.nodes.iter().find(|n| {
            n.kind == NodeKind::Cte
                && n.name
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(name))
        })
    }

    /// Subquery nodes extracted from `parent`'s body, in extraction order.
    pub fn children_of(&self, parent: &str) -> Vec<&ScopeNode> {
        self.nodes
            .iter()
            .filter(|n| n.origin.as_ref().is_some_and(|o| o.parent == parent))
            .collect()
    }

    /// Nodes that hold a `Ref` edge onto `producer`.
    pub fn consumers_of(&self, producer: &str) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Ref && e.to == EdgeTarget::Node(producer.to_string()))
            .map(|e| &e.from)
            .collect()
    }

    pub(crate) fn push_node(&mut self, node: ScopeNode) {
        self.nodes.push(node);
    }

    pub(crate) fn add_edge(&mut self, edge: Edge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub(crate) fn retire_node(&mut self, id: &str) {
        self.nodes.retain(|n| n.id != id);
        self.edges.retain(|e| {
            e.from != id && e.to != EdgeTarget::Node(id.to_string())
        });
    }

    /// Recompute all edges from the current node bodies.
    pub(crate) fn relink(&mut self) -> Result<(), RewriteError> {
        self.edges = graph::build_edges(self)?;
        Ok(())
    }

    /// Compact one-screen summary for generator requests: node ids, kinds,
    /// and body head, plus edge labels.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let head: String = node.body.chars().take(120).collect();
            out.push_str(&format!("{} [{:?}] {}\n", node.id, node.kind, head));
        }
        for edge in &self.edges {
            out.push_str(&format!("{} -{:?}-> {}\n", edge.from, edge.kind, edge.to));
        }
        out
    }
}
