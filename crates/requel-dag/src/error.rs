//! Shared error taxonomy for the rewrite pipeline.
//!
//! Every per-candidate failure across the workspace is one of these
//! variants; the search controller converts them into structured attempt
//! records via [`ErrorKind`] so the generator can receive machine-readable
//! negative feedback.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

/// A failure anywhere in the rewrite pipeline.
#[derive(Debug, Clone, Error)]
pub enum RewriteError {
    /// Unparseable input or reconstructed text. Fatal to the candidate;
    /// never retried without a changed plan.
    #[error("syntax error: {message}")]
    Syntax { message: String },

    /// Missing or ambiguous column, dangling reference. Fatal to the
    /// candidate, surfaced as structured feedback.
    #[error("contract violation on node {node}: {detail}")]
    ContractViolation { node: NodeId, detail: String },

    /// A patch targeted a sub-expression hash that no longer resolves.
    /// Hard stop for the whole plan.
    #[error("anchor {anchor} not found on node {node}")]
    AnchorNotFound { node: NodeId, anchor: String },

    /// Row-count or value divergence between original and candidate.
    #[error("semantic mismatch ({mode} compare) at row {row}: {detail}")]
    SemanticMismatch {
        /// Comparison mode that detected the divergence (`"bag"`,
        /// `"positional"`, `"row-count"`).
        mode: String,
        /// First differing row index.
        row: usize,
        detail: String,
    },

    /// External generator call failed or timed out. Consumes a retry slot;
    /// never fatal to the run.
    #[error("generator failure: {0}")]
    Generator(String),

    /// Execution failure or timeout during timed runs. The candidate stays
    /// valid-but-unmeasured.
    #[error("benchmark failure: {0}")]
    Benchmark(String),
}

impl RewriteError {
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }

    pub fn contract(node: impl Into<NodeId>, detail: impl Into<String>) -> Self {
        Self::ContractViolation {
            node: node.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::SyntaxError,
            Self::ContractViolation { .. } => ErrorKind::ContractViolation,
            Self::AnchorNotFound { .. } => ErrorKind::AnchorNotFound,
            Self::SemanticMismatch { .. } => ErrorKind::SemanticMismatch,
            Self::Generator(_) => ErrorKind::GeneratorError,
            Self::Benchmark(_) => ErrorKind::BenchmarkError,
        }
    }
}

/// Fieldless mirror of [`RewriteError`] for attempt records and feedback
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    ContractViolation,
    AnchorNotFound,
    SemanticMismatch,
    GeneratorError,
    BenchmarkError,
}
