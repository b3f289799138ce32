//! Plan-analysis boundary: bottleneck hints for the generator.
//!
//! A separate collaborator may inspect an execution plan and rank
//! operators by cost; the core only carries the resulting hints through
//! to generation requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GeneratorError;
use requel_dag::NodeId;

/// One ranked cost observation from an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckHint {
    /// Plan operator (`"Seq Scan"`, `"Nested Loop"`, ...).
    pub operator: String,
    /// Scope node the operator was attributed to, when known.
    pub node: Option<NodeId>,
    /// Fraction of total plan cost, 0..=1.
    pub cost_share: f64,
    pub note: String,
}

/// Boundary trait for the plan-analysis collaborator.
#[async_trait]
pub trait PlanAnalyzer: Send + Sync {
    async fn analyze(&self, sql: &str) -> Result<Vec<BottleneckHint>, GeneratorError>;
}

/// Default analyzer: no hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl PlanAnalyzer for NoopAnalyzer {
    async fn analyze(&self, _sql: &str) -> Result<Vec<BottleneckHint>, GeneratorError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_analyzer_returns_no_hints() {
        let hints = NoopAnalyzer.analyze("SELECT 1").await.unwrap();
        assert!(hints.is_empty());
    }
}
