//! Target engine boundary.
//!
//! The core depends on `execute(sql) -> (rows, timing)` and nothing else
//! about the database. Any engine satisfying the two traits below works;
//! concurrent callers must each take their own session so session-scoped
//! configuration stays isolated.
//!
//! [`StaticEngine`] is the scripted in-process double used throughout the
//! tests: statements map to queued outputs with injected timings.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Canonical token for row hashing. Numeric values collapse onto a
    /// grid of `tolerance` so float noise from aggregation order does not
    /// break bag comparison.
    pub fn canonical_token(&self, tolerance: f64) -> String {
        match self {
            Value::Null => "∅".to_string(),
            Value::Bool(b) => format!("b:{b}"),
            Value::Int(v) => quantize(*v as f64, tolerance),
            Value::Float(v) => quantize(*v, tolerance),
            Value::Text(s) => format!("t:{s}"),
        }
    }
}

fn quantize(value: f64, tolerance: f64) -> String {
    if tolerance <= 0.0 {
        return format!("n:{value}");
    }
    format!("n:{}", (value / tolerance).round() as i64)
}

pub type Row = Vec<Value>;

/// Rows plus the engine-measured execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// A pool-like handle capable of opening independent sessions.
#[async_trait]
pub trait TargetEngine: Send + Sync {
    async fn session(&self) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// One database session. No transaction state is shared between sessions,
/// and parameters set here are session-local.
#[async_trait]
pub trait EngineSession: Send {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput, EngineError>;

    async fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), EngineError>;
}

// ============================================================================
// Scripted engine for tests
// ============================================================================

#[derive(Debug)]
struct Script {
    columns: Vec<String>,
    rows: Vec<Row>,
    /// Per-execution timings; the last one repeats once drained.
    timings: VecDeque<Duration>,
    last_timing: Duration,
    /// Pending injected failures, consumed before any success.
    failures: u32,
}

/// In-process scripted engine: exact statement text maps to a queued
/// response. The always-available counterpart to a real database client,
/// in the same spirit as a mock LLM provider.
#[derive(Debug, Clone, Default)]
pub struct StaticEngine {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl StaticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a result set with a 1ms default timing.
    pub fn script(&self, sql: &str, columns: Vec<&str>, rows: Vec<Row>) {
        self.script_with_timings(sql, columns, rows, vec![1.0]);
    }

    /// Script a result set with explicit per-execution timings (ms).
    pub fn script_with_timings(
        &self,
        sql: &str,
        columns: Vec<&str>,
        rows: Vec<Row>,
        timings_ms: Vec<f64>,
    ) {
        let timings: VecDeque<Duration> = timings_ms
            .iter()
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
            .collect();
        let last_timing = timings
            .back()
            .copied()
            .unwrap_or(Duration::from_millis(1));
        self.scripts.lock().insert(
            normalize(sql),
            Script {
                columns: columns.into_iter().map(String::from).collect(),
                rows,
                timings,
                last_timing,
                failures: 0,
            },
        );
    }

    /// Make the next `count` executions of `sql` fail.
    pub fn fail_next(&self, sql: &str, count: u32) {
        let mut scripts = self.scripts.lock();
        let entry = scripts.entry(normalize(sql)).or_insert_with(|| Script {
            columns: Vec::new(),
            rows: Vec::new(),
            timings: VecDeque::new(),
            last_timing: Duration::from_millis(1),
            failures: 0,
        });
        entry.failures += count;
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl TargetEngine for StaticEngine {
    async fn session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        Ok(Box::new(StaticSession {
            scripts: Arc::clone(&self.scripts),
            parameters: Vec::new(),
        }))
    }
}

struct StaticSession {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    parameters: Vec<(String, String)>,
}

#[async_trait]
impl EngineSession for StaticSession {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput, EngineError> {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .get_mut(&normalize(sql))
            .ok_or_else(|| EngineError::Execution(format!("no script for statement: {sql}")))?;
        if script.failures > 0 {
            script.failures -= 1;
            return Err(EngineError::Execution("scripted failure".to_string()));
        }
        let elapsed = script.timings.pop_front().unwrap_or(script.last_timing);
        Ok(QueryOutput {
            columns: script.columns.clone(),
            rows: script.rows.clone(),
            elapsed,
        })
    }

    async fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.parameters.push((name.to_string(), value.to_string()));
        Ok(())
    }
}
