//! Benchmark harness: interleaved, trimmed timed runs.
//!
//! Only invoked after full validation. One warm-up execution per variant
//! is discarded, then every measured round executes original, candidate,
//! and (optionally) a tuned candidate back to back — interleaving controls
//! for cache warmth and system drift far better than running one variant's
//! repetitions consecutively. Per-variant samples are reduced by median or
//! trimmed mean and `speedup = agg(original) / agg(candidate)`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use requel_dag::RewriteError;

use crate::engine::{EngineSession, TargetEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Median,
    /// Drop the fastest and slowest sample, mean the rest.
    TrimmedMean,
}

/// Session parameters applied to the optional tuned-candidate variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningVariant {
    pub parameters: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub warmup_runs: usize,
    pub rounds: usize,
    pub aggregation: Aggregation,
    pub tuning: Option<TuningVariant>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            rounds: 5,
            aggregation: Aggregation::Median,
            tuning: None,
        }
    }
}

/// Raw samples and the derived speedup ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub original_ms: Vec<f64>,
    pub candidate_ms: Vec<f64>,
    pub tuned_ms: Option<Vec<f64>>,
    pub speedup: f64,
    pub tuned_speedup: Option<f64>,
}

impl BenchmarkResult {
    /// The better of the plain and tuned ratios.
    pub fn best_speedup(&self) -> f64 {
        match self.tuned_speedup {
            Some(tuned) if tuned > self.speedup => tuned,
            _ => self.speedup,
        }
    }

    pub fn is_win(&self, target_speedup: f64) -> bool {
        self.best_speedup() >= target_speedup
    }
}

/// Runs the timing protocol against one engine.
pub struct BenchmarkHarness {
    engine: Arc<dyn TargetEngine>,
    config: BenchmarkConfig,
}

impl BenchmarkHarness {
    pub fn new(engine: Arc<dyn TargetEngine>, config: BenchmarkConfig) -> Self {
        Self { engine, config }
    }

    /// Time original vs candidate. Any execution failure during the timed
    /// runs is a [`RewriteError::Benchmark`]; the candidate stays
    /// valid-but-unmeasured.
    pub async fn run(
        &self,
        original_sql: &str,
        candidate_sql: &str,
    ) -> Result<BenchmarkResult, RewriteError> {
        let rounds = self.config.rounds.max(1);

        let mut session = self.session().await?;
        let mut tuned_session = match &self.config.tuning {
            Some(variant) => {
                let mut tuned = self.session().await?;
                for (name, value) in &variant.parameters {
                    tuned
                        .set_parameter(name, value)
                        .await
                        .map_err(|e| RewriteError::Benchmark(e.to_string()))?;
                }
                Some(tuned)
            }
            None => None,
        };

        // Warm-up, discarded.
        for _ in 0..self.config.warmup_runs {
            self.timed(&mut session, original_sql).await?;
            self.timed(&mut session, candidate_sql).await?;
            if let Some(tuned) = tuned_session.as_mut() {
                self.timed(tuned, candidate_sql).await?;
            }
        }

        let mut original_ms = Vec::with_capacity(rounds);
        let mut candidate_ms = Vec::with_capacity(rounds);
        let mut tuned_ms = tuned_session.as_ref().map(|_| Vec::with_capacity(rounds));

        for _ in 0..rounds {
            original_ms.push(self.timed(&mut session, original_sql).await?);
            candidate_ms.push(self.timed(&mut session, candidate_sql).await?);
            if let (Some(tuned), Some(samples)) = (tuned_session.as_mut(), tuned_ms.as_mut()) {
                samples.push(self.timed(tuned, candidate_sql).await?);
            }
        }

        let original_agg = aggregate(&original_ms, self.config.aggregation);
        let candidate_agg = aggregate(&candidate_ms, self.config.aggregation);
        let speedup = ratio(original_agg, candidate_agg);
        let tuned_speedup = tuned_ms
            .as_ref()
            .map(|samples| ratio(original_agg, aggregate(samples, self.config.aggregation)));

        Ok(BenchmarkResult {
            original_ms,
            candidate_ms,
            tuned_ms,
            speedup,
            tuned_speedup,
        })
    }

    async fn session(&self) -> Result<Box<dyn EngineSession>, RewriteError> {
        self.engine
            .session()
            .await
            .map_err(|e| RewriteError::Benchmark(e.to_string()))
    }

    async fn timed(
        &self,
        session: &mut Box<dyn EngineSession>,
        sql: &str,
    ) -> Result<f64, RewriteError> {
        let output = session
            .execute(sql)
            .await
            .map_err(|e| RewriteError::Benchmark(e.to_string()))?;
        Ok(output.elapsed.as_secs_f64() * 1000.0)
    }
}

fn ratio(original: f64, candidate: f64) -> f64 {
    if candidate <= 0.0 {
        return 0.0;
    }
    original / candidate
}

/// Reduce timing samples: median, or mean after dropping the fastest and
/// slowest run.
pub fn aggregate(samples: &[f64], aggregation: Aggregation) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    match aggregation {
        Aggregation::Median => {
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
        Aggregation::TrimmedMean => {
            let trimmed: &[f64] = if sorted.len() > 2 {
                &sorted[1..sorted.len() - 1]
            } else {
                &sorted
            };
            trimmed.iter().sum::<f64>() / trimmed.len() as f64
        }
    }
}
