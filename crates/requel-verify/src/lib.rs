//! Requel verification: the execution side of the rewrite pipeline.
//!
//! Where `requel-dag` is pure structure, this crate talks to a target
//! database engine (behind the [`engine::TargetEngine`] boundary) to answer
//! the two questions structure cannot:
//!
//! 1. Does the candidate return the same result as the original?
//!    ([`pipeline::Validator`], three escalating gates)
//! 2. Is it actually faster, and by how much?
//!    ([`bench::BenchmarkHarness`], interleaved timed runs)
//!
//! Sessions are the unit of isolation: every concurrent caller takes its
//! own [`engine::EngineSession`], so session-local tuning parameters never
//! leak between tournament lanes.

pub mod bench;
pub mod engine;
pub mod equivalence;
pub mod pipeline;

pub use bench::{Aggregation, BenchmarkConfig, BenchmarkHarness, BenchmarkResult, TuningVariant};
pub use engine::{EngineError, EngineSession, QueryOutput, Row, StaticEngine, TargetEngine, Value};
pub use equivalence::{classify_safety, CompareMode, EquivalenceConfig, SafetyReport};
pub use pipeline::{ValidationReport, Validator};
