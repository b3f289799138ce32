//! Execution-equivalence gate: result-set comparison rules.
//!
//! Two result sets are equivalent when row counts match exactly and the
//! rows agree under the comparison mode the query dictates:
//!
//! - no explicit `ORDER BY` → bag comparison over canonicalized row hashes
//! - explicit `ORDER BY` → positional comparison
//! - `unsafe_for_strict_check` queries → row count only, with a caveat
//!
//! Numeric cells are quantized by a configurable tolerance before hashing
//! so floating-point and aggregation-order noise does not produce false
//! mismatches.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use requel_dag::RewriteError;

use crate::engine::{QueryOutput, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareMode {
    /// Multiset of row hashes; physical order is irrelevant.
    Bag,
    /// Row-by-row, for queries with an explicit ordering clause.
    Positional,
    /// Count only; value comparison is relaxed for unsafe queries.
    RowCountOnly,
}

impl fmt::Display for CompareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareMode::Bag => write!(f, "bag"),
            CompareMode::Positional => write!(f, "positional"),
            CompareMode::RowCountOnly => write!(f, "row-count"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EquivalenceConfig {
    /// Grid for numeric canonicalization.
    pub float_tolerance: f64,
}

impl Default for EquivalenceConfig {
    fn default() -> Self {
        Self {
            float_tolerance: 1e-4,
        }
    }
}

// ============================================================================
// Safety classification
// ============================================================================

/// Why a query cannot be strictly value-checked, if at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyReport {
    pub unsafe_for_strict_check: bool,
    pub reasons: Vec<String>,
    pub has_explicit_order: bool,
}

/// Classify one statement: explicit ordering, non-deterministic functions,
/// unordered `LIMIT`.
pub fn classify_safety(sql: &str) -> Result<SafetyReport, RewriteError> {
    let query = match requel_dag::parse_statement(sql)? {
        sqlparser::ast::Statement::Query(q) => q,
        _ => return Err(RewriteError::syntax("only queries can be classified")),
    };

    let has_explicit_order = !query.order_by.is_empty();
    let mut reasons = Vec::new();

    if query.limit.is_some() && !has_explicit_order {
        reasons.push("LIMIT without ORDER BY".to_string());
    }

    // Non-deterministic functions anywhere in the statement text.
    let nondeterministic = Regex::new(
        r"(?i)\b(random|rand|now|current_timestamp|current_date|current_time|uuid|gen_random_uuid|newid)\b",
    )
    .map_err(|e| RewriteError::syntax(e.to_string()))?;
    if let Some(hit) = nondeterministic.find(sql) {
        reasons.push(format!("non-deterministic function `{}`", hit.as_str()));
    }

    Ok(SafetyReport {
        unsafe_for_strict_check: !reasons.is_empty(),
        reasons,
        has_explicit_order,
    })
}

impl SafetyReport {
    /// The comparison mode this query earns.
    pub fn compare_mode(&self) -> CompareMode {
        if self.unsafe_for_strict_check {
            CompareMode::RowCountOnly
        } else if self.has_explicit_order {
            CompareMode::Positional
        } else {
            CompareMode::Bag
        }
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Compare two result sets under `mode`. Any divergence reports the first
/// differing row index and the mode that detected it.
pub fn check_equivalence(
    original: &QueryOutput,
    candidate: &QueryOutput,
    mode: CompareMode,
    config: &EquivalenceConfig,
) -> Result<(), RewriteError> {
    if original.rows.len() != candidate.rows.len() {
        return Err(RewriteError::SemanticMismatch {
            mode: "row-count".to_string(),
            row: original.rows.len().min(candidate.rows.len()),
            detail: format!(
                "original returned {} rows, candidate {}",
                original.rows.len(),
                candidate.rows.len()
            ),
        });
    }

    match mode {
        CompareMode::RowCountOnly => Ok(()),
        CompareMode::Positional => {
            for (index, (left, right)) in
                original.rows.iter().zip(candidate.rows.iter()).enumerate()
            {
                if row_hash(left, config) != row_hash(right, config) {
                    return Err(RewriteError::SemanticMismatch {
                        mode: mode.to_string(),
                        row: index,
                        detail: "row value or order divergence".to_string(),
                    });
                }
            }
            Ok(())
        }
        CompareMode::Bag => {
            let mut counts: HashMap<String, i64> = HashMap::new();
            for row in &original.rows {
                *counts.entry(row_hash(row, config)).or_insert(0) += 1;
            }
            for (index, row) in candidate.rows.iter().enumerate() {
                let hash = row_hash(row, config);
                match counts.get_mut(&hash) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => {
                        return Err(RewriteError::SemanticMismatch {
                            mode: mode.to_string(),
                            row: index,
                            detail: "candidate row has no remaining match in original bag"
                                .to_string(),
                        })
                    }
                }
            }
            Ok(())
        }
    }
}

/// Stable hash of one row's canonicalized cells.
pub fn row_hash(row: &Row, config: &EquivalenceConfig) -> String {
    let mut hasher = Sha256::new();
    for value in row {
        hasher.update(value.canonical_token(config.float_tolerance).as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
