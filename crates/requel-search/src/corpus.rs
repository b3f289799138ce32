//! Rewrite-example corpus: read-mostly reference data for biasing the
//! generator.
//!
//! Loaded once per run into an immutable snapshot and shared via `Arc`;
//! nothing mutates it during search. Tournament lanes and evolutionary
//! iterations draw rotating, disjoint slices so generation contexts stay
//! diverse.

use serde::{Deserialize, Serialize};

/// One worked example: a query shape and its faster equivalent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusExample {
    pub title: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Immutable snapshot of the example corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteCorpus {
    examples: Vec<CorpusExample>,
}

impl RewriteCorpus {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(examples: Vec<CorpusExample>) -> Self {
        Self { examples }
    }

    /// Load a snapshot from its JSON rendition.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let examples: Vec<CorpusExample> = serde_json::from_str(json)?;
        Ok(Self { examples })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Examples most relevant to `sql` by shared-token count, best first,
    /// capped at `limit`.
    pub fn relevant(&self, sql: &str, limit: usize) -> Vec<CorpusExample> {
        let needles: Vec<String> = tokens(sql);
        let mut scored: Vec<(usize, &CorpusExample)> = self
            .examples
            .iter()
            .map(|example| {
                let haystack = format!(
                    "{} {} {}",
                    example.before,
                    example.title,
                    example.tags.join(" ")
                );
                let haystack_tokens = tokens(&haystack);
                let score = needles
                    .iter()
                    .filter(|t| haystack_tokens.contains(t))
                    .count();
                (score, example)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Disjoint rotation: the slice of examples assigned to `lane` out of
    /// `lanes` total, round-robin by position. Lane contexts never overlap.
    pub fn rotation(&self, lane: usize, lanes: usize) -> Vec<CorpusExample> {
        if lanes == 0 {
            return Vec::new();
        }
        self.examples
            .iter()
            .enumerate()
            .filter(|(i, _)| i % lanes == lane % lanes)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 2)
        .map(String::from)
        .collect()
}
