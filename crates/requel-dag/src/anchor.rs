//! Anchor hashes: stable identity for sub-expressions of a mutating tree.
//!
//! An anchor is a content hash of a sub-expression's normalized printed
//! text. Patches target sub-expressions by anchor instead of by tree
//! position, so the engine needs no persistent node pointers across
//! rewrites: anchors are simply recomputed from node bodies after every
//! successful apply, and an anchor that no longer resolves is a hard
//! `AnchorNotFound`.
//!
//! The digest is an identity tool, not a security primitive: `"sha256:"`
//! plus the first 16 lowercase hex digits of the SHA-256 of the
//! whitespace-normalized text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::walk;

/// Prefix used in serialized anchors.
pub const ANCHOR_PREFIX: &str = "sha256:";

/// A content-derived identifier for one sub-expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub hash: String,
    /// Normalized text of the sub-expression the hash was computed over.
    pub text: String,
}

/// Hash one expression text.
pub fn anchor_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    let mut hex = String::with_capacity(ANCHOR_PREFIX.len() + 16);
    hex.push_str(ANCHOR_PREFIX);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Collapse whitespace runs so hand-written fragments and printer output
/// hash identically.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Anchors for every sub-expression of a node body, in deterministic
/// traversal order, first occurrence wins on duplicate text.
pub fn collect_anchors(body: &str) -> Vec<Anchor> {
    let Ok(query) = walk::parse_query(body) else {
        return Vec::new();
    };
    let mut anchors: Vec<Anchor> = Vec::new();
    for root in walk::expr_roots(&query, true) {
        walk::walk_expr(root, &mut |expr| {
            let text = expr.to_string();
            let hash = anchor_hash(&text);
            if !anchors.iter().any(|a| a.hash == hash) {
                anchors.push(Anchor { hash, text });
            }
        });
    }
    anchors
}
