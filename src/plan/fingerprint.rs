//! Literal normalization and query fingerprints.
//!
//! Replaces string and numeric literals with `?` so that statements differing
//! only in their constants share one fingerprint.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static RE_STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("static regex"));

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").expect("static regex"));

static RE_CAST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\?").expect("static regex"));

static RE_IN_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("static regex")
});

static RE_MULTIPLE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Replace literal constants with `?` and collapse whitespace
pub fn normalize_literals(text: &str) -> String {
    let normalized = RE_STRING_LITERAL.replace_all(text, "?");
    let normalized = RE_NUMBER.replace_all(&normalized, "?");
    let normalized = RE_CAST_NUMBER.replace_all(&normalized, "?");
    let normalized = RE_IN_LIST.replace_all(&normalized, "IN (?)");
    let normalized = RE_MULTIPLE_SPACES.replace_all(&normalized, " ");
    normalized.trim().to_string()
}

/// Hex SHA-256 of the normalized statement
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize_literals(text).to_lowercase();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}
