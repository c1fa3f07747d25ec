//! Degraded attribute path for MySQL.
//!
//! No live EXPLAIN is run against MySQL, so records only receive coarse
//! attributes derived from the statement text itself.

use super::derive::ATTRIBUTE_PREFIX;
use crate::model::AttributeValue;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static RE_TABLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN|UPDATE|INTO)\s+([`"]?[\w$]+[`"]?(?:\.[`"]?[\w$]+[`"]?)?)"#)
        .expect("static regex")
});

static RE_LEADING_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\s*/\*.*?\*/\s*|\s*--[^\n]*\n)*").expect("static regex"));

const STATEMENT_TYPES: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "REPLACE", "CALL", "WITH", "SHOW", "SET",
];

pub fn statement_type(sql: &str) -> &'static str {
    let body = RE_LEADING_COMMENT.replace(sql, "");
    let keyword = body
        .trim_start()
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    STATEMENT_TYPES
        .iter()
        .find(|t| **t == keyword)
        .copied()
        .unwrap_or("OTHER")
}

/// Distinct tables referenced after FROM, JOIN, UPDATE or INTO
pub fn table_access_count(sql: &str) -> usize {
    RE_TABLE_REFERENCE
        .captures_iter(sql)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches(|c| c == '`' || c == '"').to_ascii_lowercase())
        .filter(|name| !name.eq_ignore_ascii_case("select"))
        .collect::<HashSet<_>>()
        .len()
}

pub fn degraded_attributes(sql: &str) -> Vec<(String, AttributeValue)> {
    vec![
        (
            format!("{}statement_type", ATTRIBUTE_PREFIX),
            AttributeValue::Str(statement_type(sql).to_string()),
        ),
        (
            format!("{}table_access_count", ATTRIBUTE_PREFIX),
            AttributeValue::Int(table_access_count(sql) as i64),
        ),
        (
            format!("{}degraded", ATTRIBUTE_PREFIX),
            AttributeValue::Bool(true),
        ),
    ]
}
