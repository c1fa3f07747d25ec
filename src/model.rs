//! Telemetry data model shared by every pipeline stage.
//!
//! Records arrive from receivers in a [`Batch`], are mutated in place by the
//! stages and leave towards the exporter in the same batch. A stage that wants
//! a record gone sets [`Record::dropped`]; the batch is compacted later so
//! per-stage accounting sees a stable batch size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl AttributeValue {
    /// Numeric view of the value. Numeric strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Str(s) => s.trim().parse::<f64>().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Str(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Self::Str(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// Name of the value type as used in configuration (`expected_types`)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    MetricPoint,
    LogEntry,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetricPoint => "metric_point",
            Self::LogEntry => "log_entry",
        }
    }
}

/// Database engine that produced a plan payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEngine {
    Postgres,
    Mysql,
    #[serde(other)]
    Unknown,
}

impl PlanEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Unknown => "unknown",
        }
    }
}

/// Opaque execution-plan payload attached by the receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlan {
    pub engine: PlanEngine,
    pub payload: String,
}

/// One telemetry observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub attributes: HashMap<String, AttributeValue>,
    #[serde(default)]
    pub database_id: String,
    #[serde(default)]
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_plan: Option<RawPlan>,
    #[serde(default)]
    pub error_flag: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dropped: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Record {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            value: None,
            attributes: HashMap::new(),
            database_id: String::new(),
            query_id: String::new(),
            raw_plan: None,
            error_flag: false,
            dropped: false,
        }
    }

    pub fn metric(database_id: &str, query_id: &str, value: f64) -> Self {
        let mut record = Self::new(RecordKind::MetricPoint);
        record.database_id = database_id.to_string();
        record.query_id = query_id.to_string();
        record.value = Some(value);
        record
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_error(mut self, error_flag: bool) -> Self {
        self.error_flag = error_flag;
        self
    }

    pub fn with_plan(mut self, engine: PlanEngine, payload: impl Into<String>) -> Self {
        self.raw_plan = Some(RawPlan {
            engine,
            payload: payload.into(),
        });
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Append a diagnostic value to a tag attribute, comma-joining with any
    /// value already present.
    pub fn append_tag(&mut self, key: &str, value: &str) {
        match self.attributes.get_mut(key) {
            Some(AttributeValue::Str(existing)) if !existing.is_empty() => {
                if !existing.split(',').any(|v| v == value) {
                    existing.push(',');
                    existing.push_str(value);
                }
            }
            _ => {
                self.attributes
                    .insert(key.to_string(), AttributeValue::Str(value.to_string()));
            }
        }
    }

    /// Value of a built-in field addressed by name, used by rule conditions
    /// when no attribute with that name exists.
    pub fn builtin_field(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "value" => self.value.map(AttributeValue::Double),
            "error" | "error_flag" => Some(AttributeValue::Bool(self.error_flag)),
            "database_id" => Some(AttributeValue::Str(self.database_id.clone())),
            "query_id" => Some(AttributeValue::Str(self.query_id.clone())),
            "kind" => Some(AttributeValue::Str(self.kind.as_str().to_string())),
            _ => None,
        }
    }
}

/// Records produced by one receiver invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: String::new(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records not marked dropped
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| !r.dropped).count()
    }

    /// Remove dropped records, returning how many were removed
    pub fn compact(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.dropped);
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_value_untagged_deserialize() {
        let attrs: HashMap<String, AttributeValue> = serde_json::from_str(
            r#"{"a": true, "b": 3, "c": 1.5, "d": "text"}"#,
        )
        .unwrap();

        assert_eq!(attrs["a"], AttributeValue::Bool(true));
        assert_eq!(attrs["b"], AttributeValue::Int(3));
        assert_eq!(attrs["c"], AttributeValue::Double(1.5));
        assert_eq!(attrs["d"], AttributeValue::Str("text".to_string()));
    }

    #[test]
    fn test_record_defaults_from_minimal_json() {
        let record: Record = serde_json::from_str(r#"{"kind": "log_entry"}"#).unwrap();
        assert_eq!(record.kind, RecordKind::LogEntry);
        assert!(record.database_id.is_empty());
        assert!(record.raw_plan.is_none());
        assert!(!record.dropped);
    }

    #[test]
    fn test_unknown_engine_maps_to_unknown() {
        let plan: RawPlan =
            serde_json::from_str(r#"{"engine": "oracle", "payload": "{}"}"#).unwrap();
        assert_eq!(plan.engine, PlanEngine::Unknown);
    }

    #[test]
    fn test_append_tag_joins_and_dedups() {
        let mut record = Record::new(RecordKind::LogEntry);
        record.append_tag("quality_issue", "missing:query_id");
        record.append_tag("quality_issue", "latency_outlier");
        record.append_tag("quality_issue", "missing:query_id");

        assert_eq!(
            record.attribute("quality_issue").and_then(|v| v.as_str()),
            Some("missing:query_id,latency_outlier")
        );
    }

    #[test]
    fn test_compact_removes_dropped() {
        let mut batch = Batch::new(vec![
            Record::metric("db1", "q1", 1.0),
            Record::metric("db1", "q2", 2.0),
            Record::metric("db2", "q3", 3.0),
        ]);
        batch.records[1].dropped = true;

        assert_eq!(batch.live_count(), 2);
        assert_eq!(batch.compact(), 1);
        assert_eq!(batch.len(), 2);
    }
}
