//! Arena-backed execution plan tree.
//!
//! Plans are walked with an explicit stack, never by recursion, and every walk
//! is bounded by a maximum depth so adversarial payloads cannot exhaust the
//! stack.

use super::fingerprint::normalize_literals;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("invalid plan JSON: {0}")]
    InvalidJson(String),
    #[error("payload does not contain a plan root")]
    NoPlanRoot,
    #[error("plan depth exceeds {0}")]
    DepthExceeded(usize),
    #[error("plan parsing exceeded its time budget")]
    Timeout,
}

impl PlanError {
    /// Value of the `plan_extraction_skipped` tag
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NoPlanRoot => "no_plan_root",
            Self::DepthExceeded(_) => "depth_exceeded",
            Self::Timeout => "timeout",
        }
    }
}

// keys whose values shape the plan and are hashed verbatim
const STRUCTURAL_KEYS: &[&str] = &[
    "Node Type",
    "Relation Name",
    "Index Name",
    "Join Type",
    "Parent Relationship",
    "Strategy",
    "Operation",
    "Scan Direction",
];

// condition strings, hashed with literals normalized away
const CONDITION_KEYS: &[&str] = &[
    "Filter",
    "Index Cond",
    "Hash Cond",
    "Merge Cond",
    "Join Filter",
    "Recheck Cond",
];

const CHILDREN_KEY: &str = "Plans";

/// Locate the plan root inside a decoded payload.
///
/// Accepts `[{"Plan": {...}}]` as produced by `EXPLAIN (FORMAT JSON)`, a bare
/// `{"Plan": {...}}` object, or a node object carrying `Node Type`.
pub fn plan_root(payload: &Value) -> Result<&Value, PlanError> {
    let candidate = match payload {
        Value::Array(items) => items.first().ok_or(PlanError::NoPlanRoot)?,
        other => other,
    };
    match candidate {
        Value::Object(map) if map.contains_key("Plan") => Ok(&map["Plan"]),
        Value::Object(map) if map.contains_key("Node Type") => Ok(candidate),
        _ => Err(PlanError::NoPlanRoot),
    }
}

enum HashStep<'a> {
    Enter(&'a Value, usize),
    Exit,
}

/// Structural hash of a plan: node types, shape, structural identifiers and
/// literal-free conditions. Other scalar values contribute only their type.
pub fn structural_hash(root: &Value, max_depth: usize) -> Result<String, PlanError> {
    let mut hasher = Sha256::new();
    let mut stack = vec![HashStep::Enter(root, 1)];

    while let Some(step) = stack.pop() {
        let (node, depth) = match step {
            HashStep::Exit => {
                hasher.update(b")");
                continue;
            }
            HashStep::Enter(node, depth) => (node, depth),
        };

        if depth > max_depth {
            return Err(PlanError::DepthExceeded(max_depth));
        }
        let Value::Object(map) = node else {
            return Err(PlanError::InvalidJson("plan node is not an object".to_string()));
        };

        hasher.update(b"(");
        for (key, value) in map {
            if key == CHILDREN_KEY {
                continue;
            }
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            if STRUCTURAL_KEYS.contains(&key.as_str()) {
                hasher.update(value.to_string().as_bytes());
            } else if CONDITION_KEYS.contains(&key.as_str()) {
                let text = value.as_str().map(normalize_literals).unwrap_or_default();
                hasher.update(text.as_bytes());
            } else {
                hasher.update(type_tag(value));
            }
            hasher.update(b";");
        }

        stack.push(HashStep::Exit);
        if let Some(Value::Array(children)) = map.get(CHILDREN_KEY) {
            for child in children.iter().rev() {
                stack.push(HashStep::Enter(child, depth + 1));
            }
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn type_tag(value: &Value) -> &'static [u8] {
    match value {
        Value::Null => b"null",
        Value::Bool(_) => b"bool",
        Value::Number(_) => b"number",
        Value::String(_) => b"string",
        Value::Array(_) => b"array",
        Value::Object(_) => b"object",
    }
}

/// One plan operator
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub node_type: String,
    pub relation_name: Option<String>,
    pub index_name: Option<String>,
    pub join_type: Option<String>,
    pub startup_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub plan_rows: Option<f64>,
    pub actual_total_time: Option<f64>,
    pub depth: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Plan operators stored in pre-order; index 0 is the root
#[derive(Debug, Clone)]
pub struct PlanTree {
    nodes: Vec<PlanNode>,
}

impl PlanTree {
    /// Build the tree, giving up once `deadline` passes
    pub fn build(root: &Value, max_depth: usize, deadline: Instant) -> Result<Self, PlanError> {
        let mut nodes: Vec<PlanNode> = Vec::new();
        let mut stack: Vec<(&Value, usize, Option<usize>)> = vec![(root, 1, None)];

        while let Some((value, depth, parent)) = stack.pop() {
            if Instant::now() >= deadline {
                return Err(PlanError::Timeout);
            }
            if depth > max_depth {
                return Err(PlanError::DepthExceeded(max_depth));
            }
            let Value::Object(map) = value else {
                return Err(PlanError::InvalidJson("plan node is not an object".to_string()));
            };

            let index = nodes.len();
            nodes.push(PlanNode {
                node_type: string_field(map, "Node Type").unwrap_or_else(|| "Unknown".to_string()),
                relation_name: string_field(map, "Relation Name"),
                index_name: string_field(map, "Index Name"),
                join_type: string_field(map, "Join Type"),
                startup_cost: number_field(map, "Startup Cost"),
                total_cost: number_field(map, "Total Cost"),
                plan_rows: number_field(map, "Plan Rows"),
                actual_total_time: number_field(map, "Actual Total Time"),
                depth,
                parent,
                children: Vec::new(),
            });
            if let Some(parent) = parent {
                nodes[parent].children.push(index);
            }

            if let Some(Value::Array(children)) = map.get(CHILDREN_KEY) {
                for child in children.iter().rev() {
                    stack.push((child, depth + 1, Some(index)));
                }
            }
        }

        if nodes.is_empty() {
            return Err(PlanError::NoPlanRoot);
        }
        Ok(Self { nodes })
    }

    pub fn root(&self) -> &PlanNode {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn number_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}
