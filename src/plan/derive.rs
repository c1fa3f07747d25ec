use super::tree::PlanTree;
use crate::config::{ComplexityWeights, PlanExtractorConfig};
use crate::model::AttributeValue;

pub const ATTRIBUTE_PREFIX: &str = "db.query.plan.";

const JOIN_NODES: &[&str] = &["Nested Loop", "Hash Join", "Merge Join"];
const INDEX_SCAN_NODES: &[&str] = &["Index Scan", "Index Only Scan", "Bitmap Index Scan"];

/// Aggregate figures computed from one plan tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSummary {
    pub total_cost: f64,
    pub actual_total_time: Option<f64>,
    pub node_count: usize,
    pub sequential_scan_count: usize,
    pub nested_loop_count: usize,
    pub index_scan_count: usize,
    pub table_access_count: usize,
    pub join_count: usize,
    pub depth: usize,
}

impl PlanSummary {
    pub fn from_tree(tree: &PlanTree) -> Self {
        let root = tree.root();
        let mut summary = Self {
            total_cost: root.total_cost.unwrap_or(0.0),
            actual_total_time: root.actual_total_time,
            node_count: tree.len(),
            depth: tree.depth(),
            ..Self::default()
        };

        for node in tree.nodes() {
            let node_type = node.node_type.as_str();
            if node_type.ends_with("Seq Scan") {
                summary.sequential_scan_count += 1;
            }
            if node_type == "Nested Loop" {
                summary.nested_loop_count += 1;
            }
            if INDEX_SCAN_NODES.contains(&node_type) {
                summary.index_scan_count += 1;
            }
            if JOIN_NODES.contains(&node_type) {
                summary.join_count += 1;
            }
            if node.relation_name.is_some() {
                summary.table_access_count += 1;
            }
        }

        summary
    }

    /// `node_weight × nodes + seq_scan_weight × seq scans + join_weight × joins`
    pub fn complexity_score(&self, weights: &ComplexityWeights) -> f64 {
        weights.node_weight * self.node_count as f64
            + weights.seq_scan_weight * self.sequential_scan_count as f64
            + weights.join_weight * self.join_count as f64
    }

    /// Measured time when the plan carries it, otherwise cost scaled to ms
    pub fn estimated_execution_time_ms(&self, cost_to_ms_factor: f64) -> f64 {
        self.actual_total_time
            .unwrap_or(self.total_cost * cost_to_ms_factor)
    }

    /// Derived attributes enabled in `config`, with full attribute names
    pub fn attributes(&self, config: &PlanExtractorConfig) -> Vec<(String, AttributeValue)> {
        config
            .derived_attributes
            .iter()
            .filter_map(|name| {
                let value = match name.as_str() {
                    "total_cost" => AttributeValue::Double(self.total_cost),
                    "estimated_execution_time" => AttributeValue::Double(
                        self.estimated_execution_time_ms(config.cost_to_ms_factor),
                    ),
                    "has_sequential_scan" => AttributeValue::Bool(self.sequential_scan_count > 0),
                    "has_nested_loop" => AttributeValue::Bool(self.nested_loop_count > 0),
                    "index_scan_count" => AttributeValue::Int(self.index_scan_count as i64),
                    "table_access_count" => AttributeValue::Int(self.table_access_count as i64),
                    "node_count" => AttributeValue::Int(self.node_count as i64),
                    "join_count" => AttributeValue::Int(self.join_count as i64),
                    "depth" => AttributeValue::Int(self.depth as i64),
                    "plan_complexity_score" => {
                        AttributeValue::Double(self.complexity_score(&config.complexity))
                    }
                    _ => return None,
                };
                Some((format!("{}{}", ATTRIBUTE_PREFIX, name), value))
            })
            .collect()
    }
}
