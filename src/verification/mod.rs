//! Final quality and PII gate.
//!
//! Records are never dropped here. Problems are reported through the
//! `quality_issue` attribute (comma-joined when a record has several) and the
//! per-batch [`VerificationReport`].

pub mod health;
pub mod pii;
pub mod report;

use crate::config::{ValueType, VerificationConfig};
use crate::error::Result;
use crate::model::{AttributeValue, Batch, Record};
use crate::pipeline::{ProcessContext, StageOutcome};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use health::{tune, HealthStatus, HealthWindow, Thresholds, TuningBounds, WindowStats};
use pii::PiiRedactor;
pub use report::VerificationReport;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub const QUALITY_ISSUE_ATTRIBUTE: &str = "quality_issue";

pub struct VerificationStage {
    config: VerificationConfig,
    redactor: PiiRedactor,
    bounds: TuningBounds,
    thresholds: ArcSwap<Thresholds>,
    window: Mutex<HealthWindow>,
    /// Distinct values seen per cardinality-limited attribute
    cardinality: DashMap<String, HashSet<String>>,
}

impl VerificationStage {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            redactor: PiiRedactor::new(config)?,
            bounds: TuningBounds::from_config(&config.quality),
            thresholds: ArcSwap::from_pointee(Thresholds::base(&config.quality)),
            window: Mutex::new(HealthWindow::new(Instant::now())),
            cardinality: DashMap::new(),
        })
    }

    /// Thresholds currently applied, after any auto-tuning
    pub fn thresholds(&self) -> Thresholds {
        **self.thresholds.load()
    }

    pub fn health(&self) -> HealthStatus {
        let thresholds = self.thresholds();
        let stats = self.lock_window().reference();
        let error_rate = stats.error_rate_percent();

        HealthStatus {
            healthy: error_rate.map_or(true, |rate| rate <= thresholds.max_error_rate_percent),
            window_records: stats.records,
            error_rate_percent: error_rate,
            mean_latency_ms: stats.mean_latency_ms(),
            thresholds,
        }
    }

    pub fn process(&self, batch: &mut Batch) -> (StageOutcome, VerificationReport) {
        self.process_at(batch, &ProcessContext::now())
    }

    pub fn process_at(
        &self,
        batch: &mut Batch,
        ctx: &ProcessContext,
    ) -> (StageOutcome, VerificationReport) {
        let mut outcome = StageOutcome::default();
        let mut report = VerificationReport::default();
        if !self.config.enabled {
            return (outcome, report);
        }

        let thresholds = self.thresholds();
        let mut observed = WindowStats::default();

        for record in batch.records.iter_mut() {
            if ctx.is_expired() {
                outcome.interrupted = true;
                break;
            }
            outcome.processed += 1;
            if record.dropped {
                continue;
            }
            report.checked += 1;

            self.check_required(record, &mut report);
            report.pii_redactions += self.redactor.redact_record(record) as u64;
            self.check_types(record, &mut report);
            self.check_cardinality(record, &mut report);

            let latency = record
                .attribute(&self.config.quality.latency_attribute)
                .and_then(AttributeValue::as_f64);
            if latency.is_some_and(|ms| ms > thresholds.max_latency_ms) {
                record.append_tag(QUALITY_ISSUE_ATTRIBUTE, "latency_outlier");
                report.quality_failures += 1;
            }
            observed.observe(record.error_flag, latency);
        }

        report.auto_fixes_applied = self.close_window(&observed, ctx.now) as u64;
        report.emit();

        if report.has_issues() {
            tracing::debug!(
                batch_id = %batch.id,
                missing_required = report.missing_required,
                quality_failures = report.quality_failures,
                cardinality_overflows = report.cardinality_overflows,
                "Batch has data quality issues"
            );
        }

        (outcome, report)
    }

    fn check_required(&self, record: &mut Record, report: &mut VerificationReport) {
        for name in &self.config.required_attributes {
            if !is_present(record, name) {
                record.append_tag(QUALITY_ISSUE_ATTRIBUTE, &format!("missing:{}", name));
                report.missing_required += 1;
            }
        }
    }

    fn check_types(&self, record: &mut Record, report: &mut VerificationReport) {
        for expected in &self.config.expected_types {
            let mismatched = record
                .attribute(&expected.attribute)
                .is_some_and(|value| !matches_type(value, expected.value_type));
            if mismatched {
                record.append_tag(
                    QUALITY_ISSUE_ATTRIBUTE,
                    &format!("type_mismatch:{}", expected.attribute),
                );
                report.quality_failures += 1;
            }
        }
    }

    fn check_cardinality(&self, record: &mut Record, report: &mut VerificationReport) {
        for limit in &self.config.cardinality_limits {
            let Some(value) = record.attribute(&limit.attribute).map(|v| v.to_string()) else {
                continue;
            };

            let overflow = {
                let mut seen = self.cardinality.entry(limit.attribute.clone()).or_default();
                if seen.contains(&value) {
                    false
                } else if seen.len() >= limit.max_distinct {
                    true
                } else {
                    seen.insert(value);
                    false
                }
            };

            if overflow {
                record.append_tag(
                    QUALITY_ISSUE_ATTRIBUTE,
                    &format!("high_cardinality:{}", limit.attribute),
                );
                report.cardinality_overflows += 1;
            }
        }
    }

    /// Fold this batch into the rolling window and tune once if the window
    /// has run its full length. Returns the number of adjustments made.
    fn close_window(&self, observed: &WindowStats, now: Instant) -> usize {
        let mut window = self.lock_window();
        window.current.merge(observed);
        if now.saturating_duration_since(window.started) < self.config.auto_tune_window() {
            return 0;
        }

        let closed = window.roll(now);
        let current = self.thresholds();
        let (tuned, adjustments) = tune(
            current,
            &closed,
            &self.bounds,
            self.config.max_auto_fixes_per_window,
        );

        for adjustment in &adjustments {
            tracing::info!(
                threshold = adjustment.threshold.as_str(),
                from = adjustment.from,
                to = adjustment.to,
                window_records = closed.records,
                "🔧 Verification threshold auto-tuned"
            );
            crate::metrics::record_auto_tune(adjustment.threshold.as_str());
        }
        if !adjustments.is_empty() {
            self.thresholds.store(Arc::new(tuned));
        }

        adjustments.len()
    }

    fn lock_window(&self) -> MutexGuard<'_, HealthWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_present(record: &Record, name: &str) -> bool {
    if record.attribute(name).is_some() {
        return true;
    }
    match record.builtin_field(name) {
        Some(AttributeValue::Str(s)) => !s.is_empty(),
        Some(_) => true,
        None => false,
    }
}

fn matches_type(value: &AttributeValue, expected: ValueType) -> bool {
    match (expected, value) {
        (ValueType::String, AttributeValue::Str(_)) => true,
        (ValueType::Int, AttributeValue::Int(_)) => true,
        (ValueType::Double, AttributeValue::Double(_) | AttributeValue::Int(_)) => true,
        (ValueType::Bool, AttributeValue::Bool(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CardinalityLimitConfig, ExpectedTypeConfig};
    use std::time::Duration;

    fn ctx(now: Instant) -> ProcessContext {
        ProcessContext {
            now,
            deadline: None,
        }
    }

    fn issues(record: &Record) -> Vec<String> {
        record
            .attribute(QUALITY_ISSUE_ATTRIBUTE)
            .and_then(AttributeValue::as_str)
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_missing_required_is_tagged_not_dropped() {
        let config = VerificationConfig {
            required_attributes: vec!["query_id".to_string(), "db.system".to_string()],
            ..VerificationConfig::default()
        };
        let stage = VerificationStage::new(&config).unwrap();
        let mut batch = Batch::new(vec![
            Record::metric("db1", "", 1.0),
            Record::metric("db1", "q1", 1.0).with_attribute("db.system", "postgresql"),
        ]);

        let (_, report) = stage.process(&mut batch);

        assert_eq!(batch.len(), 2);
        assert_eq!(issues(&batch.records[0]), vec!["missing:query_id", "missing:db.system"]);
        assert!(issues(&batch.records[1]).is_empty());
        assert_eq!(report.missing_required, 2);
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn test_pii_redaction_round_trip() {
        let stage = VerificationStage::new(&VerificationConfig::default()).unwrap();
        let mut batch = Batch::new(vec![Record::metric("db1", "q1", 1.0).with_attribute(
            "query_text",
            "SELECT * FROM users WHERE email = 'user@example.com'",
        )]);

        let (_, report) = stage.process(&mut batch);

        let text = batch.records[0]
            .attribute("query_text")
            .and_then(AttributeValue::as_str)
            .unwrap();
        assert!(!text.contains("user@example.com"));
        assert!(text.contains("[REDACTED]"));
        assert!(report.pii_redactions >= 1);
    }

    #[test]
    fn test_type_mismatch() {
        let config = VerificationConfig {
            expected_types: vec![
                ExpectedTypeConfig {
                    attribute: "calls".to_string(),
                    value_type: ValueType::Int,
                },
                ExpectedTypeConfig {
                    attribute: "mean_exec_time_ms".to_string(),
                    value_type: ValueType::Double,
                },
            ],
            ..VerificationConfig::default()
        };
        let stage = VerificationStage::new(&config).unwrap();
        let mut batch = Batch::new(vec![Record::metric("db1", "q1", 1.0)
            .with_attribute("calls", "many")
            .with_attribute("mean_exec_time_ms", 12i64)]);

        let (_, report) = stage.process(&mut batch);

        assert_eq!(issues(&batch.records[0]), vec!["type_mismatch:calls"]);
        assert_eq!(report.quality_failures, 1);
    }

    #[test]
    fn test_cardinality_limit() {
        let config = VerificationConfig {
            cardinality_limits: vec![CardinalityLimitConfig {
                attribute: "client_addr".to_string(),
                max_distinct: 2,
            }],
            ..VerificationConfig::default()
        };
        let stage = VerificationStage::new(&config).unwrap();
        let records = ["a", "b", "a", "c"]
            .iter()
            .map(|addr| Record::metric("db1", "q1", 1.0).with_attribute("client_addr", *addr))
            .collect();
        let mut batch = Batch::new(records);

        let (_, report) = stage.process(&mut batch);

        assert_eq!(report.cardinality_overflows, 1);
        assert!(issues(&batch.records[2]).is_empty());
        assert_eq!(issues(&batch.records[3]), vec!["high_cardinality:client_addr"]);
    }

    #[test]
    fn test_latency_outlier() {
        let stage = VerificationStage::new(&VerificationConfig::default()).unwrap();
        let mut batch = Batch::new(vec![
            Record::metric("db1", "q1", 1.0).with_attribute("duration_ms", 25_000.0),
            Record::metric("db1", "q2", 1.0).with_attribute("duration_ms", 5.0),
        ]);

        let (_, report) = stage.process(&mut batch);

        assert_eq!(issues(&batch.records[0]), vec!["latency_outlier"]);
        assert!(issues(&batch.records[1]).is_empty());
        assert_eq!(report.quality_failures, 1);
    }

    #[test]
    fn test_auto_tune_once_per_window() {
        let config = VerificationConfig {
            auto_tune_window_seconds: 60,
            max_auto_fixes_per_window: 1,
            ..VerificationConfig::default()
        };
        let stage = VerificationStage::new(&config).unwrap();
        let start = Instant::now();
        let failing = || {
            Batch::new(
                (0..10)
                    .map(|i| Record::metric("db1", "q", 1.0).with_error(i < 8))
                    .collect(),
            )
        };

        // window still open: statistics accumulate, nothing tuned
        let (_, report) = stage.process_at(&mut failing(), &ctx(start));
        assert_eq!(report.auto_fixes_applied, 0);
        assert_eq!(stage.thresholds().max_error_rate_percent, 20.0);
        assert!(!stage.health().healthy);

        let later = start + Duration::from_secs(61);
        let (_, report) = stage.process_at(&mut failing(), &ctx(later));
        assert_eq!(report.auto_fixes_applied, 1);
        assert_eq!(stage.thresholds().max_error_rate_percent, 25.0);

        // new window just started at `later`
        let (_, report) = stage.process_at(&mut failing(), &ctx(later + Duration::from_secs(1)));
        assert_eq!(report.auto_fixes_applied, 0);
    }

    #[test]
    fn test_expired_deadline_leaves_records_untouched() {
        let stage = VerificationStage::new(&VerificationConfig::default()).unwrap();
        let original = Record::metric("db1", "q1", 1.0).with_attribute("query_text", "a@b.com");
        let mut batch = Batch::new(vec![original.clone()]);
        let now = Instant::now();
        let expired = ProcessContext {
            now,
            deadline: Some(now),
        };

        let (outcome, report) = stage.process_at(&mut batch, &expired);

        assert!(outcome.interrupted);
        assert_eq!(report.checked, 0);
        assert_eq!(batch.records[0], original);
    }
}
