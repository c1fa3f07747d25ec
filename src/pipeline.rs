//! Pipeline orchestration.
//!
//! Stage order is fixed: circuit breaker, sampler, plan extractor,
//! verification. Each later stage relies on the drops made by the ones before
//! it. A stage that runs past the batch deadline stops mutating and the
//! remainder is forwarded unmodified to the next stage.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::Result;
use crate::model::Batch;
use crate::plan::PlanAttributeExtractor;
use crate::sampler::AdaptiveSampler;
use crate::verification::{VerificationReport, VerificationStage};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time reference and deadline for one batch
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    /// Logical time used for windows, TTLs and breaks
    pub now: Instant,
    pub deadline: Option<Instant>,
}

impl ProcessContext {
    pub fn now() -> Self {
        Self {
            now: Instant::now(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            now,
            deadline: timeout.map(|t| instant_after(now, t)),
        }
    }

    /// Checked against the wall clock, not `now`
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

// ~100 years; used when an addition would overflow the platform clock
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `from + after`, saturating instead of panicking on clock overflow
pub fn instant_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// What one stage did to a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub processed: usize,
    pub dropped: usize,
    /// The deadline passed before every record was visited
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: usize,
    pub circuit_dropped: usize,
    pub sampled_out: usize,
    pub exported: usize,
}

#[derive(Debug, Serialize)]
pub struct PipelineOutcome {
    pub batch: Batch,
    pub report: VerificationReport,
    pub stats: PipelineStats,
}

pub struct Pipeline {
    breaker: CircuitBreaker,
    sampler: Arc<AdaptiveSampler>,
    extractor: PlanAttributeExtractor,
    verifier: VerificationStage,
    batch_deadline: Option<Duration>,
}

impl Pipeline {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            sampler: Arc::new(AdaptiveSampler::new(&config.sampler)),
            extractor: PlanAttributeExtractor::new(&config.plan_extractor),
            verifier: VerificationStage::new(&config.verification)?,
            batch_deadline: config.pipeline.batch_deadline(),
        })
    }

    /// Replace the circuit breaker, e.g. with one using a custom memory gauge
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.sampler
    }

    pub fn plan_extractor(&self) -> &PlanAttributeExtractor {
        &self.extractor
    }

    pub fn verifier(&self) -> &VerificationStage {
        &self.verifier
    }

    pub fn process(&self, batch: Batch) -> PipelineOutcome {
        self.process_at(batch, &ProcessContext::with_timeout(self.batch_deadline))
    }

    pub fn process_at(&self, mut batch: Batch, ctx: &ProcessContext) -> PipelineOutcome {
        let started = Instant::now();
        let mut stats = PipelineStats {
            received: batch.len(),
            ..PipelineStats::default()
        };

        let breaker = self.breaker.process_at(&mut batch, ctx);
        note_interruption("circuit_breaker", &batch, &breaker);
        stats.circuit_dropped = breaker.dropped;

        let sampler = self.sampler.process_at(&mut batch, ctx);
        note_interruption("sampler", &batch, &sampler);
        stats.sampled_out = sampler.dropped;

        let extractor = self.extractor.process_at(&mut batch, ctx);
        note_interruption("plan_extractor", &batch, &extractor);

        let (verifier, report) = self.verifier.process_at(&mut batch, ctx);
        note_interruption("verification", &batch, &verifier);

        batch.compact();
        stats.exported = batch.len();

        crate::metrics::record_batch_processed(&stats, started.elapsed());
        tracing::debug!(
            batch_id = %batch.id,
            source = %batch.source,
            received = stats.received,
            circuit_dropped = stats.circuit_dropped,
            sampled_out = stats.sampled_out,
            exported = stats.exported,
            "Batch processed"
        );

        PipelineOutcome {
            batch,
            report,
            stats,
        }
    }
}

fn note_interruption(stage: &'static str, batch: &Batch, outcome: &StageOutcome) {
    if !outcome.interrupted {
        return;
    }
    tracing::warn!(
        batch_id = %batch.id,
        stage = stage,
        processed = outcome.processed,
        remaining = batch.len().saturating_sub(outcome.processed),
        "Batch deadline exceeded, forwarding remainder unmodified"
    );
    crate::metrics::record_deadline_exceeded(stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingRuleConfig, VerificationConfig};
    use crate::model::{PlanEngine, Record};
    use crate::plan::PLAN_HASH_ATTRIBUTE;
    use crate::verification::QUALITY_ISSUE_ATTRIBUTE;

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.verification = VerificationConfig {
            required_attributes: vec!["query_id".to_string()],
            ..VerificationConfig::default()
        };
        config
    }

    #[test]
    fn test_instant_after_saturates() {
        let now = Instant::now();
        assert_eq!(instant_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(instant_after(now, Duration::MAX) > now + Duration::from_secs(3600));

        let ctx = ProcessContext::with_timeout(Some(Duration::MAX));
        assert!(!ctx.is_expired());
    }

    #[test]
    fn test_stats_and_stage_order() {
        let mut config = create_test_config();
        config.circuit_breaker.default.min_requests_in_window = 4;
        config.sampler.rules = vec![SamplingRuleConfig {
            name: "drop_noise".to_string(),
            condition: "query_id == 'noise'".to_string(),
            rate: 0.0,
            priority: 1,
            max_per_minute: None,
        }];
        let pipeline = Pipeline::new(&config).unwrap();
        let ctx = ProcessContext::now();

        // four errors trip the circuit for db-a; everything after is dropped
        let mut records: Vec<Record> = (0..4)
            .map(|i| Record::metric("db-a", &format!("q{}", i), 1.0).with_error(true))
            .collect();
        records.push(Record::metric("db-a", "late", 1.0));
        records.push(Record::metric("db-b", "noise", 1.0));
        records.push(Record::metric("db-b", "keep", 1.0));

        let outcome = pipeline.process_at(Batch::new(records), &ctx);

        assert_eq!(outcome.stats.received, 7);
        assert_eq!(outcome.stats.circuit_dropped, 1);
        assert_eq!(outcome.stats.sampled_out, 1);
        assert_eq!(outcome.stats.exported, 5);
        assert_eq!(outcome.report.checked, 5);
        assert!(outcome.batch.records.iter().all(|r| r.query_id != "late"));
        assert!(outcome.batch.records.iter().all(|r| r.query_id != "noise"));
    }

    #[test]
    fn test_expired_deadline_forwards_batch_unmodified() {
        let pipeline = Pipeline::new(&create_test_config()).unwrap();
        let records = vec![
            Record::metric("db1", "", 1.0).with_attribute("query_text", "mail a@b.com"),
            Record::metric("db1", "q2", 1.0).with_plan(PlanEngine::Postgres, "not json"),
        ];
        let now = Instant::now();
        let ctx = ProcessContext {
            now,
            deadline: Some(now),
        };

        let outcome = pipeline.process_at(Batch::new(records.clone()), &ctx);

        assert_eq!(outcome.stats.exported, 2);
        assert_eq!(outcome.batch.records, records);
        assert_eq!(outcome.report.checked, 0);
    }

    #[test]
    fn test_records_annotated_end_to_end() {
        let pipeline = Pipeline::new(&create_test_config()).unwrap();
        let plan = r#"[{"Plan": {"Node Type": "Seq Scan", "Relation Name": "t", "Total Cost": 10.0}}]"#;
        let records = vec![
            Record::metric("db1", "q1", 1.0).with_plan(PlanEngine::Postgres, plan),
            Record::metric("db1", "", 1.0),
        ];

        let outcome = pipeline.process(Batch::new(records));

        let with_plan = &outcome.batch.records[0];
        assert!(with_plan.attribute(PLAN_HASH_ATTRIBUTE).is_some());
        assert_eq!(
            outcome.batch.records[1]
                .attribute(QUALITY_ISSUE_ATTRIBUTE)
                .and_then(|v| v.as_str()),
            Some("missing:query_id")
        );
        assert_eq!(outcome.report.missing_required, 1);
    }
}
