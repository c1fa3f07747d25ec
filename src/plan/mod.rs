//! Execution plan attribute extractor stage.
//!
//! Records carrying a Postgres plan get cost and shape attributes derived from
//! the plan tree. Results are cached by structural plan hash, so plans that
//! differ only in literal values are parsed once. MySQL records take a
//! degraded path based on statement text. Failures never drop a record; they
//! tag it with `plan_extraction_skipped=<reason>`.

pub mod derive;
pub mod fingerprint;
pub mod mysql;
pub mod tree;

use crate::cache::KeyedCache;
use crate::config::PlanExtractorConfig;
use crate::error::PipelineError;
use crate::model::{AttributeValue, Batch, PlanEngine, RawPlan, Record};
use crate::pipeline::{instant_after, ProcessContext, StageOutcome};
use chrono::{DateTime, Utc};
use derive::PlanSummary;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tree::{PlanError, PlanTree};

pub const SKIPPED_ATTRIBUTE: &str = "plan_extraction_skipped";
pub const PLAN_HASH_ATTRIBUTE: &str = "db.query.plan.hash";
pub const FINGERPRINT_ATTRIBUTE: &str = "db.query.fingerprint";

/// Cached derivation for one structural plan hash
#[derive(Debug, Clone)]
pub struct PlanCacheEntry {
    pub plan_hash: String,
    pub attributes: Arc<Vec<(String, AttributeValue)>>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PlanCounters {
    parse_invocations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlanStats {
    pub parse_invocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub skipped: u64,
    pub cache_size: usize,
}

impl PlanStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

enum Extraction {
    Derived {
        plan_hash: Option<String>,
        attributes: Arc<Vec<(String, AttributeValue)>>,
    },
    Skipped {
        plan_hash: Option<String>,
        reason: &'static str,
    },
}

pub struct PlanAttributeExtractor {
    config: PlanExtractorConfig,
    cache: KeyedCache<PlanCacheEntry>,
    counters: PlanCounters,
}

impl PlanAttributeExtractor {
    pub fn new(config: &PlanExtractorConfig) -> Self {
        Self {
            config: config.clone(),
            cache: KeyedCache::new(config.cache_size, config.cache_ttl()),
            counters: PlanCounters::default(),
        }
    }

    pub fn stats(&self) -> PlanStats {
        PlanStats {
            parse_invocations: self.counters.parse_invocations.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            cache_size: self.cache.len(),
        }
    }

    pub fn cached(&self, plan_hash: &str) -> Option<PlanCacheEntry> {
        self.cache.get(plan_hash)
    }

    pub fn process(&self, batch: &mut Batch) -> StageOutcome {
        self.process_at(batch, &ProcessContext::now())
    }

    pub fn process_at(&self, batch: &mut Batch, ctx: &ProcessContext) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        if !self.config.enabled {
            return outcome;
        }

        for record in batch.records.iter_mut() {
            if ctx.is_expired() {
                outcome.interrupted = true;
                break;
            }
            outcome.processed += 1;
            if record.dropped {
                continue;
            }

            // records without a plan pass through untouched
            let Some(plan) = record.raw_plan.take() else {
                continue;
            };
            self.attach_fingerprint(record);
            let extraction = self.extract(&plan, record, ctx.now);
            record.raw_plan = Some(plan);
            self.apply(record, extraction);
        }

        let stats = self.stats();
        crate::metrics::update_plan_cache_hit_ratio(stats.hit_ratio());
        outcome
    }

    fn extract(&self, plan: &RawPlan, record: &Record, now: Instant) -> Extraction {
        if plan.payload.len() > self.config.max_payload_bytes {
            return Extraction::Skipped {
                plan_hash: None,
                reason: "oversized",
            };
        }

        match plan.engine {
            PlanEngine::Postgres => self.extract_postgres(&plan.payload, now),
            PlanEngine::Mysql => {
                let sql = self.statement_text(record).unwrap_or(&plan.payload);
                Extraction::Derived {
                    plan_hash: None,
                    attributes: Arc::new(mysql::degraded_attributes(sql)),
                }
            }
            PlanEngine::Unknown => Extraction::Skipped {
                plan_hash: None,
                reason: "unsupported_engine",
            },
        }
    }

    fn extract_postgres(&self, payload: &str, now: Instant) -> Extraction {
        let decoded: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => return skipped(None, PlanError::InvalidJson(e.to_string())),
        };
        let root = match tree::plan_root(&decoded) {
            Ok(root) => root,
            Err(e) => return skipped(None, e),
        };
        let plan_hash = match tree::structural_hash(root, self.config.max_depth) {
            Ok(hash) => hash,
            Err(e) => return skipped(None, e),
        };

        if let Some(entry) = self.cache.get_at(&plan_hash, now) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_plan_cache_lookup("hit");
            return Extraction::Derived {
                plan_hash: Some(plan_hash),
                attributes: entry.attributes,
            };
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_plan_cache_lookup("miss");

        self.counters.parse_invocations.fetch_add(1, Ordering::Relaxed);
        let deadline = instant_after(Instant::now(), self.config.parse_timeout());
        let tree = match PlanTree::build(root, self.config.max_depth, deadline) {
            Ok(tree) => tree,
            Err(e) => return skipped(Some(plan_hash), e),
        };

        let attributes = Arc::new(PlanSummary::from_tree(&tree).attributes(&self.config));
        self.cache.insert_at(
            &plan_hash,
            PlanCacheEntry {
                plan_hash: plan_hash.clone(),
                attributes: attributes.clone(),
                computed_at: Utc::now(),
            },
            now,
        );

        Extraction::Derived {
            plan_hash: Some(plan_hash),
            attributes,
        }
    }

    fn apply(&self, record: &mut Record, extraction: Extraction) {
        match extraction {
            Extraction::Derived {
                plan_hash,
                attributes,
            } => {
                if let Some(hash) = plan_hash {
                    record.set_attribute(PLAN_HASH_ATTRIBUTE, hash);
                }
                for (name, value) in attributes.iter() {
                    record.attributes.insert(name.clone(), value.clone());
                }
            }
            Extraction::Skipped { plan_hash, reason } => {
                if let Some(hash) = plan_hash {
                    record.set_attribute(PLAN_HASH_ATTRIBUTE, hash);
                }
                record.set_attribute(SKIPPED_ATTRIBUTE, reason);
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_plan_extraction_skipped(reason);
                tracing::debug!(
                    database_id = %record.database_id,
                    query_id = %record.query_id,
                    reason = reason,
                    "Plan extraction skipped"
                );
            }
        }
    }

    fn statement_text<'a>(&self, record: &'a Record) -> Option<&'a str> {
        self.config
            .fingerprint
            .attributes
            .iter()
            .find_map(|name| record.attribute(name).and_then(AttributeValue::as_str))
    }

    fn attach_fingerprint(&self, record: &mut Record) {
        let settings = &self.config.fingerprint;
        if !settings.enabled {
            return;
        }

        let Some((name, text)) = settings.attributes.iter().find_map(|name| {
            record
                .attribute(name)
                .and_then(AttributeValue::as_str)
                .map(|text| (name.clone(), text.to_string()))
        }) else {
            return;
        };

        record.set_attribute(FINGERPRINT_ATTRIBUTE, fingerprint::fingerprint(&text));
        if settings.anonymize {
            record.set_attribute(&name, fingerprint::normalize_literals(&text));
        }
    }
}

fn skipped(plan_hash: Option<String>, error: PlanError) -> Extraction {
    let reason = error.reason();
    let error = PipelineError::TransientParse(error.to_string());
    tracing::debug!(error = %error, kind = error.kind(), "Plan could not be parsed");
    Extraction::Skipped { plan_hash, reason }
}
