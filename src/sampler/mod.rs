//! Adaptive sampler stage.
//!
//! Decides per record whether it survives. Rules are evaluated in ascending
//! priority; the first match sets the rate, otherwise the default rate
//! applies. Decisions are sticky per dedup key for the cache TTL, so the same
//! query is treated identically across batches.

pub mod expr;
pub mod persistence;
pub mod rate_limit;

use crate::cache::KeyedCache;
use crate::config::SamplerConfig;
use crate::error::Result;
use crate::model::{Batch, Record};
use crate::pipeline::{instant_after, ProcessContext, StageOutcome};
use crate::signals::ShutdownSignal;
use chrono::Utc;
use expr::Expr;
use persistence::{SnapshotEntry, SnapshotStore};
use rate_limit::{MinuteWindow, TokenBucket};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub const SAMPLING_SKIPPED_ATTRIBUTE: &str = "sampling_skipped";

/// Cached outcome for one dedup key
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingDecision {
    pub rate: f64,
    pub sampled: bool,
}

struct CompiledRule {
    name: String,
    // None when the condition failed to compile; the rule never matches
    condition: Option<Expr>,
    rate: f64,
    budget: Option<Mutex<MinuteWindow>>,
}

#[derive(Debug, Default)]
struct SamplerCounters {
    sampled: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    pub sampled: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
    pub cache_size: usize,
}

pub struct AdaptiveSampler {
    enabled: bool,
    rules: Vec<CompiledRule>,
    default_rate: f64,
    dedup_key_attribute: String,
    cache: KeyedCache<SamplingDecision>,
    limiter: Mutex<TokenBucket>,
    store: Option<SnapshotStore>,
    counters: SamplerCounters,
}

// ============================================================
// Construction
// ============================================================

impl AdaptiveSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        let now = Instant::now();

        let mut ordered: Vec<_> = config.rules.iter().collect();
        ordered.sort_by_key(|rule| rule.priority);

        let rules = ordered
            .into_iter()
            .map(|rule| {
                let condition = match expr::compile(&rule.condition) {
                    Ok(expr) => Some(expr),
                    Err(e) => {
                        tracing::warn!(
                            rule = %rule.name,
                            condition = %rule.condition,
                            error = %e,
                            "Sampling rule condition is malformed, rule disabled"
                        );
                        None
                    }
                };
                CompiledRule {
                    name: rule.name.clone(),
                    condition,
                    rate: rule.rate,
                    budget: rule
                        .max_per_minute
                        .map(|limit| Mutex::new(MinuteWindow::new(limit, now))),
                }
            })
            .collect();

        let store = config.persist_path.as_ref().map(|path| {
            SnapshotStore::new(path, Duration::from_secs(config.max_snapshot_age_seconds))
        });

        Self {
            enabled: config.enabled,
            rules,
            default_rate: config.default_rate,
            dedup_key_attribute: config.dedup_key_attribute.clone(),
            cache: KeyedCache::new(config.cache_size, config.cache_ttl()),
            limiter: Mutex::new(TokenBucket::new(config.max_decisions_per_second, now)),
            store,
            counters: SamplerCounters::default(),
        }
    }

    /// Names of rules disabled because their condition did not compile
    pub fn disabled_rules(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|rule| rule.condition.is_none())
            .map(|rule| rule.name.as_str())
            .collect()
    }
}

// ============================================================
// Sampling
// ============================================================

impl AdaptiveSampler {
    pub fn process(&self, batch: &mut Batch) -> StageOutcome {
        self.process_at(batch, &ProcessContext::now())
    }

    /// Sample every live record, then remove the ones not sampled. Records
    /// already marked dropped by an earlier stage are removed as well.
    pub fn process_at(&self, batch: &mut Batch, ctx: &ProcessContext) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        if !self.enabled {
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
            if !self.sample_record(record, ctx.now) {
                record.dropped = true;
                outcome.dropped += 1;
            }
        }

        batch.compact();
        crate::metrics::update_sampler_cache_size(self.cache.len());
        outcome
    }

    /// Returns whether the record is kept
    fn sample_record(&self, record: &mut Record, now: Instant) -> bool {
        let (rule, rate) = self.match_rule(record);
        let key = self.dedup_key(record);

        if let Some(key) = key.as_deref() {
            if let Some(decision) = self.cache.get_at(key, now) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_sampler_decision("duplicate");
                return self.apply(decision.sampled);
            }
        }

        if !self.acquire_token(now) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_sampler_decision("rate_limited");
            record.set_attribute(SAMPLING_SKIPPED_ATTRIBUTE, "rate_limited");
            tracing::debug!(
                database_id = %record.database_id,
                query_id = %record.query_id,
                "Sampler decision budget exhausted, keeping record"
            );
            return true;
        }

        if let Some(rule) = rule {
            if !rule_budget_available(rule, now) {
                crate::metrics::record_sampler_decision("rule_budget_exhausted");
                return self.apply(false);
            }
        }

        let hash = match key.as_deref() {
            Some(key) => stable_hash(key),
            None => attributes_hash(record),
        };
        let decision = SamplingDecision {
            rate,
            sampled: ((hash % 100) as f64) < rate,
        };

        if let Some(key) = key.as_deref() {
            self.cache.insert_at(key, decision, now);
        }

        crate::metrics::record_sampler_decision(if decision.sampled { "sampled" } else { "dropped" });
        self.apply(decision.sampled)
    }

    fn apply(&self, sampled: bool) -> bool {
        if sampled {
            self.counters.sampled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        sampled
    }

    fn match_rule(&self, record: &Record) -> (Option<&CompiledRule>, f64) {
        self.rules
            .iter()
            .find(|rule| {
                rule.condition
                    .as_ref()
                    .map_or(false, |condition| condition.evaluate(record))
            })
            .map_or((None, self.default_rate), |rule| (Some(rule), rule.rate))
    }

    fn dedup_key(&self, record: &Record) -> Option<String> {
        let value = record
            .attribute(&self.dedup_key_attribute)
            .map(|v| v.to_string())
            .or_else(|| {
                record
                    .builtin_field(&self.dedup_key_attribute)
                    .map(|v| v.to_string())
            })?;
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    fn acquire_token(&self, now: Instant) -> bool {
        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(now)
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            sampled: self.counters.sampled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            cache_size: self.cache.len(),
        }
    }

    /// Cached decision for a dedup key, if unexpired
    pub fn cached_decision(&self, key: &str) -> Option<SamplingDecision> {
        self.cache.get(key)
    }
}

fn rule_budget_available(rule: &CompiledRule, now: Instant) -> bool {
    match &rule.budget {
        None => true,
        Some(window) => {
            let available = window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_acquire(now);
            if !available {
                tracing::debug!(rule = %rule.name, "Sampling rule budget spent for this minute");
            }
            available
        }
    }
}

/// First eight bytes of the SHA-256 digest, big endian
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn attributes_hash(record: &Record) -> u64 {
    let mut pairs: Vec<_> = record.attributes.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut canonical = String::new();
    for (key, value) in pairs {
        canonical.push_str(key);
        canonical.push('=');
        canonical.push_str(&value.to_string());
        canonical.push(';');
    }
    stable_hash(&canonical)
}

// ============================================================
// Persistence
// ============================================================

impl AdaptiveSampler {
    /// Restore cached decisions from the snapshot file. Corrupt or unreadable
    /// snapshots are logged and the cache starts empty.
    pub fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let entries = match store.load(Utc::now()) {
            Ok(Some(entries)) => entries,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    error = %e,
                    "Sampler snapshot unusable, starting with an empty cache"
                );
                crate::metrics::record_cache_corruption("sampler");
                self.cache.clear();
                return 0;
            }
        };

        let now = Instant::now();
        let wall_now = Utc::now();
        let mut restored = 0;
        for entry in entries {
            let Ok(remaining) = entry.expires_at.signed_duration_since(wall_now).to_std() else {
                continue;
            };
            // never extend an entry beyond the configured TTL
            let remaining = remaining.min(self.cache.ttl());
            self.cache.insert_with_expiry(
                &entry.key,
                SamplingDecision {
                    rate: entry.rate,
                    sampled: entry.sampled,
                },
                instant_after(now, remaining),
            );
            restored += 1;
        }

        tracing::info!(
            path = %store.path().display(),
            entries = restored,
            "Sampler cache restored from snapshot"
        );
        restored
    }

    /// Write the current cache to the snapshot file
    pub fn persist(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let now = Instant::now();
        self.cache.purge_expired(now);

        let wall_now = Utc::now();
        let entries = self
            .cache
            .entries(now)
            .into_iter()
            .filter_map(|(key, decision, expires_at)| {
                let remaining = chrono::Duration::from_std(expires_at.duration_since(now)).ok()?;
                Some(SnapshotEntry {
                    key,
                    rate: decision.rate,
                    sampled: decision.sampled,
                    expires_at: wall_now.checked_add_signed(remaining)?,
                })
            })
            .collect();

        store.save(entries)
    }

    pub fn has_persistence(&self) -> bool {
        self.store.is_some()
    }
}

/// Periodic snapshot task. Runs until shutdown, then writes a final snapshot.
pub async fn run_persistence_task(
    sampler: Arc<AdaptiveSampler>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    if !sampler.has_persistence() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                persist_in_background(&sampler).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Writing final sampler snapshot");
                persist_in_background(&sampler).await;
                break;
            }
        }
    }
}

async fn persist_in_background(sampler: &Arc<AdaptiveSampler>) {
    let sampler = sampler.clone();
    match tokio::task::spawn_blocking(move || sampler.persist()).await {
        Ok(Ok(count)) => {
            tracing::debug!(entries = count, "Sampler snapshot persisted");
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to persist sampler snapshot");
        }
        Err(e) => {
            tracing::error!(error = %e, "Sampler snapshot task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingRuleConfig;
    use crate::model::RecordKind;
    use tempfile::TempDir;

    fn create_test_config() -> SamplerConfig {
        SamplerConfig {
            default_rate: 50.0,
            ..SamplerConfig::default()
        }
    }

    fn rule(name: &str, condition: &str, rate: f64, priority: i32) -> SamplingRuleConfig {
        SamplingRuleConfig {
            name: name.to_string(),
            condition: condition.to_string(),
            rate,
            priority,
            max_per_minute: None,
        }
    }

    #[test]
    fn test_same_key_same_decision() {
        let sampler = AdaptiveSampler::new(&create_test_config());
        let ctx = ProcessContext::now();

        let keys: Vec<String> = (0..50).map(|i| format!("query-{}", i)).collect();
        let mut first = Batch::new(keys.iter().map(|k| Record::metric("db", k, 1.0)).collect());
        let mut second = first.clone();

        sampler.process_at(&mut first, &ctx);
        sampler.process_at(&mut second, &ctx);

        let kept_first: Vec<_> = first.records.iter().map(|r| r.query_id.clone()).collect();
        let kept_second: Vec<_> = second.records.iter().map(|r| r.query_id.clone()).collect();
        assert_eq!(kept_first, kept_second);
        assert_eq!(sampler.stats().duplicates, 50);
    }

    #[test]
    fn test_unbounded_ttl_does_not_panic() {
        let config = SamplerConfig {
            cache_ttl_seconds: i64::MAX as u64,
            ..create_test_config()
        };
        let sampler = AdaptiveSampler::new(&config);
        let mut batch = Batch::new(vec![Record::metric("db", "q1", 1.0)]);

        sampler.process(&mut batch);

        assert!(sampler.cached_decision("q1").is_some());
    }

    #[test]
    fn test_rate_bounds() {
        let mut config = create_test_config();
        config.rules = vec![rule("keep-errors", "error == true", 100.0, 0)];
        config.default_rate = 0.0;
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0).with_error(true),
            Record::metric("db", "q2", 1.0),
            Record::metric("db", "q3", 1.0),
        ]);
        let outcome = sampler.process(&mut batch);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].query_id, "q1");
        assert_eq!(outcome.dropped, 2);
    }

    #[test]
    fn test_rules_evaluated_by_priority() {
        let mut config = create_test_config();
        config.rules = vec![
            rule("slow-keep", "mean_exec_time_ms > 1000", 100.0, 10),
            rule("slow-drop", "mean_exec_time_ms > 500", 0.0, 1),
        ];
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0).with_attribute("mean_exec_time_ms", 2000.0)
        ]);
        sampler.process(&mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_malformed_rule_is_disabled() {
        let mut config = create_test_config();
        config.rules = vec![
            rule("broken", "error ==", 0.0, 0),
            rule("keep", "error == true", 100.0, 1),
        ];
        let sampler = AdaptiveSampler::new(&config);
        assert_eq!(sampler.disabled_rules(), vec!["broken"]);

        let mut batch = Batch::new(vec![Record::metric("db", "q1", 1.0).with_error(true)]);
        sampler.process(&mut batch);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_rate_limited_records_fail_open() {
        let mut config = create_test_config();
        config.default_rate = 0.0;
        config.max_decisions_per_second = 2;
        let sampler = AdaptiveSampler::new(&config);

        let records = (0..5).map(|i| Record::metric("db", &format!("q{}", i), 1.0)).collect();
        let mut batch = Batch::new(records);
        sampler.process_at(&mut batch, &ProcessContext::now());

        // two decisions drop, the remaining three are kept and tagged
        assert_eq!(batch.len(), 3);
        for record in &batch.records {
            assert_eq!(
                record.attribute(SAMPLING_SKIPPED_ATTRIBUTE).and_then(|v| v.as_str()),
                Some("rate_limited")
            );
        }
        assert_eq!(sampler.stats().rate_limited, 3);
    }

    #[test]
    fn test_rule_budget_exhaustion_drops_without_caching() {
        let mut config = create_test_config();
        config.rules = vec![SamplingRuleConfig {
            max_per_minute: Some(1),
            ..rule("errors", "error", 100.0, 0)
        }];
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0).with_error(true),
            Record::metric("db", "q2", 1.0).with_error(true),
        ]);
        sampler.process(&mut batch);

        assert_eq!(batch.len(), 1);
        assert!(sampler.cached_decision("q1").is_some());
        assert!(sampler.cached_decision("q2").is_none());
    }

    #[test]
    fn test_records_without_key_are_not_cached() {
        let mut config = create_test_config();
        config.default_rate = 100.0;
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::new(RecordKind::LogEntry).with_attribute("message", "hello")
        ]);
        sampler.process(&mut batch);

        assert_eq!(batch.len(), 1);
        assert_eq!(sampler.stats().cache_size, 0);
    }

    #[test]
    fn test_custom_dedup_attribute() {
        let mut config = create_test_config();
        config.dedup_key_attribute = "db.query.plan.hash".to_string();
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0).with_attribute("db.query.plan.hash", "abc"),
            Record::metric("db", "q2", 1.0).with_attribute("db.query.plan.hash", "abc"),
        ]);
        sampler.process(&mut batch);

        assert!(batch.len() == 0 || batch.len() == 2);
        assert_eq!(sampler.stats().duplicates, 1);
    }

    #[test]
    fn test_previously_dropped_records_are_removed() {
        let mut config = create_test_config();
        config.default_rate = 100.0;
        let sampler = AdaptiveSampler::new(&config);

        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0),
            Record::metric("db", "q2", 1.0),
        ]);
        batch.records[0].dropped = true;
        let outcome = sampler.process(&mut batch);

        assert_eq!(batch.len(), 1);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config();
        config.persist_path = Some(dir.path().join("sampler.json").display().to_string());

        let sampler = AdaptiveSampler::new(&config);
        let mut batch = Batch::new(vec![
            Record::metric("db", "q1", 1.0),
            Record::metric("db", "q2", 1.0),
        ]);
        sampler.process(&mut batch);
        assert_eq!(sampler.persist().unwrap(), 2);

        let restored = AdaptiveSampler::new(&config);
        assert_eq!(restored.restore(), 2);
        assert_eq!(restored.cached_decision("q1"), sampler.cached_decision("q1"));
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampler.json");
        std::fs::write(&path, "garbage").unwrap();

        let mut config = create_test_config();
        config.persist_path = Some(path.display().to_string());
        let sampler = AdaptiveSampler::new(&config);

        assert_eq!(sampler.restore(), 0);
        assert_eq!(sampler.stats().cache_size, 0);
    }

    fn persisted_sampler(dir: &TempDir) -> Arc<AdaptiveSampler> {
        let mut config = create_test_config();
        config.persist_path = Some(dir.path().join("sampler.json").display().to_string());
        Arc::new(AdaptiveSampler::new(&config))
    }

    fn snapshot_keys(dir: &TempDir) -> Vec<String> {
        let store = SnapshotStore::new(dir.path().join("sampler.json"), Duration::from_secs(3600));
        let mut keys: Vec<String> = store
            .load(Utc::now())
            .unwrap()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_persistence_task_writes_on_each_tick() {
        let dir = TempDir::new().unwrap();
        let sampler = persisted_sampler(&dir);
        sampler.process(&mut Batch::new(vec![Record::metric("db", "q1", 1.0)]));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_persistence_task(
            sampler.clone(),
            Duration::from_millis(20),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(snapshot_keys(&dir), vec!["q1"]);

        tx.send(ShutdownSignal::Graceful).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_task_writes_final_snapshot_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let sampler = persisted_sampler(&dir);

        let (tx, rx) = broadcast::channel(1);
        // long enough that only the shutdown path can write
        let task = tokio::spawn(run_persistence_task(
            sampler.clone(),
            Duration::from_secs(3600),
            rx,
        ));
        tokio::task::yield_now().await;

        sampler.process(&mut Batch::new(vec![
            Record::metric("db", "q1", 1.0),
            Record::metric("db", "q2", 1.0),
        ]));
        assert!(!dir.path().join("sampler.json").exists());

        tx.send(ShutdownSignal::Graceful).unwrap();
        task.await.unwrap();

        assert_eq!(snapshot_keys(&dir), vec!["q1", "q2"]);
    }

    #[tokio::test]
    async fn test_persistence_task_without_path_returns_immediately() {
        let sampler = Arc::new(AdaptiveSampler::new(&create_test_config()));
        let (_tx, rx) = broadcast::channel(1);

        run_persistence_task(sampler, Duration::from_millis(10), rx).await;
    }
}
