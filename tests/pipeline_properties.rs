/// End-to-end behavioural properties of the processing stages
use dbintel_pipeline::{
    circuit_breaker::{state::CircuitPhase, CircuitBreaker},
    config::{CircuitBreakerConfig, CircuitSettings, Config, PlanExtractorConfig, SamplerConfig},
    model::{AttributeValue, Batch, PlanEngine, Record},
    pipeline::{Pipeline, ProcessContext},
    plan::PlanAttributeExtractor,
    sampler::{AdaptiveSampler, SAMPLING_SKIPPED_ATTRIBUTE},
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn ctx(now: Instant) -> ProcessContext {
    ProcessContext {
        now,
        deadline: None,
    }
}

fn circuit_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        default: CircuitSettings {
            error_threshold_percent: 50.0,
            evaluation_interval_seconds: 10,
            break_duration_seconds: 30,
            min_requests_in_window: 10,
            ..CircuitSettings::default()
        },
        ..CircuitBreakerConfig::default()
    }
}

fn ten_records_five_errors(database_id: &str) -> Batch {
    Batch::new(
        (0..10)
            .map(|i| Record::metric(database_id, &format!("q{}", i), 1.0).with_error(i >= 5))
            .collect(),
    )
}

#[test]
fn test_sampling_is_sticky_per_dedup_key() {
    let sampler = AdaptiveSampler::new(&SamplerConfig {
        default_rate: 50.0,
        ..SamplerConfig::default()
    });
    let now = Instant::now();

    let batch_of = || {
        Batch::new(
            (0..40)
                .map(|i| Record::metric("db1", &format!("query-{}", i % 20), 1.0))
                .collect(),
        )
    };

    let mut first = batch_of();
    sampler.process_at(&mut first, &ctx(now));
    let mut second = batch_of();
    sampler.process_at(&mut second, &ctx(now + Duration::from_secs(5)));

    // every key survives either both times it appears in a batch or not at all
    let mut kept: HashMap<String, usize> = HashMap::new();
    for record in first.records.iter().chain(second.records.iter()) {
        *kept.entry(record.query_id.clone()).or_default() += 1;
    }
    assert!(kept.values().all(|count| *count == 4));

    let first_keys: Vec<_> = first.records.iter().map(|r| r.query_id.clone()).collect();
    let second_keys: Vec<_> = second.records.iter().map(|r| r.query_id.clone()).collect();
    assert_eq!(first_keys, second_keys);
}

#[test]
fn test_error_threshold_trips_exactly_once() {
    let breaker = CircuitBreaker::new(&circuit_config());
    let now = Instant::now();

    let mut batch = ten_records_five_errors("orders-db");
    let outcome = breaker.process_at(&mut batch, &ctx(now));

    assert_eq!(outcome.dropped, 0);
    let circuit = breaker.registry().get("orders-db").unwrap();
    let state = circuit.lock().unwrap();
    assert_eq!(state.phase, CircuitPhase::Open);
    assert_eq!(state.trips, 1);
}

#[test]
fn test_break_elapsed_moves_to_half_open_before_admission() {
    let breaker = CircuitBreaker::new(&circuit_config());
    let start = Instant::now();

    breaker.process_at(&mut ten_records_five_errors("orders-db"), &ctx(start));
    assert_eq!(breaker.registry().phase("orders-db"), Some(CircuitPhase::Open));

    // still inside the break: dropped
    let mut early = Batch::new(vec![Record::metric("orders-db", "q", 1.0)]);
    let outcome = breaker.process_at(&mut early, &ctx(start + Duration::from_secs(10)));
    assert_eq!(outcome.dropped, 1);

    let mut trial = Batch::new(vec![Record::metric("orders-db", "q", 1.0)]);
    let outcome = breaker.process_at(&mut trial, &ctx(start + Duration::from_secs(30)));
    assert_eq!(outcome.dropped, 0);
    assert!(!trial.records[0].dropped);
    assert_eq!(breaker.registry().phase("orders-db"), Some(CircuitPhase::HalfOpen));
}

#[test]
fn test_literal_variants_share_one_parse() {
    let extractor = PlanAttributeExtractor::new(&PlanExtractorConfig::default());
    let plan = |limit: i64| {
        json!([{"Plan": {
            "Node Type": "Limit",
            "Plan Rows": limit,
            "Plans": [{"Node Type": "Index Scan", "Relation Name": "events",
                       "Index Cond": format!("(id > {})", limit)}]
        }}])
        .to_string()
    };

    let mut batch = Batch::new(
        [10, 20, 30]
            .into_iter()
            .map(|limit| Record::metric("db1", "q", 1.0).with_plan(PlanEngine::Postgres, plan(limit)))
            .collect(),
    );
    extractor.process(&mut batch);

    let stats = extractor.stats();
    assert_eq!(stats.parse_invocations, 1);
    assert_eq!(stats.cache_hits, 2);
    assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_pii_is_redacted_end_to_end() {
    let pipeline = Pipeline::new(&Config::default()).unwrap();
    let batch = Batch::new(vec![Record::metric("db1", "q1", 1.0).with_attribute(
        "query_text",
        "SELECT id FROM accounts WHERE email = 'user@example.com'",
    )]);

    let outcome = pipeline.process(batch);

    let text = outcome.batch.records[0]
        .attribute("query_text")
        .and_then(AttributeValue::as_str)
        .unwrap()
        .to_string();
    assert!(!text.contains('@'));
    assert!(outcome.report.pii_redactions >= 1);
}

#[test]
fn test_rate_limited_decisions_fail_open() {
    let sampler = AdaptiveSampler::new(&SamplerConfig {
        default_rate: 0.0,
        max_decisions_per_second: 2,
        ..SamplerConfig::default()
    });
    let mut batch = Batch::new(
        (0..10)
            .map(|i| Record::metric("db1", &format!("q{}", i), 1.0))
            .collect(),
    );

    let outcome = sampler.process_at(&mut batch, &ctx(Instant::now()));

    // two decisions were taken (rate 0, dropped), the rest kept untouched
    assert_eq!(outcome.dropped, 2);
    assert_eq!(batch.len(), 8);
    assert!(batch.records.iter().all(|r| {
        r.attribute(SAMPLING_SKIPPED_ATTRIBUTE).and_then(AttributeValue::as_str)
            == Some("rate_limited")
    }));
    assert_eq!(sampler.stats().rate_limited, 8);
}

#[test]
fn test_concurrent_batches_share_decisions_and_isolate_circuits() {
    let config = Config {
        sampler: SamplerConfig {
            default_rate: 50.0,
            ..SamplerConfig::default()
        },
        circuit_breaker: circuit_config(),
        ..Config::default()
    };
    let pipeline = Arc::new(Pipeline::new(&config).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                if worker == 0 {
                    pipeline.process(ten_records_five_errors("failing-db"));
                }

                let database_id = format!("db-{}", worker);
                let mut kept_sets = Vec::new();
                for _ in 0..5 {
                    let batch = Batch::new(
                        (0..20)
                            .map(|i| Record::metric(&database_id, &format!("shared-{}", i), 1.0))
                            .collect(),
                    );
                    let outcome = pipeline.process(batch);
                    assert_eq!(outcome.stats.circuit_dropped, 0);
                    let kept: BTreeSet<String> =
                        outcome.batch.records.into_iter().map(|r| r.query_id).collect();
                    kept_sets.push(kept);
                }
                kept_sets
            })
        })
        .collect();

    let kept_sets: Vec<BTreeSet<String>> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    // one decision per dedup key, whichever thread made it first
    assert!(kept_sets.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(!kept_sets[0].is_empty() && kept_sets[0].len() < 20);

    let registry = pipeline.circuit_breaker().registry();
    assert_eq!(registry.phase("failing-db"), Some(CircuitPhase::Open));
    for worker in 0..4 {
        assert_eq!(
            registry.phase(&format!("db-{}", worker)),
            Some(CircuitPhase::Closed)
        );
    }
}
