use dbintel_pipeline::config::{load_config, load_config_from_str, LogFormat, ValueType};
use dbintel_pipeline::error::PipelineError;
use std::io::Write;

#[test]
fn test_example_config_loads() -> anyhow::Result<()> {
    let config = load_config_from_str(include_str!("../config.example.toml"))?;

    assert_eq!(config.server.port, 8470);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.pipeline.batch_deadline_ms, Some(2000));

    assert_eq!(config.sampler.rules.len(), 3);
    assert_eq!(config.sampler.rules[1].max_per_minute, Some(600));
    assert_eq!(config.sampler.default_rate, 25.0);

    let replica = config.circuit_breaker.settings_for("reporting-replica");
    assert_eq!(replica.error_threshold_percent, 80.0);
    assert_eq!(replica.break_duration_seconds, 60);
    // fields not overridden fall back to their defaults, not to [default]
    assert_eq!(replica.half_open_max_requests, 5);
    let other = config.circuit_breaker.settings_for("orders");
    assert_eq!(other.volume_threshold_qps, 1000.0);

    assert_eq!(config.plan_extractor.derived_attributes.len(), 7);
    assert_eq!(config.verification.pii_patterns.len(), 2);
    assert_eq!(config.verification.expected_types[1].value_type, ValueType::Double);
    assert_eq!(config.verification.quality.latency_attribute, "mean_exec_time_ms");

    Ok(())
}

#[test]
fn test_empty_config_uses_defaults() -> anyhow::Result<()> {
    let config = load_config_from_str("")?;

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.sampler.default_rate, 100.0);
    assert_eq!(config.sampler.dedup_key_attribute, "query_id");
    assert_eq!(config.circuit_breaker.default.error_threshold_percent, 50.0);
    assert_eq!(config.plan_extractor.parse_timeout_ms, 100);
    assert_eq!(config.verification.redaction_token, "[REDACTED]");
    assert!(config.pipeline.batch_deadline_ms.is_none());

    Ok(())
}

#[test]
fn test_unknown_keys_are_rejected() {
    let result = load_config_from_str(
        r#"
        [sampler]
        default_rate = 50
        sample_everything = true
        "#,
    );
    assert!(matches!(result, Err(PipelineError::Config(_))));

    let result = load_config_from_str("[exporter]\nendpoint = \"x\"\n");
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_invalid_values_are_fatal() {
    let cases = [
        "[sampler]\ndefault_rate = 120\n",
        "[plan_extractor]\nderived_attributes = [\"vibes\"]\n",
        "[[verification.pii_patterns]]\nname = \"broken\"\nregex = \"([\"\n",
        "[circuit_breaker.default]\nadaptive_timeout = { min_seconds = 60, max_seconds = 10 }\n",
        "[logging]\nlevel = \"loud\"\n",
    ];

    for case in cases {
        let result = load_config_from_str(case);
        assert!(
            matches!(result, Err(PipelineError::Config(_))),
            "expected config error for {:?}",
            case
        );
    }
}

#[test]
fn test_malformed_rule_condition_is_not_fatal() -> anyhow::Result<()> {
    let config = load_config_from_str(
        r#"
        [[sampler.rules]]
        name = "broken"
        condition = "value >>> 3"
        rate = 10
        "#,
    )?;

    let sampler = dbintel_pipeline::sampler::AdaptiveSampler::new(&config.sampler);
    assert_eq!(sampler.disabled_rules(), vec!["broken"]);
    Ok(())
}

#[test]
fn test_load_config_from_file() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    writeln!(file, "[server]\nport = 9100\n\n[logging]\nformat = \"pretty\"")?;

    let config = load_config(Some(file.path()))?;

    assert_eq!(config.server.port, 9100);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    Ok(())
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let result = load_config(Some(std::path::Path::new("/nonexistent/dbintel.toml")));
    assert!(result.is_err());
}
