use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config";
pub const ENV_PREFIX: &str = "DBINTEL";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub plan_extractor: PlanExtractorConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

// ============================================================
// Server / Logging / Pipeline
// ============================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Batches with more records are rejected by the HTTP surface
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_batch_records: default_max_batch_records(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Per-batch processing deadline; stages forward the remainder
    /// unmodified once it passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_deadline_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }
}

// ============================================================
// Adaptive sampler
// ============================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<SamplingRuleConfig>,
    #[serde(default = "default_sampling_rate")]
    pub default_rate: f64,
    #[serde(default = "default_dedup_key_attribute")]
    pub dedup_key_attribute: String,
    #[serde(default = "default_sampler_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_sampler_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_max_decisions_per_second")]
    pub max_decisions_per_second: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<String>,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_seconds: u64,
    #[serde(default = "default_max_snapshot_age")]
    pub max_snapshot_age_seconds: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            default_rate: default_sampling_rate(),
            dedup_key_attribute: default_dedup_key_attribute(),
            cache_size: default_sampler_cache_size(),
            cache_ttl_seconds: default_sampler_cache_ttl(),
            max_decisions_per_second: default_max_decisions_per_second(),
            persist_path: None,
            persist_interval_seconds: default_persist_interval(),
            max_snapshot_age_seconds: default_max_snapshot_age(),
        }
    }
}

impl SamplerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingRuleConfig {
    pub name: String,
    pub condition: String,
    pub rate: f64,
    #[serde(default)]
    pub priority: i32,
    /// Upper bound on new decisions taken under this rule per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_minute: Option<u32>,
}

// ============================================================
// Circuit breaker
// ============================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default: CircuitSettings,
    /// Per-database overrides keyed by database id
    #[serde(default)]
    pub databases: HashMap<String, CircuitSettings>,
    /// Resident memory above which every circuit is forced open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_pressure_limit_mb: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: CircuitSettings::default(),
            databases: HashMap::new(),
            memory_pressure_limit_mb: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings_for(&self, database_id: &str) -> &CircuitSettings {
        self.databases.get(database_id).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitSettings {
    #[serde(default = "default_error_threshold_percent")]
    pub error_threshold_percent: f64,
    #[serde(default = "default_volume_threshold_qps")]
    pub volume_threshold_qps: f64,
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_seconds: u64,
    #[serde(default = "default_break_duration")]
    pub break_duration_seconds: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
    #[serde(default = "default_min_requests_in_window")]
    pub min_requests_in_window: u64,
    #[serde(default)]
    pub adaptive_timeout: AdaptiveTimeoutConfig,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_decay_after_intervals")]
    pub decay_after_intervals: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            error_threshold_percent: default_error_threshold_percent(),
            volume_threshold_qps: default_volume_threshold_qps(),
            evaluation_interval_seconds: default_evaluation_interval(),
            break_duration_seconds: default_break_duration(),
            half_open_max_requests: default_half_open_max_requests(),
            min_requests_in_window: default_min_requests_in_window(),
            adaptive_timeout: AdaptiveTimeoutConfig::default(),
            backoff_multiplier: default_backoff_multiplier(),
            decay_after_intervals: default_decay_after_intervals(),
        }
    }
}

impl CircuitSettings {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_duration_seconds)
    }

    pub fn min_break(&self) -> Duration {
        Duration::from_secs(self.adaptive_timeout.min_seconds)
    }

    pub fn max_break(&self) -> Duration {
        Duration::from_secs(self.adaptive_timeout.max_seconds)
    }
}

/// Bounds for the adaptive break duration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveTimeoutConfig {
    #[serde(default = "default_adaptive_min")]
    pub min_seconds: u64,
    #[serde(default = "default_adaptive_max")]
    pub max_seconds: u64,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_adaptive_min(),
            max_seconds: default_adaptive_max(),
        }
    }
}

// ============================================================
// Plan attribute extractor
// ============================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlanExtractorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_plan_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_plan_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Enabled derived attributes, by short name
    #[serde(default = "default_derived_attributes")]
    pub derived_attributes: Vec<String>,
    #[serde(default)]
    pub complexity: ComplexityWeights,
    /// Milliseconds per plan cost unit, used when the plan carries no
    /// measured execution time
    #[serde(default = "default_cost_to_ms_factor")]
    pub cost_to_ms_factor: f64,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
}

impl Default for PlanExtractorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parse_timeout_ms: default_parse_timeout(),
            max_payload_bytes: default_max_payload_bytes(),
            cache_size: default_plan_cache_size(),
            cache_ttl_seconds: default_plan_cache_ttl(),
            max_depth: default_max_depth(),
            derived_attributes: default_derived_attributes(),
            complexity: ComplexityWeights::default(),
            cost_to_ms_factor: default_cost_to_ms_factor(),
            fingerprint: FingerprintConfig::default(),
        }
    }
}

impl PlanExtractorConfig {
    pub fn parse_timeout(&self) -> Duration {
        Duration::from_millis(self.parse_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComplexityWeights {
    #[serde(default = "default_node_weight")]
    pub node_weight: f64,
    #[serde(default = "default_seq_scan_weight")]
    pub seq_scan_weight: f64,
    #[serde(default = "default_join_weight")]
    pub join_weight: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            node_weight: default_node_weight(),
            seq_scan_weight: default_seq_scan_weight(),
            join_weight: default_join_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FingerprintConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fingerprint_attributes")]
    pub attributes: Vec<String>,
    /// Replace the query text with its normalized form
    #[serde(default)]
    pub anonymize: bool,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attributes: default_fingerprint_attributes(),
            anonymize: false,
        }
    }
}

// ============================================================
// Verification
// ============================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub required_attributes: Vec<String>,
    #[serde(default = "default_pii_patterns")]
    pub pii_patterns: Vec<PiiPatternConfig>,
    #[serde(default = "default_redaction_token")]
    pub redaction_token: String,
    #[serde(default = "default_sensitive_attribute_names")]
    pub sensitive_attribute_names: Vec<String>,
    #[serde(default = "default_true")]
    pub scan_plan_payload: bool,
    #[serde(default)]
    pub expected_types: Vec<ExpectedTypeConfig>,
    #[serde(default)]
    pub cardinality_limits: Vec<CardinalityLimitConfig>,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default = "default_auto_tune_window")]
    pub auto_tune_window_seconds: u64,
    #[serde(default = "default_max_auto_fixes")]
    pub max_auto_fixes_per_window: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_attributes: Vec::new(),
            pii_patterns: default_pii_patterns(),
            redaction_token: default_redaction_token(),
            sensitive_attribute_names: default_sensitive_attribute_names(),
            scan_plan_payload: true,
            expected_types: Vec::new(),
            cardinality_limits: Vec::new(),
            quality: QualityConfig::default(),
            auto_tune_window_seconds: default_auto_tune_window(),
            max_auto_fixes_per_window: default_max_auto_fixes(),
        }
    }
}

impl VerificationConfig {
    pub fn auto_tune_window(&self) -> Duration {
        Duration::from_secs(self.auto_tune_window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PiiPatternConfig {
    pub name: String,
    pub regex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Int,
    Double,
    Bool,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Double => "double",
            Self::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectedTypeConfig {
    pub attribute: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CardinalityLimitConfig {
    pub attribute: String,
    pub max_distinct: usize,
}

/// Quality thresholds and the bounds the auto-tuner may move them within
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QualityConfig {
    #[serde(default = "default_latency_attribute")]
    pub latency_attribute: String,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    #[serde(default = "default_max_latency_ceiling_ms")]
    pub max_latency_ceiling_ms: f64,
    #[serde(default = "default_max_error_rate_percent")]
    pub max_error_rate_percent: f64,
    #[serde(default = "default_max_error_rate_ceiling_percent")]
    pub max_error_rate_ceiling_percent: f64,
    #[serde(default = "default_tuning_step_percent")]
    pub tuning_step_percent: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            latency_attribute: default_latency_attribute(),
            max_latency_ms: default_max_latency_ms(),
            max_latency_ceiling_ms: default_max_latency_ceiling_ms(),
            max_error_rate_percent: default_max_error_rate_percent(),
            max_error_rate_ceiling_percent: default_max_error_rate_ceiling_percent(),
            tuning_step_percent: default_tuning_step_percent(),
        }
    }
}

// ============================================================
// Defaults
// ============================================================

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8470
}

fn default_max_batch_records() -> usize {
    50_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_sampling_rate() -> f64 {
    100.0
}

fn default_dedup_key_attribute() -> String {
    "query_id".to_string()
}

fn default_sampler_cache_size() -> usize {
    10_000
}

fn default_sampler_cache_ttl() -> u64 {
    300
}

fn default_max_decisions_per_second() -> u32 {
    1000
}

fn default_persist_interval() -> u64 {
    60
}

fn default_max_snapshot_age() -> u64 {
    3600
}

fn default_error_threshold_percent() -> f64 {
    50.0
}

fn default_volume_threshold_qps() -> f64 {
    1000.0
}

fn default_evaluation_interval() -> u64 {
    10
}

fn default_break_duration() -> u64 {
    30
}

fn default_half_open_max_requests() -> u32 {
    5
}

fn default_min_requests_in_window() -> u64 {
    10
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_decay_after_intervals() -> u32 {
    3
}

fn default_adaptive_min() -> u64 {
    10
}

fn default_adaptive_max() -> u64 {
    300
}

fn default_parse_timeout() -> u64 {
    100
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_plan_cache_size() -> usize {
    1000
}

fn default_plan_cache_ttl() -> u64 {
    600
}

fn default_max_depth() -> usize {
    64
}

pub fn default_derived_attributes() -> Vec<String> {
    [
        "total_cost",
        "estimated_execution_time",
        "has_sequential_scan",
        "has_nested_loop",
        "index_scan_count",
        "table_access_count",
        "node_count",
        "join_count",
        "depth",
        "plan_complexity_score",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_node_weight() -> f64 {
    1.0
}

fn default_seq_scan_weight() -> f64 {
    2.0
}

fn default_join_weight() -> f64 {
    3.0
}

fn default_cost_to_ms_factor() -> f64 {
    0.01
}

fn default_fingerprint_attributes() -> Vec<String> {
    vec![
        "query_text".to_string(),
        "db.statement".to_string(),
        "db.query".to_string(),
    ]
}

fn default_pii_patterns() -> Vec<PiiPatternConfig> {
    [
        ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
        ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
        ("credit_card", r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"),
        ("phone", r"\b\d{3}[\s.-]?\d{3}[\s.-]?\d{4}\b"),
    ]
    .iter()
    .map(|(name, regex)| PiiPatternConfig {
        name: name.to_string(),
        regex: regex.to_string(),
    })
    .collect()
}

fn default_redaction_token() -> String {
    "[REDACTED]".to_string()
}

fn default_sensitive_attribute_names() -> Vec<String> {
    ["password", "secret", "token", "ssn", "credit_card"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_latency_attribute() -> String {
    "duration_ms".to_string()
}

fn default_max_latency_ms() -> f64 {
    10_000.0
}

fn default_max_latency_ceiling_ms() -> f64 {
    60_000.0
}

fn default_max_error_rate_percent() -> f64 {
    20.0
}

fn default_max_error_rate_ceiling_percent() -> f64 {
    50.0
}

fn default_tuning_step_percent() -> f64 {
    25.0
}

fn default_auto_tune_window() -> u64 {
    300
}

fn default_max_auto_fixes() -> u32 {
    2
}

// ============================================================
// Loading & Validation
// ============================================================

/// Load configuration from `path` (or `./config.toml`), overlaid with
/// `DBINTEL__SECTION__KEY` environment variables, then validate it.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let file = match path {
        Some(path) => config::File::from(path),
        None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let config = config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let cfg: Config = config
        .try_deserialize()
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    validate_config(&cfg)?;

    Ok(cfg)
}

/// Parse and validate configuration from TOML text
pub fn load_config_from_str(toml_text: &str) -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(toml_text, config::FileFormat::Toml))
        .build()
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let cfg: Config = config
        .try_deserialize()
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    validate_config(&cfg)?;

    Ok(cfg)
}

macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err(PipelineError::Config(format!($($arg)*)))
    };
}

/// Upper bound for every configured duration (ten years)
pub const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 3600;

fn validate_duration_seconds(field: &str, seconds: u64) -> Result<()> {
    if seconds > MAX_DURATION_SECONDS {
        bail_config!(
            "{} must not exceed {} seconds, got {}",
            field,
            MAX_DURATION_SECONDS,
            seconds
        );
    }
    Ok(())
}

fn validate_duration_ms(field: &str, millis: u64) -> Result<()> {
    validate_duration_seconds(field, millis / 1000)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.server.max_batch_records == 0 {
        bail_config!("server.max_batch_records must be greater than 0");
    }

    if cfg.logging.level.parse::<tracing::Level>().is_err() {
        bail_config!("logging.level '{}' is not a valid level", cfg.logging.level);
    }

    if let Some(deadline_ms) = cfg.pipeline.batch_deadline_ms {
        if deadline_ms == 0 {
            bail_config!("pipeline.batch_deadline_ms must be greater than 0 when set");
        }
        validate_duration_ms("pipeline.batch_deadline_ms", deadline_ms)?;
    }

    validate_sampler(&cfg.sampler)?;

    validate_circuit_settings("default", &cfg.circuit_breaker.default)?;
    for (database_id, settings) in &cfg.circuit_breaker.databases {
        validate_circuit_settings(database_id, settings)?;
    }
    if cfg.circuit_breaker.memory_pressure_limit_mb == Some(0) {
        bail_config!("circuit_breaker.memory_pressure_limit_mb must be greater than 0 when set");
    }

    validate_plan_extractor(&cfg.plan_extractor)?;
    validate_verification(&cfg.verification)?;

    Ok(())
}

fn validate_rate(field: &str, rate: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&rate) {
        bail_config!("{} must be within 0..=100, got {}", field, rate);
    }
    Ok(())
}

fn validate_sampler(cfg: &SamplerConfig) -> Result<()> {
    validate_rate("sampler.default_rate", cfg.default_rate)?;

    if cfg.dedup_key_attribute.is_empty() {
        bail_config!("sampler.dedup_key_attribute cannot be empty");
    }
    if cfg.cache_size == 0 {
        bail_config!("sampler.cache_size must be greater than 0");
    }
    if cfg.max_decisions_per_second == 0 {
        bail_config!("sampler.max_decisions_per_second must be greater than 0");
    }
    if cfg.persist_path.is_some() && cfg.persist_interval_seconds == 0 {
        bail_config!("sampler.persist_interval_seconds must be greater than 0");
    }
    validate_duration_seconds("sampler.cache_ttl_seconds", cfg.cache_ttl_seconds)?;
    validate_duration_seconds("sampler.persist_interval_seconds", cfg.persist_interval_seconds)?;
    validate_duration_seconds("sampler.max_snapshot_age_seconds", cfg.max_snapshot_age_seconds)?;

    let mut names = HashSet::new();
    for rule in &cfg.rules {
        if rule.name.is_empty() {
            bail_config!("sampler rule name cannot be empty");
        }
        if !names.insert(rule.name.as_str()) {
            bail_config!("Duplicate sampler rule name: {}", rule.name);
        }
        validate_rate(&format!("sampler rule '{}' rate", rule.name), rule.rate)?;
        if rule.max_per_minute == Some(0) {
            bail_config!("sampler rule '{}' max_per_minute must be greater than 0", rule.name);
        }
        // malformed conditions disable the rule at sampler construction
    }

    Ok(())
}

fn validate_circuit_settings(name: &str, settings: &CircuitSettings) -> Result<()> {
    if !(0.0..=100.0).contains(&settings.error_threshold_percent)
        || settings.error_threshold_percent == 0.0
    {
        bail_config!(
            "circuit_breaker '{}' error_threshold_percent must be within (0, 100]",
            name
        );
    }
    if settings.volume_threshold_qps <= 0.0 {
        bail_config!("circuit_breaker '{}' volume_threshold_qps must be positive", name);
    }
    if settings.evaluation_interval_seconds == 0 {
        bail_config!("circuit_breaker '{}' evaluation_interval_seconds must be > 0", name);
    }
    if settings.half_open_max_requests == 0 {
        bail_config!("circuit_breaker '{}' half_open_max_requests must be > 0", name);
    }
    validate_duration_seconds(
        &format!("circuit_breaker '{}' evaluation_interval_seconds", name),
        settings.evaluation_interval_seconds,
    )?;
    validate_duration_seconds(
        &format!("circuit_breaker '{}' adaptive_timeout.max_seconds", name),
        settings.adaptive_timeout.max_seconds,
    )?;
    if settings.adaptive_timeout.min_seconds > settings.adaptive_timeout.max_seconds {
        bail_config!(
            "circuit_breaker '{}' adaptive_timeout.min_seconds ({}) exceeds max_seconds ({})",
            name,
            settings.adaptive_timeout.min_seconds,
            settings.adaptive_timeout.max_seconds
        );
    }
    if settings.break_duration_seconds < settings.adaptive_timeout.min_seconds
        || settings.break_duration_seconds > settings.adaptive_timeout.max_seconds
    {
        bail_config!(
            "circuit_breaker '{}' break_duration_seconds must lie within adaptive_timeout bounds",
            name
        );
    }
    if !settings.backoff_multiplier.is_finite() || settings.backoff_multiplier < 1.0 {
        bail_config!("circuit_breaker '{}' backoff_multiplier must be >= 1.0", name);
    }
    Ok(())
}

fn validate_plan_extractor(cfg: &PlanExtractorConfig) -> Result<()> {
    if cfg.max_payload_bytes == 0 {
        bail_config!("plan_extractor.max_payload_bytes must be greater than 0");
    }
    if cfg.cache_size == 0 {
        bail_config!("plan_extractor.cache_size must be greater than 0");
    }
    if cfg.max_depth == 0 {
        bail_config!("plan_extractor.max_depth must be greater than 0");
    }
    validate_duration_ms("plan_extractor.parse_timeout_ms", cfg.parse_timeout_ms)?;
    validate_duration_seconds("plan_extractor.cache_ttl_seconds", cfg.cache_ttl_seconds)?;
    if cfg.cost_to_ms_factor < 0.0 {
        bail_config!("plan_extractor.cost_to_ms_factor cannot be negative");
    }

    let known = default_derived_attributes();
    for name in &cfg.derived_attributes {
        if !known.contains(name) {
            bail_config!("Unknown plan derived attribute: {}", name);
        }
    }

    let weights = &cfg.complexity;
    if weights.node_weight < 0.0 || weights.seq_scan_weight < 0.0 || weights.join_weight < 0.0 {
        bail_config!("plan_extractor.complexity weights cannot be negative");
    }
    Ok(())
}

fn validate_verification(cfg: &VerificationConfig) -> Result<()> {
    for pattern in &cfg.pii_patterns {
        if let Err(e) = regex::Regex::new(&pattern.regex) {
            bail_config!("PII pattern '{}' does not compile: {}", pattern.name, e);
        }
    }
    if cfg.redaction_token.is_empty() {
        bail_config!("verification.redaction_token cannot be empty");
    }
    for limit in &cfg.cardinality_limits {
        if limit.max_distinct == 0 {
            bail_config!("cardinality limit for '{}' must be greater than 0", limit.attribute);
        }
    }

    let quality = &cfg.quality;
    if quality.max_latency_ms <= 0.0 || quality.max_latency_ms > quality.max_latency_ceiling_ms {
        bail_config!("verification.quality.max_latency_ms must be positive and not exceed its ceiling");
    }
    if quality.max_error_rate_percent <= 0.0
        || quality.max_error_rate_percent > quality.max_error_rate_ceiling_percent
        || quality.max_error_rate_ceiling_percent > 100.0
    {
        bail_config!("verification.quality error rate thresholds must satisfy 0 < max <= ceiling <= 100");
    }
    if quality.tuning_step_percent <= 0.0 {
        bail_config!("verification.quality.tuning_step_percent must be positive");
    }
    if cfg.auto_tune_window_seconds == 0 {
        bail_config!("verification.auto_tune_window_seconds must be greater than 0");
    }
    validate_duration_seconds("verification.auto_tune_window_seconds", cfg.auto_tune_window_seconds)?;
    Ok(())
}
