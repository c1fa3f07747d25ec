use anyhow::Result;
use colored::Colorize;
use dbintel_pipeline::config::{self, Config, LoggingConfig};
use dbintel_pipeline::init_tracing;
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration, defaults and environment overrides included
pub fn show(path: Option<&Path>) -> Result<()> {
    init_tracing(&LoggingConfig::default());
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(path)?;

    println!("{}", "Current Configuration:".green().bold());
    println!();

    // Serialize to TOML format
    let toml_string = toml::to_string_pretty(&cfg)?;
    println!("{}", toml_string);

    info!("Configuration displayed successfully");
    Ok(())
}

/// Execute the config validate command
///
/// Validates the configuration file
pub fn validate(path: Option<&Path>) -> Result<()> {
    init_tracing(&LoggingConfig::default());
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = match config::load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}", format!("✗ {}", e).red());
            return Err(e.into());
        }
    };

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    for line in summary_lines(&cfg) {
        println!("  {}", line);
    }

    info!("Configuration validation successful");
    Ok(())
}

/// One line per stage describing what is enabled
fn summary_lines(cfg: &Config) -> Vec<String> {
    let enabled = |on: bool| if on { "enabled" } else { "disabled" };

    vec![
        format!("Listen: {}:{}", cfg.server.host, cfg.server.port),
        format!(
            "Sampler: {}, {} rules, default rate {}%",
            enabled(cfg.sampler.enabled),
            cfg.sampler.rules.len(),
            cfg.sampler.default_rate
        ),
        format!(
            "Circuit Breaker: {}, {} database overrides",
            enabled(cfg.circuit_breaker.enabled),
            cfg.circuit_breaker.databases.len()
        ),
        format!(
            "Plan Extractor: {}, {} derived attributes",
            enabled(cfg.plan_extractor.enabled),
            cfg.plan_extractor.derived_attributes.len()
        ),
        format!(
            "Verification: {}, {} required attributes, {} PII patterns",
            enabled(cfg.verification.enabled),
            cfg.verification.required_attributes.len(),
            cfg.verification.pii_patterns.len()
        ),
        format!(
            "Snapshot: {}",
            cfg.sampler.persist_path.as_deref().unwrap_or("not persisted")
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lines() {
        let mut cfg = Config::default();
        cfg.circuit_breaker.enabled = false;
        cfg.sampler.persist_path = Some("/var/lib/dbintel/sampler.json".to_string());

        let lines = summary_lines(&cfg);

        assert_eq!(lines.len(), 6);
        assert!(lines[0].ends_with(":8470"));
        assert!(lines[2].starts_with("Circuit Breaker: disabled"));
        assert!(lines[4].contains("4 PII patterns"));
        assert!(lines[5].contains("sampler.json"));
    }
}
