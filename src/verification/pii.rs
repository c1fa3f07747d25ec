use crate::config::VerificationConfig;
use crate::error::{PipelineError, Result};
use crate::model::{AttributeValue, Record};
use crate::plan::{FINGERPRINT_ATTRIBUTE, PLAN_HASH_ATTRIBUTE};
use regex::Regex;

// attributes written by earlier stages, never user text
const DERIVED_ATTRIBUTES: &[&str] = &[PLAN_HASH_ATTRIBUTE, FINGERPRINT_ATTRIBUTE];

struct PiiPattern {
    name: String,
    regex: Regex,
}

/// Replaces personally identifying substrings with a fixed token
pub struct PiiRedactor {
    patterns: Vec<PiiPattern>,
    token: String,
    sensitive_names: Vec<String>,
    scan_plan_payload: bool,
}

impl PiiRedactor {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        let patterns = config
            .pii_patterns
            .iter()
            .map(|p| {
                Regex::new(&p.regex)
                    .map(|regex| PiiPattern {
                        name: p.name.clone(),
                        regex,
                    })
                    .map_err(|e| {
                        PipelineError::Config(format!("Invalid PII pattern '{}': {}", p.name, e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            token: config.redaction_token.clone(),
            sensitive_names: config
                .sensitive_attribute_names
                .iter()
                .map(|n| n.to_lowercase())
                .collect(),
            scan_plan_payload: config.scan_plan_payload,
        })
    }

    pub fn pattern_names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.name.as_str())
    }

    pub fn is_sensitive_name(&self, attribute: &str) -> bool {
        let lowered = attribute.to_lowercase();
        self.sensitive_names.iter().any(|n| lowered.contains(n.as_str()))
    }

    /// Redacted copy of `text` and the number of matches replaced, or `None`
    /// when nothing matched.
    pub fn redact_text(&self, text: &str) -> Option<(String, usize)> {
        let mut current = std::borrow::Cow::Borrowed(text);
        let mut matches = 0;

        for pattern in &self.patterns {
            let found = pattern.regex.find_iter(&current).count();
            if found == 0 {
                continue;
            }
            matches += found;
            current = std::borrow::Cow::Owned(
                pattern
                    .regex
                    .replace_all(&current, self.token.as_str())
                    .into_owned(),
            );
        }

        (matches > 0).then(|| (current.into_owned(), matches))
    }

    /// Redact every string attribute of `record` in place, returning the
    /// number of redactions made.
    pub fn redact_record(&self, record: &mut Record) -> usize {
        let mut redactions = 0;

        for (name, value) in record.attributes.iter_mut() {
            if DERIVED_ATTRIBUTES.contains(&name.as_str()) {
                continue;
            }

            if self.is_sensitive_name(name) {
                if value.as_str() != Some(self.token.as_str()) {
                    *value = AttributeValue::Str(self.token.clone());
                    redactions += 1;
                }
                continue;
            }

            if let AttributeValue::Str(text) = value {
                if let Some((redacted, count)) = self.redact_text(text) {
                    *text = redacted;
                    redactions += count;
                }
            }
        }

        if self.scan_plan_payload {
            if let Some(plan) = record.raw_plan.as_mut() {
                if let Some((redacted, count)) = self.redact_text(&plan.payload) {
                    plan.payload = redacted;
                    redactions += count;
                }
            }
        }

        redactions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanEngine;

    fn redactor() -> PiiRedactor {
        PiiRedactor::new(&VerificationConfig::default()).unwrap()
    }

    #[test]
    fn test_redact_email() {
        let (text, count) = redactor()
            .redact_text("SELECT * FROM users WHERE email = 'user@example.com'")
            .unwrap();
        assert_eq!(text, "SELECT * FROM users WHERE email = '[REDACTED]'");
        assert_eq!(count, 1);
        assert!(!text.contains('@'));
    }

    #[test]
    fn test_redact_multiple_patterns() {
        let (text, count) = redactor()
            .redact_text("ssn 123-45-6789 card 4111 1111 1111 1111 mail a@b.io")
            .unwrap();
        assert_eq!(count, 3);
        assert!(!text.contains("6789"));
        assert!(!text.contains("4111"));
    }

    #[test]
    fn test_clean_text_untouched() {
        assert!(redactor().redact_text("SELECT 1").is_none());
    }

    #[test]
    fn test_sensitive_names_case_insensitive() {
        let r = redactor();
        assert!(r.is_sensitive_name("db.user.Password"));
        assert!(r.is_sensitive_name("API_TOKEN"));
        assert!(!r.is_sensitive_name("query_text"));
    }

    #[test]
    fn test_redact_record() {
        let mut record = Record::metric("db1", "q1", 1.0)
            .with_attribute("query_text", "WHERE mail = 'x@y.com'")
            .with_attribute("auth_token", "abc123")
            .with_attribute("calls", 3i64)
            .with_plan(PlanEngine::Postgres, r#"{"Filter": "(email = 'z@w.org')"}"#);

        let redactions = redactor().redact_record(&mut record);

        assert_eq!(redactions, 3);
        assert_eq!(record.attribute("auth_token").and_then(|v| v.as_str()), Some("[REDACTED]"));
        assert_eq!(record.attribute("calls"), Some(&AttributeValue::Int(3)));
        assert!(!record.raw_plan.as_ref().unwrap().payload.contains("z@w.org"));

        // second pass finds nothing new
        assert_eq!(redactor().redact_record(&mut record), 0);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut config = VerificationConfig::default();
        config.pii_patterns[0].regex = "([".to_string();
        assert!(matches!(
            PiiRedactor::new(&config),
            Err(PipelineError::Config(_))
        ));
    }
}
