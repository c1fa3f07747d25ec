use serde::Serialize;

/// Per-batch verification counters. Emitted as metrics, never attached to records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checked: u64,
    pub missing_required: u64,
    pub pii_redactions: u64,
    pub quality_failures: u64,
    pub cardinality_overflows: u64,
    pub auto_fixes_applied: u64,
}

impl VerificationReport {
    pub fn has_issues(&self) -> bool {
        self.missing_required > 0 || self.quality_failures > 0 || self.cardinality_overflows > 0
    }

    pub fn emit(&self) {
        crate::metrics::record_verification_report(self);
    }
}
