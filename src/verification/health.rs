//! Rolling quality statistics and bounded threshold auto-tuning.
//!
//! Statistics accumulate over a window of `auto_tune_window` length. When a
//! window closes, [`tune`] runs exactly once against it. The only state it
//! changes is the threshold pair it returns.

use crate::config::QualityConfig;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub max_latency_ms: f64,
    pub max_error_rate_percent: f64,
}

impl Thresholds {
    pub fn base(quality: &QualityConfig) -> Self {
        Self {
            max_latency_ms: quality.max_latency_ms,
            max_error_rate_percent: quality.max_error_rate_percent,
        }
    }
}

/// Range the tuner may move thresholds within
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningBounds {
    pub base: Thresholds,
    pub ceiling: Thresholds,
    pub step_percent: f64,
}

impl TuningBounds {
    pub fn from_config(quality: &QualityConfig) -> Self {
        Self {
            base: Thresholds::base(quality),
            ceiling: Thresholds {
                max_latency_ms: quality.max_latency_ceiling_ms,
                max_error_rate_percent: quality.max_error_rate_ceiling_percent,
            },
            step_percent: quality.tuning_step_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub records: u64,
    pub errors: u64,
    pub latency_samples: u64,
    pub latency_sum_ms: f64,
    pub latency_max_ms: f64,
}

impl WindowStats {
    pub fn observe(&mut self, error: bool, latency_ms: Option<f64>) {
        self.records += 1;
        if error {
            self.errors += 1;
        }
        if let Some(latency) = latency_ms {
            self.latency_samples += 1;
            self.latency_sum_ms += latency;
            self.latency_max_ms = self.latency_max_ms.max(latency);
        }
    }

    pub fn merge(&mut self, other: &WindowStats) {
        self.records += other.records;
        self.errors += other.errors;
        self.latency_samples += other.latency_samples;
        self.latency_sum_ms += other.latency_sum_ms;
        self.latency_max_ms = self.latency_max_ms.max(other.latency_max_ms);
    }

    pub fn error_rate_percent(&self) -> Option<f64> {
        (self.records > 0).then(|| self.errors as f64 * 100.0 / self.records as f64)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        (self.latency_samples > 0).then(|| self.latency_sum_ms / self.latency_samples as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    ErrorRate,
    Latency,
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::Latency => "latency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Adjustment {
    pub threshold: ThresholdKind,
    pub from: f64,
    pub to: f64,
}

/// One tuning step over a closed window.
///
/// A statistic above its threshold loosens the threshold by `step_percent`,
/// capped at the ceiling. A statistic below half its threshold tightens it by
/// the same step, floored at the base. No more than `budget` adjustments are
/// made.
pub fn tune(
    thresholds: Thresholds,
    stats: &WindowStats,
    bounds: &TuningBounds,
    budget: u32,
) -> (Thresholds, Vec<Adjustment>) {
    let mut tuned = thresholds;
    let mut adjustments = Vec::new();

    let candidates = [
        (
            ThresholdKind::ErrorRate,
            stats.error_rate_percent(),
            thresholds.max_error_rate_percent,
            bounds.base.max_error_rate_percent,
            bounds.ceiling.max_error_rate_percent,
        ),
        (
            ThresholdKind::Latency,
            stats.mean_latency_ms(),
            thresholds.max_latency_ms,
            bounds.base.max_latency_ms,
            bounds.ceiling.max_latency_ms,
        ),
    ];

    for (kind, statistic, current, base, ceiling) in candidates {
        if adjustments.len() as u32 >= budget {
            break;
        }
        let Some(statistic) = statistic else {
            continue;
        };

        let step = current * bounds.step_percent / 100.0;
        let next = if statistic > current && current < ceiling {
            (current + step).min(ceiling)
        } else if statistic < current / 2.0 && current > base {
            (current - step).max(base)
        } else {
            continue;
        };

        match kind {
            ThresholdKind::ErrorRate => tuned.max_error_rate_percent = next,
            ThresholdKind::Latency => tuned.max_latency_ms = next,
        }
        adjustments.push(Adjustment {
            threshold: kind,
            from: current,
            to: next,
        });
    }

    (tuned, adjustments)
}

/// Current window plus the last closed one
#[derive(Debug)]
pub struct HealthWindow {
    pub started: Instant,
    pub current: WindowStats,
    pub last_closed: Option<WindowStats>,
}

impl HealthWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            current: WindowStats::default(),
            last_closed: None,
        }
    }

    /// Close the window and start a new one at `now`, returning the closed stats
    pub fn roll(&mut self, now: Instant) -> WindowStats {
        let closed = std::mem::take(&mut self.current);
        self.last_closed = Some(closed);
        self.started = now;
        closed
    }

    /// Statistics health is judged on
    pub fn reference(&self) -> WindowStats {
        match self.last_closed {
            Some(closed) if self.current.records == 0 => closed,
            _ => self.current,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub window_records: u64,
    pub error_rate_percent: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub thresholds: Thresholds,
}
