use crate::config::CircuitSettings;
use crate::pipeline::instant_after;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Circuit breaker phase for one database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Records flow normally and feed the window counters
    Closed,
    /// Records are dropped to protect the database
    Open,
    /// A limited number of trial records are let through
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Value exported on the phase gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitPhase,
    pub to: CircuitPhase,
    pub reason: TransitionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    ErrorRate,
    Volume,
    BreakElapsed,
    TrialFailed,
    TrialsSucceeded,
    MemoryPressure,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::Volume => "volume",
            Self::BreakElapsed => "break_elapsed",
            Self::TrialFailed => "trial_failed",
            Self::TrialsSucceeded => "trials_succeeded",
            Self::MemoryPressure => "memory_pressure",
        }
    }
}

/// Per-database circuit state.
///
/// All mutation goes through [`CircuitState::advance`], [`CircuitState::admit`]
/// and [`CircuitState::force_open`]; each takes the current instant so the
/// state machine is driven entirely by its inputs.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub window_errors: u64,
    pub window_total: u64,
    pub window_start: Instant,
    pub opened_at: Option<Instant>,
    pub break_duration: Duration,
    pub half_open_trials_used: u32,
    half_open_successes: u32,
    healthy_intervals: u32,
    pub trips: u64,
}

impl CircuitState {
    pub fn new(settings: &CircuitSettings, now: Instant) -> Self {
        Self {
            phase: CircuitPhase::Closed,
            window_errors: 0,
            window_total: 0,
            window_start: now,
            opened_at: None,
            break_duration: settings.break_duration(),
            half_open_trials_used: 0,
            half_open_successes: 0,
            healthy_intervals: 0,
            trips: 0,
        }
    }

    /// Apply time-driven transitions: roll the closed window (decaying the
    /// break duration after sustained health) and move Open to HalfOpen once
    /// the break has elapsed.
    pub fn advance(&mut self, settings: &CircuitSettings, now: Instant) -> Option<Transition> {
        match self.phase {
            CircuitPhase::Closed => {
                self.roll_window(settings, now);
                None
            }
            CircuitPhase::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now >= instant_after(opened_at, self.break_duration) {
                    self.phase = CircuitPhase::HalfOpen;
                    self.half_open_trials_used = 0;
                    self.half_open_successes = 0;
                    Some(Transition {
                        from: CircuitPhase::Open,
                        to: CircuitPhase::HalfOpen,
                        reason: TransitionReason::BreakElapsed,
                    })
                } else {
                    None
                }
            }
            CircuitPhase::HalfOpen => None,
        }
    }

    /// Decide admission for one record and account for it.
    ///
    /// Returns whether the record is admitted plus any transition it caused.
    pub fn admit(
        &mut self,
        settings: &CircuitSettings,
        error: bool,
        now: Instant,
    ) -> (bool, Option<Transition>) {
        match self.phase {
            CircuitPhase::Open => (false, None),
            CircuitPhase::Closed => {
                self.window_total += 1;
                if error {
                    self.window_errors += 1;
                }
                let transition = self.evaluate_window(settings, now);
                (true, transition)
            }
            CircuitPhase::HalfOpen => {
                if self.half_open_trials_used >= settings.half_open_max_requests {
                    return (false, None);
                }
                self.half_open_trials_used += 1;

                if error {
                    self.break_duration = next_break_duration(self.break_duration, settings);
                    self.trip(now);
                    return (
                        true,
                        Some(Transition {
                            from: CircuitPhase::HalfOpen,
                            to: CircuitPhase::Open,
                            reason: TransitionReason::TrialFailed,
                        }),
                    );
                }

                self.half_open_successes += 1;
                if self.half_open_successes >= settings.half_open_max_requests {
                    self.phase = CircuitPhase::Closed;
                    self.opened_at = None;
                    self.reset_window(now);
                    self.healthy_intervals = 0;
                    return (
                        true,
                        Some(Transition {
                            from: CircuitPhase::HalfOpen,
                            to: CircuitPhase::Closed,
                            reason: TransitionReason::TrialsSucceeded,
                        }),
                    );
                }
                (true, None)
            }
        }
    }

    /// Force the circuit open regardless of its counters
    pub fn force_open(&mut self, now: Instant) -> Option<Transition> {
        if self.phase == CircuitPhase::Open {
            return None;
        }
        let from = self.phase;
        self.trip(now);
        Some(Transition {
            from,
            to: CircuitPhase::Open,
            reason: TransitionReason::MemoryPressure,
        })
    }

    fn evaluate_window(&mut self, settings: &CircuitSettings, now: Instant) -> Option<Transition> {
        let interval_secs = settings.evaluation_interval().as_secs_f64().max(f64::EPSILON);
        let qps = self.window_total as f64 / interval_secs;

        let reason = if qps >= settings.volume_threshold_qps {
            Some(TransitionReason::Volume)
        } else if self.window_total >= settings.min_requests_in_window
            && self.window_total > 0
            && (self.window_errors as f64 / self.window_total as f64) * 100.0
                >= settings.error_threshold_percent
        {
            Some(TransitionReason::ErrorRate)
        } else {
            None
        };

        reason.map(|reason| {
            self.trip(now);
            Transition {
                from: CircuitPhase::Closed,
                to: CircuitPhase::Open,
                reason,
            }
        })
    }

    fn roll_window(&mut self, settings: &CircuitSettings, now: Instant) {
        let interval = settings.evaluation_interval();
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < interval {
            return;
        }

        let intervals = (elapsed.as_secs_f64() / interval.as_secs_f64().max(f64::EPSILON)) as u32;
        self.healthy_intervals = self.healthy_intervals.saturating_add(intervals.max(1));
        self.reset_window(now);

        if self.healthy_intervals >= settings.decay_after_intervals
            && self.break_duration > settings.min_break()
        {
            let previous = self.break_duration;
            self.break_duration = decayed_break_duration(previous, settings);
            self.healthy_intervals = 0;
            tracing::debug!(
                previous_seconds = previous.as_secs_f64(),
                break_seconds = self.break_duration.as_secs_f64(),
                "Break duration decayed after sustained healthy intervals"
            );
        }
    }

    fn trip(&mut self, now: Instant) {
        self.phase = CircuitPhase::Open;
        self.opened_at = Some(now);
        self.half_open_trials_used = 0;
        self.half_open_successes = 0;
        self.healthy_intervals = 0;
        self.trips += 1;
        self.reset_window(now);
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_errors = 0;
        self.window_total = 0;
        self.window_start = now;
    }
}

/// Exponential backoff for a failed recovery, capped at the adaptive maximum
pub fn next_break_duration(current: Duration, settings: &CircuitSettings) -> Duration {
    let grown = current.as_secs_f64().max(1.0) * settings.backoff_multiplier;
    Duration::from_secs_f64(grown.min(settings.max_break().as_secs_f64()))
}

/// One decay step toward the adaptive minimum
pub fn decayed_break_duration(current: Duration, settings: &CircuitSettings) -> Duration {
    let multiplier = settings.backoff_multiplier.max(1.0);
    let shrunk = current.as_secs_f64() / multiplier;
    Duration::from_secs_f64(shrunk.max(settings.min_break().as_secs_f64()))
}
