//! Per-database circuit breaker stage.
//!
//! Protects monitored databases from collection overload. Each database id
//! owns an independent [`CircuitState`]; records for an open circuit are
//! marked dropped. A process-wide memory check can force every circuit open.

pub mod memory;
pub mod registry;
pub mod state;

use crate::config::CircuitBreakerConfig;
use crate::model::Batch;
use crate::pipeline::{ProcessContext, StageOutcome};
use memory::{MemoryGauge, ProcessMemory};
use registry::{lock, CircuitRegistry};
use state::{CircuitPhase, Transition};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub use registry::CircuitSnapshot;
pub use state::CircuitState;

#[derive(Debug, Default)]
struct MemoryCheck {
    last_checked: Option<Instant>,
    under_pressure: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    registry: Arc<CircuitRegistry>,
    gauge: Box<dyn MemoryGauge>,
    memory: Mutex<MemoryCheck>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_memory_gauge(config, Box::new(ProcessMemory::new()))
    }

    pub fn with_memory_gauge(config: &CircuitBreakerConfig, gauge: Box<dyn MemoryGauge>) -> Self {
        Self {
            config: config.clone(),
            registry: Arc::new(CircuitRegistry::new()),
            gauge,
            memory: Mutex::new(MemoryCheck::default()),
        }
    }

    pub fn registry(&self) -> &Arc<CircuitRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        self.registry.snapshot(Instant::now())
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .under_pressure
    }

    pub fn process(&self, batch: &mut Batch) -> StageOutcome {
        self.process_at(batch, &ProcessContext::now())
    }

    pub fn process_at(&self, batch: &mut Batch, ctx: &ProcessContext) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        if !self.config.enabled {
            return outcome;
        }

        let now = ctx.now;
        let pressure = self.check_memory(now);

        for record in batch.records.iter_mut() {
            if ctx.is_expired() {
                outcome.interrupted = true;
                break;
            }
            outcome.processed += 1;

            if record.dropped || record.database_id.is_empty() {
                continue;
            }

            let settings = self.config.settings_for(&record.database_id);
            let circuit = self
                .registry
                .get_or_create(&record.database_id, settings, now);

            let (admitted, transitions) = {
                let mut state = lock(&circuit);
                if pressure {
                    (false, [state.force_open(now), None])
                } else {
                    let advanced = state.advance(settings, now);
                    let (admitted, admitted_transition) =
                        state.admit(settings, record.error_flag, now);
                    (admitted, [advanced, admitted_transition])
                }
            };

            for transition in transitions.into_iter().flatten() {
                report_transition(&record.database_id, &transition);
            }

            if !admitted {
                record.dropped = true;
                outcome.dropped += 1;
                crate::metrics::record_circuit_dropped(&record.database_id);
            }
        }

        outcome
    }

    /// Sample memory at most once per evaluation interval. Entering pressure
    /// forces every known circuit open.
    fn check_memory(&self, now: Instant) -> bool {
        let Some(limit_mb) = self.config.memory_pressure_limit_mb else {
            return false;
        };

        let mut check = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let due = check.last_checked.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.default.evaluation_interval()
        });
        if !due {
            return check.under_pressure;
        }
        check.last_checked = Some(now);

        let limit_bytes = limit_mb.saturating_mul(1024 * 1024);
        // an unavailable reading never triggers the override
        let pressure = self
            .gauge
            .resident_bytes()
            .map_or(false, |resident| resident > limit_bytes);

        if pressure && !check.under_pressure {
            tracing::warn!(
                limit_mb = limit_mb,
                "🔴 Memory pressure limit exceeded, forcing all circuits open"
            );
            for (database_id, circuit) in self.registry.all() {
                let transition = lock(&circuit).force_open(now);
                if let Some(transition) = transition {
                    report_transition(&database_id, &transition);
                }
            }
        } else if !pressure && check.under_pressure {
            tracing::info!("Memory pressure cleared, circuits recover normally");
        }
        check.under_pressure = pressure;
        crate::metrics::update_memory_pressure(pressure);
        pressure
    }
}

fn report_transition(database_id: &str, transition: &Transition) {
    match transition.to {
        CircuitPhase::Open => tracing::warn!(
            database_id = database_id,
            from = transition.from.as_str(),
            reason = transition.reason.as_str(),
            "🔴 Circuit opened"
        ),
        CircuitPhase::HalfOpen => tracing::info!(
            database_id = database_id,
            reason = transition.reason.as_str(),
            "🟡 Circuit half-open, probing recovery"
        ),
        CircuitPhase::Closed => tracing::info!(
            database_id = database_id,
            reason = transition.reason.as_str(),
            "✅ Circuit closed"
        ),
    }
    crate::metrics::record_circuit_transition(database_id, transition.from, transition.to);
    crate::metrics::update_circuit_phase(database_id, transition.to);
}
