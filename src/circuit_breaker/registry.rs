use super::state::{CircuitPhase, CircuitState};
use crate::config::CircuitSettings;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Concurrency-safe map of database id to circuit state.
///
/// The map itself is sharded; each circuit sits behind its own mutex so
/// updates for one database never wait on another.
#[derive(Default)]
pub struct CircuitRegistry {
    circuits: DashMap<String, Arc<Mutex<CircuitState>>>,
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub database_id: String,
    pub phase: CircuitPhase,
    pub window_errors: u64,
    pub window_total: u64,
    pub break_duration_seconds: f64,
    pub half_open_trials_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_seconds: Option<f64>,
    pub trips: u64,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Circuit for `database_id`, created Closed on first use
    pub fn get_or_create(
        &self,
        database_id: &str,
        settings: &CircuitSettings,
        now: Instant,
    ) -> Arc<Mutex<CircuitState>> {
        if let Some(existing) = self.circuits.get(database_id) {
            return existing.value().clone();
        }
        self.circuits
            .entry(database_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new(settings, now))))
            .value()
            .clone()
    }

    pub fn get(&self, database_id: &str) -> Option<Arc<Mutex<CircuitState>>> {
        self.circuits.get(database_id).map(|entry| entry.value().clone())
    }

    pub fn phase(&self, database_id: &str) -> Option<CircuitPhase> {
        self.get(database_id).map(|circuit| lock(&circuit).phase)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Handles to every circuit, for operations spanning all databases
    pub fn all(&self) -> Vec<(String, Arc<Mutex<CircuitState>>)> {
        self.circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .all()
            .into_iter()
            .map(|(database_id, circuit)| {
                let state = lock(&circuit);
                CircuitSnapshot {
                    database_id,
                    phase: state.phase,
                    window_errors: state.window_errors,
                    window_total: state.window_total,
                    break_duration_seconds: state.break_duration.as_secs_f64(),
                    half_open_trials_used: state.half_open_trials_used,
                    open_for_seconds: match state.phase {
                        CircuitPhase::Open => state
                            .opened_at
                            .map(|at| now.saturating_duration_since(at).as_secs_f64()),
                        _ => None,
                    },
                    trips: state.trips,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.database_id.cmp(&b.database_id));
        snapshots
    }
}

pub(crate) fn lock(circuit: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}
