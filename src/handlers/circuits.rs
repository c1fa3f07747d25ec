use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::circuit_breaker::CircuitSnapshot;
use crate::handlers::AppState;

#[derive(Debug, Serialize)]
pub struct CircuitsResponse {
    pub memory_pressure: bool,
    pub total: usize,
    pub circuits: Vec<CircuitSnapshot>,
}

/// GET /v1/circuits - Phase and window counters of every known circuit
pub async fn list_circuits(State(state): State<AppState>) -> Json<CircuitsResponse> {
    let breaker = state.pipeline.circuit_breaker();
    let circuits = breaker.snapshot();

    Json(CircuitsResponse {
        memory_pressure: breaker.under_memory_pressure(),
        total: circuits.len(),
        circuits,
    })
}
