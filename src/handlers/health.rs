use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::handlers::AppState;

/// Health check endpoint
///
/// Always 200 while the process serves requests; `status` reports whether
/// the verification window is within its error-rate threshold.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pipeline = &state.pipeline;
    let verification = pipeline.verifier().health();

    (
        StatusCode::OK,
        Json(json!({
            "status": if verification.healthy { "healthy" } else { "degraded" },
            "service": "dbintel-pipeline",
            "version": env!("CARGO_PKG_VERSION"),
            "verification": verification,
            "sampler": pipeline.sampler().stats(),
            "plan_extractor": pipeline.plan_extractor().stats(),
            "circuits": pipeline.circuit_breaker().registry().len(),
        })),
    )
}
