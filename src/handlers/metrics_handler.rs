use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::handlers::AppState;

/// Handle /metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_metrics_handler() {
        // Handle from a recorder that is never installed globally
        let config = Config::default();
        let state = AppState {
            pipeline: Arc::new(Pipeline::new(&config).unwrap()),
            config: Arc::new(config),
            metrics: Arc::new(crate::metrics::detached_handle()),
        };

        let response = metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
