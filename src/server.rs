use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, routing::{get, post}, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    handlers::{self, AppState},
    metrics,
    pipeline::Pipeline,
    sampler::run_persistence_task,
    signals::{setup_signal_handlers, wait_for_shutdown},
};

/// Start the pipeline server
///
/// This function:
/// 1. Initializes metrics
/// 2. Builds the pipeline and restores the sampler snapshot
/// 3. Sets up signal handlers and the periodic snapshot task
/// 4. Binds to the configured address
/// 5. Serves requests with graceful shutdown support, writing a final
///    snapshot before returning
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = metrics::init_metrics().context("Failed to install Prometheus recorder")?;

    let state = build_state(config.clone(), metrics_handle)?;

    let restored = state.pipeline.sampler().restore();
    if restored > 0 {
        info!("Restored {} sampler decisions from snapshot", restored);
    }

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let shutdown_rx = shutdown_tx.subscribe();

    let persistence = tokio::spawn(run_persistence_task(
        state.pipeline.sampler().clone(),
        config.sampler.persist_interval(),
        shutdown_tx.subscribe(),
    ));

    let app = create_router(state);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid server.host '{}'", config.server.host))?,
        config.server.port,
    ));

    info!("Starting dbintel pipeline on {}", addr);
    info!(
        "Configuration: {} sampling rules, {} circuit overrides, {} PII patterns",
        config.sampler.rules.len(),
        config.circuit_breaker.databases.len(),
        config.verification.pii_patterns.len()
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown(shutdown_rx).await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    // Final snapshot is written when the task sees the shutdown signal
    persistence.await?;
    signal_handle.await?;
    info!("Server stopped gracefully");

    Ok(())
}

/// Build the shared handler state from a validated configuration
pub fn build_state(config: Config, metrics_handle: PrometheusHandle) -> Result<AppState> {
    let pipeline = Pipeline::new(&config).context("Failed to build pipeline")?;

    Ok(AppState {
        pipeline: Arc::new(pipeline),
        config: Arc::new(config),
        metrics: Arc::new(metrics_handle),
    })
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/batches", post(handlers::batches::process_batch))
        .route("/v1/circuits", get(handlers::circuits::list_circuits))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .with_state(state)
        // Batches are bounded by record count too; this only caps raw body size
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_state() {
        let state = build_state(Config::default(), metrics::detached_handle()).unwrap();
        assert!(state.pipeline.circuit_breaker().registry().is_empty());
        assert_eq!(state.config.server.port, 8470);
    }

    #[tokio::test]
    async fn test_create_router() {
        let state = build_state(Config::default(), metrics::detached_handle()).unwrap();
        let _app = create_router(state);
        // Router created successfully - no panic
    }
}
