pub mod batches;
pub mod circuits;
pub mod health;
pub mod metrics_handler;

use crate::config::Config;
use crate::pipeline::Pipeline;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<Config>,
    pub metrics: Arc<PrometheusHandle>,
}
