use axum::{body::Bytes, extract::State, response::Json};
use serde::Deserialize;

use crate::error::{AppError, PipelineError};
use crate::handlers::AppState;
use crate::model::{Batch, Record};
use crate::pipeline::PipelineOutcome;

/// Accepted request bodies: a full batch object or a bare record array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchRequest {
    Records(Vec<Record>),
    Batch(Batch),
}

impl BatchRequest {
    fn into_batch(self) -> Batch {
        match self {
            Self::Batch(batch) => batch,
            Self::Records(records) => Batch::new(records),
        }
    }
}

/// POST /v1/batches - Run one batch through the pipeline
///
/// Returns the processed batch together with its verification report and
/// pipeline statistics.
pub async fn process_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PipelineOutcome>, AppError> {
    let batch = serde_json::from_slice::<BatchRequest>(&body)?.into_batch();

    let limit = state.config.server.max_batch_records;
    if batch.len() > limit {
        return Err(PipelineError::CapacityExceeded(format!(
            "batch has {} records, limit is {}",
            batch.len(),
            limit
        ))
        .into());
    }

    tracing::debug!(
        batch_id = %batch.id,
        source = %batch.source,
        records = batch.len(),
        "Batch received"
    );

    let pipeline = state.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.process(batch))
        .await
        .map_err(|e| AppError::InternalError(format!("batch processing task failed: {}", e)))?;

    Ok(Json(outcome))
}
