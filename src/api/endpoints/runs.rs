//! Classification run lifecycle and manual-review queues.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, DeadLetterQuery, ThresholdQuery};
use crate::models::{Classification, DeadLetter, RunSnapshot};
use crate::pipeline::classification::{ExportReadiness, StartRunRequest};

/// `POST /api/runs`: start or resume; progress is polled.
pub async fn start(
    State(ctx): State<ApiContext>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunSnapshot>), ApiError> {
    let snapshot = ctx.core.orchestrator().start_run(req).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// `GET /api/runs/:id`
pub async fn status(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(ctx.core.orchestrator().get_run_status(&run_id)?))
}

/// `POST /api/runs/:id/cancel`
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(ctx.core.orchestrator().cancel_run(&run_id)?))
}

/// `POST /api/runs/:id/abandon`
pub async fn abandon(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(ctx.core.orchestrator().abandon_run(&run_id)?))
}

/// `GET /api/runs/:id/dead-letters`
pub async fn dead_letters(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let letters = ctx
        .core
        .orchestrator()
        .list_dead_letters(&run_id, query.include_resolved)?;
    Ok(Json(letters))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolved_by: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// `POST /api/dead-letters/:id/resolve`
pub async fn resolve_dead_letter(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<DeadLetter>, ApiError> {
    let letter = ctx
        .core
        .orchestrator()
        .resolve_dead_letter(&id, &req.resolved_by, req.note.as_deref())?;
    tracing::info!(dead_letter_id = %id, resolved_by = %req.resolved_by, "Dead letter resolved");
    Ok(Json(letter))
}

#[derive(Debug, Serialize)]
pub struct LowConfidenceResponse {
    pub threshold: f64,
    pub items: Vec<Classification>,
}

/// `GET /api/runs/:id/low-confidence`
pub async fn low_confidence(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
    Query(query): Query<ThresholdQuery>,
) -> Result<Json<LowConfidenceResponse>, ApiError> {
    let orchestrator = ctx.core.orchestrator();
    let threshold = query
        .threshold
        .unwrap_or(orchestrator.settings().low_confidence_threshold);
    let items = orchestrator.low_confidence(&run_id, Some(threshold))?;
    Ok(Json(LowConfidenceResponse { threshold, items }))
}

/// `GET /api/runs/:id/export-readiness`
pub async fn export_readiness(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<ExportReadiness>, ApiError> {
    Ok(Json(ctx.core.orchestrator().export_readiness(&run_id)?))
}
