//! QA sampling, blind review and metrics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ReportQuery};
use crate::pipeline::metrics::{compute_report, MetricsReport};
use crate::pipeline::sampling::{
    create_sample, next_blind_item, record_label, reviewed_item, BlindItem, ReviewedItem, SampleDraw,
    SampleRequest,
};

/// `POST /api/samples`
pub async fn create(
    State(ctx): State<ApiContext>,
    Json(req): Json<SampleRequest>,
) -> Result<(StatusCode, Json<SampleDraw>), ApiError> {
    let draw = ctx
        .core
        .db()
        .with_conn(|conn| create_sample(conn, &req))?;
    Ok((StatusCode::CREATED, Json(draw)))
}

#[derive(Debug, Serialize)]
pub struct NextItemResponse {
    pub done: bool,
    pub item: Option<BlindItem>,
}

/// `GET /api/samples/:id/next`: next item to label, prediction withheld.
pub async fn next(
    State(ctx): State<ApiContext>,
    Path(set_id): Path<String>,
) -> Result<Json<NextItemResponse>, ApiError> {
    let item = ctx
        .core
        .db()
        .with_conn(|conn| next_blind_item(conn, &set_id))?;
    Ok(Json(NextItemResponse {
        done: item.is_none(),
        item,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub label: bool,
    pub reviewer: String,
    #[serde(default)]
    pub relabel: bool,
}

/// `POST /api/sample-items/:id/label`
pub async fn label(
    State(ctx): State<ApiContext>,
    Path(item_id): Path<String>,
    Json(req): Json<LabelRequest>,
) -> Result<Json<ReviewedItem>, ApiError> {
    let reviewed = ctx
        .core
        .db()
        .with_conn(|conn| record_label(conn, &item_id, req.label, &req.reviewer, req.relabel))?;
    Ok(Json(reviewed))
}

/// `GET /api/sample-items/:id`: 403 until the item is labeled.
pub async fn reviewed(
    State(ctx): State<ApiContext>,
    Path(item_id): Path<String>,
) -> Result<Json<ReviewedItem>, ApiError> {
    let item = ctx
        .core
        .db()
        .with_conn(|conn| reviewed_item(conn, &item_id))?;
    Ok(Json(item))
}

/// `GET /api/samples/:id/report`
pub async fn report(
    State(ctx): State<ApiContext>,
    Path(set_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<MetricsReport>, ApiError> {
    let level = query
        .confidence_level
        .unwrap_or(ctx.core.config.confidence_level);
    let report = ctx
        .core
        .db()
        .with_conn(|conn| compute_report(conn, &set_id, level))?;
    Ok(Json(report))
}

