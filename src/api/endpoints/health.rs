//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;
use crate::inference_service::ActiveOperation;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model_gateway: bool,
    pub database: bool,
    pub prompt_version: String,
    pub inference_capacity: usize,
    pub inference_in_flight: usize,
    /// Generation calls running now, oldest first.
    pub in_flight: Vec<ActiveOperation>,
    pub uptime_secs: u64,
}

/// `GET /api/health`: liveness of Ollama and the database.
pub async fn check(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    let core = &ctx.core;
    let model_gateway = core.gateway().is_alive().await;
    let database = core.db().ping();
    let inference = core.inference();

    Json(HealthResponse {
        status: if model_gateway && database { "ok" } else { "degraded" },
        version: crate::config::APP_VERSION,
        model_gateway,
        database,
        prompt_version: core.prompts().version().to_string(),
        inference_capacity: inference.capacity(),
        inference_in_flight: inference.capacity() - inference.available(),
        in_flight: inference.in_flight(),
        uptime_secs: core.uptime_secs(),
    })
}
