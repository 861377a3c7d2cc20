//! Model discovery.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;
use crate::pipeline::classification::ModelInfo;

#[derive(Serialize)]
pub struct ModelsResponse {
    pub available: bool,
    pub models: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /api/models`: installed models; `available=false` when Ollama is down.
pub async fn list(State(ctx): State<ApiContext>) -> Json<ModelsResponse> {
    match ctx.core.gateway().list_models().await {
        Ok(models) => Json(ModelsResponse {
            available: true,
            models,
            error: None,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Model listing failed");
            Json(ModelsResponse {
                available: false,
                models: Vec::new(),
                error: Some(e.to_string()),
            })
        }
    }
}
