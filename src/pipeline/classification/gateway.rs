//! Model gateway contract.
//!
//! The gateway sends one rendered prompt to the local inference endpoint and
//! returns raw text. It never retries; retry policy lives in the
//! orchestrator, which knows attempt counts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    /// Per-call deadline. A document's wall time is the sum across retries.
    pub timeout: Duration,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Generation timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Inference service unavailable at {0}")]
    Unavailable(String),

    #[error("Inference service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Unreadable response from inference service: {0}")]
    MalformedResponse(String),
}

/// An installed model as reported by the inference service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Bytes on disk.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: String,
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GatewayError>;

    /// Cheap probe, distinct from generation.
    async fn is_alive(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError>;
}
