//! Classification engine: drives every document of a run through the model
//! gateway and the response parser, with bounded concurrency, retry with
//! backoff, dead-lettering and resumable runs.

pub mod backoff;
pub mod gateway;
pub mod ollama;
pub mod orchestrator;
pub mod parser;
pub mod prompt;

pub use backoff::RetryPolicy;
pub use gateway::{GatewayError, GenerationRequest, ModelGateway, ModelInfo};
pub use ollama::OllamaGateway;
pub use orchestrator::{ExportReadiness, Orchestrator, OrchestratorSettings, StartRunRequest};
pub use parser::{parse_response, FieldAdjustment, ParseFailure, ParsedClassification};
pub use prompt::{PromptBuilder, PromptError};

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Model gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is already running")]
    AlreadyRunning(String),

    #[error("Run {0} was abandoned and cannot be restarted")]
    Abandoned(String),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Dead letter {0} is already resolved")]
    AlreadyResolved(String),
}
