//! Process-wide application state.
//!
//! `CoreState` owns the database handle, the model gateway, the prompt
//! template, the inference slot service and the orchestrator. It is built
//! once at startup, wrapped in `Arc`, and shared with the HTTP layer.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::config::{AppConfig, ConfigError};
use crate::db::{Database, DatabaseError};
use crate::inference_service::InferenceService;
use crate::pipeline::classification::{
    ClassifyError, GatewayError, ModelGateway, OllamaGateway, Orchestrator, PromptBuilder, PromptError,
};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Prompt template error: {0}")]
    Prompt(#[from] PromptError),
    #[error("Model gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Run recovery failed: {0}")]
    Recovery(#[from] ClassifyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CoreState {
    pub config: AppConfig,
    db: Arc<Database>,
    gateway: Arc<dyn ModelGateway>,
    prompts: Arc<PromptBuilder>,
    inference: Arc<InferenceService>,
    orchestrator: Arc<Orchestrator>,
    started_at: Instant,
}

impl CoreState {
    /// Open the on-disk database and connect to Ollama as configured.
    pub fn open(config: AppConfig) -> Result<Self, CoreError> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&config.database_path)?;
        let gateway = OllamaGateway::new(&config.ollama_url, config.liveness_timeout)?;
        let prompts = match &config.prompt_path {
            Some(path) => PromptBuilder::from_path(path, config.max_body_chars)?,
            None => PromptBuilder::embedded(config.max_body_chars)?,
        };

        tracing::info!(
            database = %config.database_path.display(),
            ollama = %config.ollama_url,
            prompt_version = %prompts.version(),
            examples = prompts.example_count(),
            "Core state ready"
        );
        Ok(Self::with_parts(config, Arc::new(db), Arc::new(gateway), prompts))
    }

    /// Assemble from already-built parts (tests inject an in-memory
    /// database and a scripted gateway).
    pub fn with_parts(
        config: AppConfig,
        db: Arc<Database>,
        gateway: Arc<dyn ModelGateway>,
        prompts: PromptBuilder,
    ) -> Self {
        let prompts = Arc::new(prompts);
        let inference = Arc::new(InferenceService::new(config.inference_slots));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&db),
            Arc::clone(&gateway),
            Arc::clone(&prompts),
            Arc::clone(&inference),
            config.orchestrator_settings(),
        ));
        Self {
            config,
            db,
            gateway,
            prompts,
            inference,
            orchestrator,
            started_at: Instant::now(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn gateway(&self) -> &dyn ModelGateway {
        self.gateway.as_ref()
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    pub fn inference(&self) -> &InferenceService {
        &self.inference
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;
    use crate::pipeline::classification::gateway::mock::ScriptedGateway;

    pub fn test_config() -> AppConfig {
        let vars: HashMap<&str, &str> = [
            ("CPRA_DB_PATH", "/nonexistent/cpra.db"),
            ("CPRA_BACKOFF_BASE_MS", "1"),
            ("CPRA_BACKOFF_MAX_MS", "4"),
        ]
        .into_iter()
        .collect();
        AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    /// In-memory state around `gateway`; the gateway handle is returned for assertions.
    pub fn test_state(gateway: ScriptedGateway) -> (Arc<CoreState>, Arc<ScriptedGateway>) {
        let gateway = Arc::new(gateway);
        let state = CoreState::with_parts(
            test_config(),
            Arc::new(Database::in_memory().unwrap()),
            gateway.clone(),
            PromptBuilder::embedded(4000).unwrap(),
        );
        (Arc::new(state), gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::pipeline::classification::gateway::mock::ScriptedGateway;

    #[test]
    fn parts_share_one_database() {
        let (state, _gateway) = test_state(ScriptedGateway::always("{}"));
        assert!(state.db().ping());
        assert_eq!(state.inference().capacity(), 8);
        assert_eq!(state.prompts().version(), "v1");
        assert!(!state.orchestrator().is_active("r1"));
    }

    #[tokio::test]
    async fn gateway_is_reachable_through_state() {
        let (state, gateway) = test_state(ScriptedGateway::always("{}"));
        assert!(state.gateway().is_alive().await);
        gateway.set_alive(false);
        assert!(!state.gateway().is_alive().await);
    }

    #[test]
    fn open_creates_database_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.database_path = tmp.path().join("nested").join("cpra.db");
        let state = CoreState::open(config).unwrap();
        assert!(state.db().ping());
        assert!(tmp.path().join("nested").join("cpra.db").exists());
    }
}
