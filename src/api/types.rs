//! Shared types for the HTTP layer.

use std::sync::Arc;

use serde::Deserialize;

use crate::core_state::CoreState;

/// State handed to every route.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }
}

/// `?include_resolved=true`
#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default)]
    pub include_resolved: bool,
}

/// `?threshold=0.5`
#[derive(Debug, Default, Deserialize)]
pub struct ThresholdQuery {
    pub threshold: Option<f64>,
}

/// `?confidence_level=0.99`
#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub confidence_level: Option<f64>,
}
