use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{DocumentRunStatus, FailureKind};

/// One model outcome for a (document, run) pair.
///
/// Never mutated after insert except for `superseded_by`, which a forced
/// re-classification sets on the row it replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub id: String,
    pub document_id: String,
    pub run_id: String,
    pub content_hash: String,
    pub responsive: bool,
    pub confidence: f64,
    pub reason: String,
    pub labels: BTreeSet<String>,
    /// 1-based attempt that produced the result; 0 when copied from a
    /// same-content document in the run.
    pub attempt: u32,
    pub reused_from: Option<String>,
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-document state inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDocument {
    pub run_id: String,
    pub document_id: String,
    pub seq: i64,
    pub status: DocumentRunStatus,
    pub attempts: u32,
}

/// A document that exhausted its attempts, waiting for manual handling.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub run_id: String,
    pub document_id: String,
    pub attempts: u32,
    pub error_kind: FailureKind,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
}

impl DeadLetter {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
