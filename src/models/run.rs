use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::RunStatus;

/// Model sampling parameters plus the run's worker concurrency and attempt cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            concurrency: 4,
            max_attempts: default_max_attempts(),
            max_tokens: None,
        }
    }
}

/// One orchestration job over the document set for a model/prompt/parameter combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRun {
    pub run_id: String,
    pub model: String,
    pub prompt_version: String,
    pub parameters: RunParameters,
    pub status: RunStatus,
    pub abandoned: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Progress counters. Always sum to the run's document count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub queued: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl RunCounters {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.done + self.failed
    }

    /// True when every document is recorded or dead-lettered.
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

/// What `getRunStatus` returns to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub run: ClassificationRun,
    pub counters: RunCounters,
    pub total: u64,
    pub cancel_requested: bool,
    /// Generation calls of this run holding an inference slot right now.
    pub in_flight_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_sum_and_settle() {
        let c = RunCounters { queued: 0, processing: 0, done: 7, failed: 3 };
        assert_eq!(c.total(), 10);
        assert!(c.is_settled());

        let c = RunCounters { queued: 1, processing: 2, done: 7, failed: 0 };
        assert!(!c.is_settled());
    }

    #[test]
    fn parameters_round_trip_through_json() {
        let params = RunParameters { max_tokens: Some(256), ..RunParameters::default() };
        let json = serde_json::to_string(&params).unwrap();
        let back: RunParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
