use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stratification bin: a predicted class and a confidence range.
///
/// The range is half-open `[min, max)`, except that a bin reaching 1.0
/// includes 1.0 so fully confident predictions are never orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StratumBin {
    pub predicted_responsive: bool,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl StratumBin {
    pub fn new(predicted_responsive: bool, min_confidence: f64, max_confidence: f64) -> Self {
        Self {
            predicted_responsive,
            min_confidence,
            max_confidence,
        }
    }

    pub fn contains(&self, responsive: bool, confidence: f64) -> bool {
        if responsive != self.predicted_responsive || confidence < self.min_confidence {
            return false;
        }
        confidence < self.max_confidence || (self.max_confidence >= 1.0 && confidence <= 1.0)
    }

    /// Human-readable name, e.g. `responsive [0.80, 1.00]`.
    pub fn label(&self) -> String {
        let class = if self.predicted_responsive { "responsive" } else { "non_responsive" };
        let close = if self.max_confidence >= 1.0 { ']' } else { ')' };
        format!(
            "{class} [{:.2}, {:.2}{close}",
            self.min_confidence, self.max_confidence
        )
    }

    fn overlaps(&self, other: &StratumBin) -> bool {
        self.predicted_responsive == other.predicted_responsive
            && self.min_confidence < other.max_confidence
            && other.min_confidence < self.max_confidence
    }
}

/// Check a caller-supplied bin list. Returns a description of the first problem.
pub fn validate_bins(bins: &[StratumBin]) -> Result<(), String> {
    if bins.is_empty() {
        return Err("at least one bin is required".into());
    }
    for (i, bin) in bins.iter().enumerate() {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(bin.min_confidence) || !in_unit(bin.max_confidence) {
            return Err(format!("bin {i}: bounds must lie within [0, 1]"));
        }
        if bin.min_confidence >= bin.max_confidence {
            return Err(format!("bin {i}: min must be below max"));
        }
        if let Some(j) = bins[..i].iter().position(|b| b.overlaps(bin)) {
            return Err(format!("bin {i} overlaps bin {j}"));
        }
    }
    Ok(())
}

/// An immutable QA draw over one run's classifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSet {
    pub id: String,
    pub run_id: String,
    pub seed: u64,
    pub requested_size: u64,
    pub size: u64,
    pub bins: Vec<StratumBin>,
    pub created_at: DateTime<Utc>,
}

impl SamplingSet {
    /// How many requested items the eligible population could not supply.
    pub fn shortfall(&self) -> u64 {
        self.requested_size.saturating_sub(self.size)
    }
}

/// One drawn document inside a sampling set.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingItem {
    pub id: String,
    pub sampling_set_id: String,
    pub position: u64,
    pub document_id: String,
    pub classification_id: String,
    pub stratum: usize,
    pub human_label: Option<bool>,
    pub reviewer: Option<String>,
    pub labeled_at: Option<DateTime<Utc>>,
}
