use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::calibration::{calibrate, Calibration};
use super::wilson::{z_for_confidence, Interval, Proportion};
use super::MetricsError;
use crate::db::{self, ScoredItem};
use crate::models::SamplingSet;

/// Predicted vs. human label counts. Each cell's proportion is its share
/// of all labeled items. "Positive" means responsive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    pub true_positive: Proportion,
    pub false_positive: Proportion,
    pub true_negative: Proportion,
    pub false_negative: Proportion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct F1Score {
    #[serde(flatten)]
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumMetrics {
    pub stratum: usize,
    pub label: String,
    pub drawn: u64,
    pub labeled: u64,
    pub accuracy: Proportion,
}

/// Derived from a sampling set's labeled items; recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub sampling_set_id: String,
    pub run_id: String,
    pub confidence_level: f64,
    pub requested_size: u64,
    pub drawn: u64,
    pub labeled: u64,
    pub unlabeled: u64,
    pub shortfall: u64,
    pub confusion: ConfusionMatrix,
    pub accuracy: Proportion,
    pub precision: Proportion,
    pub recall: Proportion,
    pub specificity: Proportion,
    pub f1: F1Score,
    pub calibration: Calibration,
    pub strata: Vec<StratumMetrics>,
    pub generated_at: DateTime<Utc>,
}

pub fn compute_report(
    conn: &Connection,
    sampling_set_id: &str,
    confidence_level: f64,
) -> Result<MetricsReport, MetricsError> {
    let set = db::get_sampling_set(conn, sampling_set_id)?
        .ok_or_else(|| MetricsError::SetNotFound(sampling_set_id.to_string()))?;
    let items = db::list_scored_items(conn, sampling_set_id)?;
    build_report(&set, &items, confidence_level)
}

/// Pure part of [`compute_report`].
pub fn build_report(
    set: &SamplingSet,
    items: &[ScoredItem],
    confidence_level: f64,
) -> Result<MetricsReport, MetricsError> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(MetricsError::InvalidConfidenceLevel(confidence_level));
    }
    let z = z_for_confidence(confidence_level);

    let (mut tp, mut fp, mut tn, mut fn_) = (0u64, 0u64, 0u64, 0u64);
    let mut points = Vec::new();
    let mut per_stratum = vec![(0u64, 0u64, 0u64); set.bins.len()];

    for scored in items {
        if let Some((drawn, _, _)) = per_stratum.get_mut(scored.item.stratum) {
            *drawn += 1;
        }
        let Some(human) = scored.item.human_label else {
            continue;
        };
        let predicted = scored.predicted_responsive;
        match (predicted, human) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
        points.push((scored.confidence, predicted == human));
        if let Some((_, labeled, correct)) = per_stratum.get_mut(scored.item.stratum) {
            *labeled += 1;
            if predicted == human {
                *correct += 1;
            }
        }
    }

    let labeled = tp + fp + tn + fn_;
    let drawn = items.len() as u64;
    let precision = Proportion::new(tp, tp + fp, z);
    let recall = Proportion::new(tp, tp + fn_, z);

    let strata = set
        .bins
        .iter()
        .enumerate()
        .map(|(i, bin)| {
            let (drawn, labeled, correct) = per_stratum[i];
            StratumMetrics {
                stratum: i,
                label: bin.label(),
                drawn,
                labeled,
                accuracy: Proportion::new(correct, labeled, z),
            }
        })
        .collect();

    Ok(MetricsReport {
        sampling_set_id: set.id.clone(),
        run_id: set.run_id.clone(),
        confidence_level,
        requested_size: set.requested_size,
        drawn,
        labeled,
        unlabeled: drawn - labeled,
        shortfall: set.shortfall(),
        confusion: ConfusionMatrix {
            true_positive: Proportion::new(tp, labeled, z),
            false_positive: Proportion::new(fp, labeled, z),
            true_negative: Proportion::new(tn, labeled, z),
            false_negative: Proportion::new(fn_, labeled, z),
        },
        accuracy: Proportion::new(tp + tn, labeled, z),
        specificity: Proportion::new(tn, tn + fp, z),
        f1: f1_score(&precision.interval, &recall.interval),
        precision,
        recall,
        calibration: calibrate(&points, z),
        strata,
        generated_at: Utc::now(),
    })
}

/// F1 is increasing in both precision and recall, so its bounds follow
/// from theirs.
fn f1_score(precision: &Interval, recall: &Interval) -> F1Score {
    let harmonic = |p: f64, r: f64| if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) };
    let interval = match (precision, recall) {
        (
            Interval::Defined { estimate: p, lower: pl, upper: pu },
            Interval::Defined { estimate: r, lower: rl, upper: ru },
        ) => Interval::Defined {
            estimate: harmonic(*p, *r),
            lower: harmonic(*pl, *rl),
            upper: harmonic(*pu, *ru),
        },
        _ => Interval::Undefined,
    };
    F1Score { interval }
}
