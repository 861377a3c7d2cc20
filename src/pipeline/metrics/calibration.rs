//! Confidence calibration by decile.
//!
//! Each labeled prediction falls into one of ten buckets by the model's
//! confidence (`[0.0, 0.1)` … `[0.9, 1.0]`); a bucket reports how often the
//! prediction agreed with the human label. A calibrated model's observed
//! accuracy tracks its mean confidence.

use serde::Serialize;

use super::wilson::Proportion;

pub const BUCKETS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
    pub mean_confidence: Option<f64>,
    pub accuracy: Proportion,
    /// Mean confidence minus observed accuracy; positive means overconfident.
    pub gap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibration {
    pub buckets: Vec<CalibrationBucket>,
    pub expected_calibration_error: Option<f64>,
}

pub fn bucket_index(confidence: f64) -> usize {
    ((confidence.clamp(0.0, 1.0) * BUCKETS as f64).floor() as usize).min(BUCKETS - 1)
}

/// Build the curve from `(confidence, prediction_was_correct)` pairs.
pub fn calibrate(points: &[(f64, bool)], z: f64) -> Calibration {
    let mut counts = [0u64; BUCKETS];
    let mut correct = [0u64; BUCKETS];
    let mut confidence_sum = [0f64; BUCKETS];
    for &(confidence, hit) in points {
        let b = bucket_index(confidence);
        counts[b] += 1;
        confidence_sum[b] += confidence;
        if hit {
            correct[b] += 1;
        }
    }

    let total = points.len() as f64;
    let mut ece = 0.0;
    let buckets = (0..BUCKETS)
        .map(|b| {
            let count = counts[b];
            let accuracy = Proportion::new(correct[b], count, z);
            let mean_confidence = (count > 0).then(|| confidence_sum[b] / count as f64);
            let gap = match (mean_confidence, accuracy.interval.estimate()) {
                (Some(conf), Some(acc)) => Some(conf - acc),
                _ => None,
            };
            if let Some(gap) = gap {
                ece += (count as f64 / total) * gap.abs();
            }
            CalibrationBucket {
                lower: b as f64 / BUCKETS as f64,
                upper: (b + 1) as f64 / BUCKETS as f64,
                count,
                mean_confidence,
                accuracy,
                gap,
            }
        })
        .collect();

    Calibration {
        buckets,
        expected_calibration_error: (!points.is_empty()).then_some(ece),
    }
}
