//! Metrics engine: accuracy statistics with Wilson intervals and decile
//! calibration, computed from the (prediction, human label) pairs of a
//! sampling set. Reports are never stored.

pub mod calibration;
pub mod report;
pub mod wilson;

pub use calibration::{calibrate, Calibration, CalibrationBucket};
pub use report::{build_report, compute_report, ConfusionMatrix, F1Score, MetricsReport, StratumMetrics};
pub use wilson::{inverse_normal_cdf, wilson, wilson_interval, z_for_confidence, Interval, Proportion};

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Sampling set not found: {0}")]
    SetNotFound(String),

    #[error("Confidence level must lie strictly between 0 and 1, got {0}")]
    InvalidConfidenceLevel(f64),
}
