//! Sampling engine: stratified, seed-reproducible QA draws over a run's
//! classifications and the blind review loop that labels them.

pub mod allocation;
pub mod review;
pub mod sampler;

pub use allocation::allocate;
pub use review::{next_blind_item, record_label, reviewed_item, BlindItem, ReviewedItem};
pub use sampler::{create_sample, SampleDraw, SampleRequest, StratumDraw};

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid sample request: {0}")]
    InvalidRequest(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Sampling set not found: {0}")]
    SetNotFound(String),

    #[error("Sampling item not found: {0}")]
    ItemNotFound(String),

    #[error("Item {0} is already labeled; pass relabel to replace the label")]
    LabelConflict(String),

    #[error("Prediction for item {0} stays sealed until it is labeled")]
    PredictionSealed(String),
}
