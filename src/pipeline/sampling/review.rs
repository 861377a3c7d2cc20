//! Blind review.
//!
//! The reviewer sees the document, never the prediction. Predicted class,
//! confidence, reason and stratum of an item are released only after a
//! human label exists for it.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;

use super::SamplingError;
use crate::db::{self, ArchivedLabel, DatabaseError};
use crate::models::{EmailHeaders, SamplingItem};

/// What a reviewer is shown before labeling.
#[derive(Debug, Clone, Serialize)]
pub struct BlindItem {
    pub item_id: String,
    pub sampling_set_id: String,
    pub position: u64,
    /// Unlabeled items left in the set, this one included.
    pub remaining: u64,
    pub document_id: String,
    pub headers: EmailHeaders,
    pub text: String,
}

/// A labeled item with its prediction unsealed.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewedItem {
    pub item_id: String,
    pub sampling_set_id: String,
    pub document_id: String,
    pub stratum: usize,
    pub stratum_label: String,
    pub human_label: bool,
    pub reviewer: String,
    pub labeled_at: DateTime<Utc>,
    pub responsive: bool,
    pub confidence: f64,
    pub reason: String,
    pub labels: BTreeSet<String>,
    pub agrees: bool,
    pub history: Vec<ArchivedLabel>,
}

/// Next unlabeled item in review order, or `None` once the set is done.
pub fn next_blind_item(conn: &Connection, sampling_set_id: &str) -> Result<Option<BlindItem>, SamplingError> {
    if db::get_sampling_set(conn, sampling_set_id)?.is_none() {
        return Err(SamplingError::SetNotFound(sampling_set_id.to_string()));
    }
    let Some((item, remaining)) = db::next_unlabeled_item(conn, sampling_set_id)? else {
        return Ok(None);
    };
    let doc = db::get_document(conn, &item.document_id)?
        .ok_or_else(|| DatabaseError::not_found("Document", &item.document_id))?;

    Ok(Some(BlindItem {
        item_id: item.id,
        sampling_set_id: item.sampling_set_id,
        position: item.position,
        remaining,
        document_id: doc.id,
        headers: doc.headers,
        text: doc.text,
    }))
}

/// Record a human label. A second label on the same item is a conflict
/// unless `relabel` is set, in which case the prior label is archived.
pub fn record_label(
    conn: &Connection,
    item_id: &str,
    label: bool,
    reviewer: &str,
    relabel: bool,
) -> Result<ReviewedItem, SamplingError> {
    let reviewer = reviewer.trim();
    if reviewer.is_empty() {
        return Err(SamplingError::InvalidRequest("reviewer must not be empty".into()));
    }
    let item = load_item(conn, item_id)?;
    if item.human_label.is_some() && !relabel {
        return Err(SamplingError::LabelConflict(item_id.to_string()));
    }

    db::write_label(conn, item_id, label, reviewer, &Utc::now())?;
    if item.human_label.is_some() {
        tracing::info!(item_id = %item_id, reviewer = %reviewer, "Item relabeled, prior label archived");
    } else {
        tracing::debug!(item_id = %item_id, reviewer = %reviewer, "Item labeled");
    }
    reviewed_item(conn, item_id)
}

/// An item with its prediction, for reporting. Sealed until labeled.
pub fn reviewed_item(conn: &Connection, item_id: &str) -> Result<ReviewedItem, SamplingError> {
    let item = load_item(conn, item_id)?;
    let (Some(human_label), Some(reviewer), Some(labeled_at)) =
        (item.human_label, item.reviewer.clone(), item.labeled_at)
    else {
        return Err(SamplingError::PredictionSealed(item_id.to_string()));
    };

    let classification = db::get_classification(conn, &item.classification_id)?
        .ok_or_else(|| DatabaseError::not_found("Classification", &item.classification_id))?;
    let set = db::get_sampling_set(conn, &item.sampling_set_id)?
        .ok_or_else(|| SamplingError::SetNotFound(item.sampling_set_id.clone()))?;
    let stratum_label = set
        .bins
        .get(item.stratum)
        .map(|b| b.label())
        .unwrap_or_default();

    Ok(ReviewedItem {
        history: db::label_history(conn, item_id)?,
        agrees: classification.responsive == human_label,
        item_id: item.id,
        sampling_set_id: item.sampling_set_id,
        document_id: item.document_id,
        stratum: item.stratum,
        stratum_label,
        human_label,
        reviewer,
        labeled_at,
        responsive: classification.responsive,
        confidence: classification.confidence,
        reason: classification.reason,
        labels: classification.labels,
    })
}

fn load_item(conn: &Connection, item_id: &str) -> Result<SamplingItem, SamplingError> {
    db::get_sampling_item(conn, item_id)?.ok_or_else(|| SamplingError::ItemNotFound(item_id.to_string()))
}
