//! Repository layer: entity-scoped database operations.
//!
//! Every function takes a borrowed `Connection`; callers that share the
//! process-wide handle go through `Database::with_conn`.

mod classification;
mod dead_letter;
mod document;
mod run;
mod sampling;

use chrono::{DateTime, SecondsFormat, Utc};

use super::DatabaseError;

// Re-export all public items from sub-modules
pub use classification::*;
pub use dead_letter::*;
pub use document::*;
pub use run::*;
pub use sampling::*;

/// Canonical text form for every timestamp column.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(column: &'static str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::CorruptColumn {
            column,
            reason: format!("{raw:?}: {e}"),
        })
}

pub(crate) fn parse_optional_timestamp(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.map(|s| parse_timestamp(column, &s)).transpose()
}

pub(crate) fn parse_json_column<T: serde::de::DeserializeOwned>(
    column: &'static str,
    raw: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::CorruptColumn {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn to_json_column<T: serde::Serialize>(
    column: &'static str,
    value: &T,
) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::CorruptColumn {
        column,
        reason: e.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip_keeps_millis() {
        let now = Utc::now();
        let text = format_timestamp(&now);
        let back = parse_timestamp("created_at", &text).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn fixture_times_survive_storage_unchanged() {
        let now = fixtures::now();
        let back = parse_timestamp("created_at", &format_timestamp(&now)).unwrap();
        assert_eq!(back, now);
    }

    #[test]
    fn corrupt_timestamp_names_column() {
        let err = parse_timestamp("labeled_at", "yesterday").unwrap_err();
        match err {
            DatabaseError::CorruptColumn { column, .. } => assert_eq!(column, "labeled_at"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
