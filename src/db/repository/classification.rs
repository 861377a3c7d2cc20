use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_json_column, parse_timestamp, to_json_column};
use crate::db::DatabaseError;
use crate::models::Classification;

const CLASSIFICATION_COLUMNS: &str =
    "c.id, c.document_id, c.run_id, c.content_hash, c.responsive, c.confidence, c.reason,
     c.labels, c.attempt, c.reused_from, c.superseded_by, c.created_at";

/// Persist a new classification, superseding the active row for the same
/// (document, run) pair if there is one. Old rows are never deleted.
pub fn record_classification(conn: &Connection, new: &Classification) -> Result<Option<String>, DatabaseError> {
    let tx = conn.unchecked_transaction()?;

    let previous: Option<String> = tx
        .query_row(
            "SELECT id FROM classifications
             WHERE document_id = ?1 AND run_id = ?2 AND superseded_by IS NULL",
            params![new.document_id, new.run_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(old_id) = &previous {
        tx.execute(
            "UPDATE classifications SET superseded_by = ?2 WHERE id = ?1",
            params![old_id, new.id],
        )?;
    }

    tx.execute(
        "INSERT INTO classifications (id, document_id, run_id, content_hash, responsive, confidence,
         reason, labels, attempt, reused_from, superseded_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11)",
        params![
            new.id,
            new.document_id,
            new.run_id,
            new.content_hash,
            new.responsive as i32,
            new.confidence,
            new.reason,
            to_json_column("labels", &new.labels)?,
            new.attempt,
            new.reused_from,
            format_timestamp(&new.created_at),
        ],
    )?;

    tx.commit()?;
    Ok(previous)
}

pub fn get_classification(conn: &Connection, id: &str) -> Result<Option<Classification>, DatabaseError> {
    let sql = format!("SELECT {CLASSIFICATION_COLUMNS} FROM classifications c WHERE c.id = ?1");
    let row = conn.query_row(&sql, params![id], read_row).optional()?;
    row.map(classification_from_row).transpose()
}

/// The non-superseded classification for a (document, run) pair.
pub fn active_classification(
    conn: &Connection,
    run_id: &str,
    document_id: &str,
) -> Result<Option<Classification>, DatabaseError> {
    let sql = format!(
        "SELECT {CLASSIFICATION_COLUMNS} FROM classifications c
         WHERE c.run_id = ?1 AND c.document_id = ?2 AND c.superseded_by IS NULL"
    );
    let row = conn.query_row(&sql, params![run_id, document_id], read_row).optional()?;
    row.map(classification_from_row).transpose()
}

/// An active result for another document with identical content, recorded
/// in the current pass of this run.
pub fn find_reusable_classification(
    conn: &Connection,
    run_id: &str,
    content_hash: &str,
    exclude_document_id: &str,
) -> Result<Option<Classification>, DatabaseError> {
    let sql = format!(
        "SELECT {CLASSIFICATION_COLUMNS} FROM classifications c
         JOIN run_documents rd ON rd.run_id = c.run_id AND rd.document_id = c.document_id
         WHERE c.run_id = ?1 AND c.content_hash = ?2 AND c.document_id != ?3
           AND c.superseded_by IS NULL AND c.reused_from IS NULL AND rd.status = 'recorded'
         ORDER BY rd.seq ASC LIMIT 1"
    );
    let row = conn
        .query_row(&sql, params![run_id, content_hash, exclude_document_id], read_row)
        .optional()?;
    row.map(classification_from_row).transpose()
}

/// Active classifications for a run in document ingestion order.
pub fn list_active_classifications(conn: &Connection, run_id: &str) -> Result<Vec<Classification>, DatabaseError> {
    let sql = format!(
        "SELECT {CLASSIFICATION_COLUMNS} FROM classifications c
         JOIN documents d ON d.id = c.document_id
         WHERE c.run_id = ?1 AND c.superseded_by IS NULL
         ORDER BY d.seq ASC"
    );
    collect(conn, &sql, params![run_id])
}

/// Active classifications below `threshold`, least confident first.
pub fn list_low_confidence(
    conn: &Connection,
    run_id: &str,
    threshold: f64,
) -> Result<Vec<Classification>, DatabaseError> {
    let sql = format!(
        "SELECT {CLASSIFICATION_COLUMNS} FROM classifications c
         JOIN documents d ON d.id = c.document_id
         WHERE c.run_id = ?1 AND c.superseded_by IS NULL AND c.confidence < ?2
         ORDER BY c.confidence ASC, d.seq ASC"
    );
    collect(conn, &sql, params![run_id, threshold])
}

/// Every row ever written for a (document, run) pair, oldest first.
pub fn classification_history(
    conn: &Connection,
    run_id: &str,
    document_id: &str,
) -> Result<Vec<Classification>, DatabaseError> {
    let sql = format!(
        "SELECT {CLASSIFICATION_COLUMNS} FROM classifications c
         WHERE c.run_id = ?1 AND c.document_id = ?2
         ORDER BY c.created_at ASC, c.rowid ASC"
    );
    collect(conn, &sql, params![run_id, document_id])
}

fn collect(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Classification>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, read_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(classification_from_row(row?)?);
    }
    Ok(out)
}

struct ClassificationRow {
    id: String,
    document_id: String,
    run_id: String,
    content_hash: String,
    responsive: i32,
    confidence: f64,
    reason: String,
    labels: String,
    attempt: i64,
    reused_from: Option<String>,
    superseded_by: Option<String>,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ClassificationRow> {
    Ok(ClassificationRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        run_id: row.get(2)?,
        content_hash: row.get(3)?,
        responsive: row.get(4)?,
        confidence: row.get(5)?,
        reason: row.get(6)?,
        labels: row.get(7)?,
        attempt: row.get(8)?,
        reused_from: row.get(9)?,
        superseded_by: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn classification_from_row(row: ClassificationRow) -> Result<Classification, DatabaseError> {
    Ok(Classification {
        id: row.id,
        document_id: row.document_id,
        run_id: row.run_id,
        content_hash: row.content_hash,
        responsive: row.responsive != 0,
        confidence: row.confidence,
        reason: row.reason,
        labels: parse_json_column::<BTreeSet<String>>("labels", &row.labels)?,
        attempt: row.attempt as u32,
        reused_from: row.reused_from,
        superseded_by: row.superseded_by,
        created_at: parse_timestamp("created_at", &row.created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::repository::{fixtures, transition_document};
    use crate::models::enums::DocumentRunStatus;

    #[test]
    fn record_and_fetch_active() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");

        let mut c = fixtures::classification(&docs[0], "r1", true, 0.9);
        c.labels.insert("mold".into());
        let previous = record_classification(&conn, &c).unwrap();
        assert!(previous.is_none());

        let active = active_classification(&conn, "r1", "doc-0").unwrap().unwrap();
        assert_eq!(active, c);
    }

    #[test]
    fn second_record_supersedes_first() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");

        let first = fixtures::classification(&docs[0], "r1", true, 0.9);
        record_classification(&conn, &first).unwrap();
        let second = fixtures::classification(&docs[0], "r1", false, 0.4);
        let previous = record_classification(&conn, &second).unwrap();
        assert_eq!(previous.as_deref(), Some(first.id.as_str()));

        let history = classification_history(&conn, "r1", "doc-0").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].superseded_by.as_deref(), Some(second.id.as_str()));
        assert!(history[1].superseded_by.is_none());

        let active = active_classification(&conn, "r1", "doc-0").unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[test]
    fn out_of_range_confidence_is_rejected_by_schema() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");
        let c = fixtures::classification(&docs[0], "r1", true, 1.5);
        assert!(record_classification(&conn, &c).is_err());
    }

    #[test]
    fn reusable_requires_recorded_twin() {
        let conn = open_memory_database().unwrap();
        let a = fixtures::document("a", "identical");
        let b = fixtures::document("b", "identical");
        crate::db::repository::insert_documents(&conn, &[a.clone(), b.clone()]).unwrap();
        fixtures::seed_run(&conn, "r1");

        record_classification(&conn, &fixtures::classification(&a, "r1", true, 0.8)).unwrap();
        assert!(find_reusable_classification(&conn, "r1", &b.content_hash, "b").unwrap().is_none());

        crate::db::repository::claim_next_document(&conn, "r1").unwrap();
        transition_document(&conn, "r1", "a", DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, 0).unwrap();
        let twin = find_reusable_classification(&conn, "r1", &b.content_hash, "b").unwrap().unwrap();
        assert_eq!(twin.document_id, "a");
    }

    #[test]
    fn low_confidence_sorted_ascending() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 3);
        fixtures::seed_run(&conn, "r1");
        for (doc, conf) in docs.iter().zip([0.9, 0.2, 0.5]) {
            record_classification(&conn, &fixtures::classification(doc, "r1", true, conf)).unwrap();
        }

        let low = list_low_confidence(&conn, "r1", 0.65).unwrap();
        let confs: Vec<f64> = low.iter().map(|c| c.confidence).collect();
        assert_eq!(confs, vec![0.2, 0.5]);
    }

    #[test]
    fn active_list_follows_ingestion_order() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 3);
        fixtures::seed_run(&conn, "r1");
        for doc in docs.iter().rev() {
            record_classification(&conn, &fixtures::classification(doc, "r1", false, 0.7)).unwrap();
        }
        let ids: Vec<String> = list_active_classifications(&conn, "r1")
            .unwrap()
            .into_iter()
            .map(|c| c.document_id)
            .collect();
        assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2"]);
    }
}
