use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::db::DatabaseError;
use crate::models::enums::FailureKind;
use crate::models::DeadLetter;

pub fn insert_dead_letter(conn: &Connection, letter: &DeadLetter) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO dead_letters (id, run_id, document_id, attempts, error_kind, error_message,
         created_at, resolved_at, resolved_by, resolution_note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            letter.id,
            letter.run_id,
            letter.document_id,
            letter.attempts,
            letter.error_kind.as_str(),
            letter.error_message,
            format_timestamp(&letter.created_at),
            letter.resolved_at.as_ref().map(format_timestamp),
            letter.resolved_by,
            letter.resolution_note,
        ],
    )?;
    Ok(())
}

pub fn get_dead_letter(conn: &Connection, id: &str) -> Result<Option<DeadLetter>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, run_id, document_id, attempts, error_kind, error_message,
             created_at, resolved_at, resolved_by, resolution_note
             FROM dead_letters WHERE id = ?1",
            params![id],
            read_row,
        )
        .optional()?;
    row.map(dead_letter_from_row).transpose()
}

/// Dead letters for a run, oldest first. Resolved entries only when asked.
pub fn list_dead_letters(
    conn: &Connection,
    run_id: &str,
    include_resolved: bool,
) -> Result<Vec<DeadLetter>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, document_id, attempts, error_kind, error_message,
         created_at, resolved_at, resolved_by, resolution_note
         FROM dead_letters
         WHERE run_id = ?1 AND (?2 OR resolved_at IS NULL)
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![run_id, include_resolved], read_row)?;

    let mut letters = Vec::new();
    for row in rows {
        letters.push(dead_letter_from_row(row?)?);
    }
    Ok(letters)
}

/// Close one dead letter. Resolving twice is a constraint violation.
pub fn resolve_dead_letter(
    conn: &Connection,
    id: &str,
    resolved_by: &str,
    note: Option<&str>,
) -> Result<DeadLetter, DatabaseError> {
    let changed = conn.execute(
        "UPDATE dead_letters SET resolved_at = ?2, resolved_by = ?3, resolution_note = ?4
         WHERE id = ?1 AND resolved_at IS NULL",
        params![id, format_timestamp(&Utc::now()), resolved_by, note],
    )?;

    let letter = get_dead_letter(conn, id)?.ok_or_else(|| DatabaseError::not_found("DeadLetter", id))?;
    if changed == 0 {
        return Err(DatabaseError::ConstraintViolation(format!(
            "dead letter {id} is already resolved"
        )));
    }
    Ok(letter)
}

/// Close every open dead letter of a run at once.
pub fn resolve_open_dead_letters(
    conn: &Connection,
    run_id: &str,
    resolved_by: &str,
    note: &str,
) -> Result<usize, DatabaseError> {
    let n = conn.execute(
        "UPDATE dead_letters SET resolved_at = ?2, resolved_by = ?3, resolution_note = ?4
         WHERE run_id = ?1 AND resolved_at IS NULL",
        params![run_id, format_timestamp(&Utc::now()), resolved_by, note],
    )?;
    Ok(n)
}

pub fn count_unresolved_dead_letters(conn: &Connection, run_id: &str) -> Result<u64, DatabaseError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dead_letters WHERE run_id = ?1 AND resolved_at IS NULL",
        params![run_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

struct DeadLetterRow {
    id: String,
    run_id: String,
    document_id: String,
    attempts: i64,
    error_kind: String,
    error_message: String,
    created_at: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution_note: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterRow> {
    Ok(DeadLetterRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        document_id: row.get(2)?,
        attempts: row.get(3)?,
        error_kind: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        resolved_at: row.get(7)?,
        resolved_by: row.get(8)?,
        resolution_note: row.get(9)?,
    })
}

fn dead_letter_from_row(row: DeadLetterRow) -> Result<DeadLetter, DatabaseError> {
    Ok(DeadLetter {
        id: row.id,
        run_id: row.run_id,
        document_id: row.document_id,
        attempts: row.attempts as u32,
        error_kind: FailureKind::from_str(&row.error_kind)?,
        error_message: row.error_message,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.resolved_at)?,
        resolved_by: row.resolved_by,
        resolution_note: row.resolution_note,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::repository::fixtures;

    fn letter(run_id: &str, document_id: &str) -> DeadLetter {
        DeadLetter {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            document_id: document_id.into(),
            attempts: 3,
            error_kind: FailureKind::GatewayTimeout,
            error_message: "generation timed out after 120s".into(),
            created_at: fixtures::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        }
    }

    #[test]
    fn insert_list_and_count() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 2);
        fixtures::seed_run(&conn, "r1");
        insert_dead_letter(&conn, &letter("r1", "doc-0")).unwrap();
        insert_dead_letter(&conn, &letter("r1", "doc-1")).unwrap();

        assert_eq!(list_dead_letters(&conn, "r1", false).unwrap().len(), 2);
        assert_eq!(count_unresolved_dead_letters(&conn, "r1").unwrap(), 2);
    }

    #[test]
    fn resolve_once_then_conflict() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");
        let l = letter("r1", "doc-0");
        insert_dead_letter(&conn, &l).unwrap();

        let resolved = resolve_dead_letter(&conn, &l.id, "attorney", Some("withheld")).unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.resolved_by.as_deref(), Some("attorney"));
        assert_eq!(resolved.error_kind, FailureKind::GatewayTimeout);

        let again = resolve_dead_letter(&conn, &l.id, "attorney", None).unwrap_err();
        assert!(matches!(again, DatabaseError::ConstraintViolation(_)));

        assert_eq!(count_unresolved_dead_letters(&conn, "r1").unwrap(), 0);
        assert!(list_dead_letters(&conn, "r1", false).unwrap().is_empty());
        assert_eq!(list_dead_letters(&conn, "r1", true).unwrap().len(), 1);
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = resolve_dead_letter(&conn, "ghost", "a", None).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn bulk_resolve_touches_only_open() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 2);
        fixtures::seed_run(&conn, "r1");
        let first = letter("r1", "doc-0");
        insert_dead_letter(&conn, &first).unwrap();
        resolve_dead_letter(&conn, &first.id, "a", None).unwrap();
        insert_dead_letter(&conn, &letter("r1", "doc-1")).unwrap();

        assert_eq!(resolve_open_dead_letters(&conn, "r1", "system", "superseded").unwrap(), 1);
    }
}
