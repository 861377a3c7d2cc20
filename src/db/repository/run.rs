use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_timestamp, parse_json_column, parse_optional_timestamp, parse_timestamp, to_json_column};
use crate::db::DatabaseError;
use crate::models::enums::{DocumentRunStatus, RunStatus};
use crate::models::{ClassificationRun, RunCounters, RunDocument};

// ═══════════════════════════════════════════════════════════
// Runs
// ═══════════════════════════════════════════════════════════

pub fn insert_run(conn: &Connection, run: &ClassificationRun) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO classification_runs (run_id, model, prompt_version, parameters, status, abandoned,
         created_at, started_at, completed_at, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.run_id,
            run.model,
            run.prompt_version,
            to_json_column("parameters", &run.parameters)?,
            run.status.as_str(),
            run.abandoned as i32,
            format_timestamp(&run.created_at),
            run.started_at.as_ref().map(format_timestamp),
            run.completed_at.as_ref().map(format_timestamp),
            run.last_error,
        ],
    )?;
    Ok(())
}

pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<ClassificationRun>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT run_id, model, prompt_version, parameters, status, abandoned,
             created_at, started_at, completed_at, last_error
             FROM classification_runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(RunRow {
                    run_id: row.get(0)?,
                    model: row.get(1)?,
                    prompt_version: row.get(2)?,
                    parameters: row.get(3)?,
                    status: row.get(4)?,
                    abandoned: row.get(5)?,
                    created_at: row.get(6)?,
                    started_at: row.get(7)?,
                    completed_at: row.get(8)?,
                    last_error: row.get(9)?,
                })
            },
        )
        .optional()?;
    row.map(run_from_row).transpose()
}

/// Ids of runs currently in `status`, oldest first.
pub fn list_run_ids_with_status(conn: &Connection, status: RunStatus) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT run_id FROM classification_runs WHERE status = ?1 ORDER BY created_at ASC",
    )?;
    let ids = stmt
        .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Move a run to `status`. `started_at` is stamped the first time it runs,
/// `completed_at` whenever it reaches a terminal status.
///
/// Entering `running` without a note clears the previous `last_error`.
pub fn set_run_status(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    last_error: Option<&str>,
) -> Result<(), DatabaseError> {
    let now = format_timestamp(&Utc::now());
    let terminal = matches!(status, RunStatus::Completed | RunStatus::Failed);
    let changed = conn.execute(
        "UPDATE classification_runs SET
            status = ?2,
            last_error = CASE WHEN ?3 IS NOT NULL THEN ?3 WHEN ?2 = 'running' THEN NULL ELSE last_error END,
            started_at = CASE WHEN ?2 = 'running' THEN COALESCE(started_at, ?4) ELSE started_at END,
            completed_at = CASE WHEN ?5 THEN ?4 ELSE NULL END
         WHERE run_id = ?1",
        params![run_id, status.as_str(), last_error, now, terminal],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("ClassificationRun", run_id));
    }
    Ok(())
}

pub fn mark_run_abandoned(conn: &Connection, run_id: &str) -> Result<(), DatabaseError> {
    set_run_status(conn, run_id, RunStatus::Failed, Some("abandoned"))?;
    conn.execute(
        "UPDATE classification_runs SET abandoned = 1 WHERE run_id = ?1",
        params![run_id],
    )?;
    Ok(())
}

struct RunRow {
    run_id: String,
    model: String,
    prompt_version: String,
    parameters: String,
    status: String,
    abandoned: i32,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    last_error: Option<String>,
}

fn run_from_row(row: RunRow) -> Result<ClassificationRun, DatabaseError> {
    Ok(ClassificationRun {
        run_id: row.run_id,
        model: row.model,
        prompt_version: row.prompt_version,
        parameters: parse_json_column("parameters", &row.parameters)?,
        status: RunStatus::from_str(&row.status)?,
        abandoned: row.abandoned != 0,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        started_at: parse_optional_timestamp("started_at", row.started_at)?,
        completed_at: parse_optional_timestamp("completed_at", row.completed_at)?,
        last_error: row.last_error,
    })
}

// ═══════════════════════════════════════════════════════════
// Per-document state
// ═══════════════════════════════════════════════════════════

/// Enrol every stored document that is not yet part of the run, as pending.
pub fn attach_documents(conn: &Connection, run_id: &str) -> Result<usize, DatabaseError> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO run_documents (run_id, document_id, seq, status, attempts, updated_at)
         SELECT ?1, id, seq, 'pending', 0, ?2 FROM documents",
        params![run_id, format_timestamp(&Utc::now())],
    )?;
    Ok(n)
}

/// Return work a crashed or paused run left mid-flight to the queue.
///
/// An in-flight row whose classification was written after the claim only
/// missed its final status update, so it is settled as recorded instead.
pub fn requeue_unsettled(conn: &Connection, run_id: &str) -> Result<usize, DatabaseError> {
    let now = format_timestamp(&Utc::now());
    conn.execute(
        "UPDATE run_documents SET status = 'recorded', updated_at = ?2
         WHERE run_id = ?1 AND status = 'in_flight'
           AND EXISTS (SELECT 1 FROM classifications c
                       WHERE c.run_id = run_documents.run_id
                         AND c.document_id = run_documents.document_id
                         AND c.superseded_by IS NULL
                         AND c.created_at >= run_documents.updated_at)",
        params![run_id, now],
    )?;
    let n = conn.execute(
        "UPDATE run_documents SET status = 'pending', updated_at = ?2
         WHERE run_id = ?1 AND status IN ('in_flight', 'retrying')",
        params![run_id, now],
    )?;
    Ok(n)
}

/// Put every document of the run back to pending with a fresh attempt budget.
pub fn requeue_all(conn: &Connection, run_id: &str) -> Result<usize, DatabaseError> {
    let n = conn.execute(
        "UPDATE run_documents SET status = 'pending', attempts = 0, updated_at = ?2
         WHERE run_id = ?1",
        params![run_id, format_timestamp(&Utc::now())],
    )?;
    Ok(n)
}

/// Claim the oldest pending document for a worker.
///
/// The update is a compare-and-swap on `status`, so a row that another
/// worker claimed between the read and the write is skipped.
pub fn claim_next_document(conn: &Connection, run_id: &str) -> Result<Option<RunDocument>, DatabaseError> {
    loop {
        let candidate: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT document_id, seq, attempts FROM run_documents
                 WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY seq ASC LIMIT 1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((document_id, seq, attempts)) = candidate else {
            return Ok(None);
        };

        if transition_document(
            conn,
            run_id,
            &document_id,
            DocumentRunStatus::Pending,
            DocumentRunStatus::InFlight,
            1,
        )? {
            return Ok(Some(RunDocument {
                run_id: run_id.to_string(),
                document_id,
                seq,
                status: DocumentRunStatus::InFlight,
                attempts: (attempts + 1) as u32,
            }));
        }
    }
}

/// Compare-and-swap a document's status, adjusting its attempt count by
/// `attempt_delta`. Returns false when the row was not in `from`.
pub fn transition_document(
    conn: &Connection,
    run_id: &str,
    document_id: &str,
    from: DocumentRunStatus,
    to: DocumentRunStatus,
    attempt_delta: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE run_documents SET status = ?4, attempts = MAX(attempts + ?5, 0), updated_at = ?6
         WHERE run_id = ?1 AND document_id = ?2 AND status = ?3",
        params![
            run_id,
            document_id,
            from.as_str(),
            to.as_str(),
            attempt_delta,
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_run_document(
    conn: &Connection,
    run_id: &str,
    document_id: &str,
) -> Result<Option<RunDocument>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT run_id, document_id, seq, status, attempts FROM run_documents
             WHERE run_id = ?1 AND document_id = ?2",
            params![run_id, document_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(run_id, document_id, seq, status, attempts)| {
        Ok(RunDocument {
            run_id,
            document_id,
            seq,
            status: DocumentRunStatus::from_str(&status)?,
            attempts: attempts as u32,
        })
    })
    .transpose()
}

/// Counters derived from the per-document rows.
pub fn run_counters(conn: &Connection, run_id: &str) -> Result<RunCounters, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM run_documents WHERE run_id = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counters = RunCounters::default();
    for row in rows {
        let (status, n) = row?;
        let n = n as u64;
        match DocumentRunStatus::from_str(&status)? {
            DocumentRunStatus::Pending => counters.queued += n,
            DocumentRunStatus::InFlight | DocumentRunStatus::Retrying => counters.processing += n,
            DocumentRunStatus::Recorded => counters.done += n,
            DocumentRunStatus::DeadLettered => counters.failed += n,
        }
    }
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::repository::fixtures;

    #[test]
    fn runs_listed_by_status() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_run(&conn, "r1");
        fixtures::seed_run(&conn, "r2");
        set_run_status(&conn, "r2", RunStatus::Running, None).unwrap();

        assert_eq!(list_run_ids_with_status(&conn, RunStatus::Running).unwrap(), vec!["r2"]);
        assert_eq!(list_run_ids_with_status(&conn, RunStatus::Queued).unwrap(), vec!["r1"]);
        assert!(list_run_ids_with_status(&conn, RunStatus::Paused).unwrap().is_empty());
    }

    #[test]
    fn run_round_trip() {
        let conn = open_memory_database().unwrap();
        let run = fixtures::run("r1");
        insert_run(&conn, &run).unwrap();

        let fetched = get_run(&conn, "r1").unwrap().unwrap();
        assert_eq!(fetched.model, run.model);
        assert_eq!(fetched.parameters, run.parameters);
        assert_eq!(fetched.status, RunStatus::Queued);
        assert!(!fetched.abandoned);
    }

    #[test]
    fn status_stamps_start_and_completion() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_run(&conn, "r1");

        set_run_status(&conn, "r1", RunStatus::Running, None).unwrap();
        let run = get_run(&conn, "r1").unwrap().unwrap();
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_none());

        set_run_status(&conn, "r1", RunStatus::Completed, None).unwrap();
        let run = get_run(&conn, "r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn pause_note_cleared_when_run_restarts() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_run(&conn, "r1");
        set_run_status(&conn, "r1", RunStatus::Running, None).unwrap();
        set_run_status(&conn, "r1", RunStatus::Paused, Some("interrupted by shutdown")).unwrap();
        assert_eq!(
            get_run(&conn, "r1").unwrap().unwrap().last_error.as_deref(),
            Some("interrupted by shutdown")
        );

        set_run_status(&conn, "r1", RunStatus::Running, None).unwrap();
        assert!(get_run(&conn, "r1").unwrap().unwrap().last_error.is_none());

        set_run_status(&conn, "r1", RunStatus::Failed, Some("disk full")).unwrap();
        set_run_status(&conn, "r1", RunStatus::Completed, None).unwrap();
        assert_eq!(get_run(&conn, "r1").unwrap().unwrap().last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn status_on_unknown_run_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = set_run_status(&conn, "ghost", RunStatus::Running, None).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn abandon_marks_terminal() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_run(&conn, "r1");
        mark_run_abandoned(&conn, "r1").unwrap();
        let run = get_run(&conn, "r1").unwrap().unwrap();
        assert!(run.abandoned);
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn attach_is_idempotent() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 4);
        fixtures::seed_run(&conn, "r1");
        assert_eq!(attach_documents(&conn, "r1").unwrap(), 0);
        assert_eq!(run_counters(&conn, "r1").unwrap().queued, 4);
    }

    #[test]
    fn claim_is_fifo_and_exclusive() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 3);
        fixtures::seed_run(&conn, "r1");

        let first = claim_next_document(&conn, "r1").unwrap().unwrap();
        let second = claim_next_document(&conn, "r1").unwrap().unwrap();
        assert_eq!(first.document_id, "doc-0");
        assert_eq!(second.document_id, "doc-1");
        assert_eq!(first.attempts, 1);

        let counters = run_counters(&conn, "r1").unwrap();
        assert_eq!(counters.processing, 2);
        assert_eq!(counters.queued, 1);
        assert_eq!(counters.total(), 3);
    }

    #[test]
    fn transition_requires_expected_status() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");

        let moved = transition_document(
            &conn, "r1", "doc-0",
            DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, 0,
        ).unwrap();
        assert!(!moved, "pending row must not move from in_flight");
    }

    #[test]
    fn requeue_unsettled_leaves_settled_rows() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 3);
        fixtures::seed_run(&conn, "r1");
        let a = claim_next_document(&conn, "r1").unwrap().unwrap();
        transition_document(&conn, "r1", &a.document_id, DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, 0).unwrap();
        claim_next_document(&conn, "r1").unwrap().unwrap();

        assert_eq!(requeue_unsettled(&conn, "r1").unwrap(), 1);
        let counters = run_counters(&conn, "r1").unwrap();
        assert_eq!(counters.done, 1);
        assert_eq!(counters.queued, 2);

        let doc = get_run_document(&conn, "r1", "doc-1").unwrap().unwrap();
        assert_eq!(doc.attempts, 1, "resume keeps the attempt count");
    }

    #[test]
    fn requeue_settles_rows_whose_result_was_written() {
        let conn = open_memory_database().unwrap();
        let docs = fixtures::seed_documents(&conn, 2);
        fixtures::seed_run(&conn, "r1");
        claim_next_document(&conn, "r1").unwrap().unwrap();
        claim_next_document(&conn, "r1").unwrap().unwrap();
        crate::db::repository::record_classification(
            &conn,
            &fixtures::classification(&docs[0], "r1", true, 0.9),
        )
        .unwrap();

        assert_eq!(requeue_unsettled(&conn, "r1").unwrap(), 1);
        let first = get_run_document(&conn, "r1", "doc-0").unwrap().unwrap();
        assert_eq!(first.status, DocumentRunStatus::Recorded);
        let second = get_run_document(&conn, "r1", "doc-1").unwrap().unwrap();
        assert_eq!(second.status, DocumentRunStatus::Pending);
    }

    #[test]
    fn requeue_all_resets_attempts() {
        let conn = open_memory_database().unwrap();
        fixtures::seed_documents(&conn, 1);
        fixtures::seed_run(&conn, "r1");
        claim_next_document(&conn, "r1").unwrap();
        requeue_all(&conn, "r1").unwrap();
        let doc = get_run_document(&conn, "r1", "doc-0").unwrap().unwrap();
        assert_eq!(doc.status, DocumentRunStatus::Pending);
        assert_eq!(doc.attempts, 0);
    }
}
