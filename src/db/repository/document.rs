use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::format_timestamp;
use crate::db::DatabaseError;
use crate::models::{Document, EmailHeaders};

/// Outcome of one intake batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeSummary {
    pub inserted: usize,
    /// Same id already stored; the document was skipped.
    pub already_present: usize,
    /// Stored, but its body matches a document already in the corpus.
    pub duplicate_content: usize,
}

/// Store a batch in delivery order. Re-delivering an id is a no-op.
pub fn insert_documents(conn: &Connection, docs: &[Document]) -> Result<IntakeSummary, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = IntakeSummary::default();
    let mut next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM documents",
        [],
        |row| row.get(0),
    )?;
    let ingested_at = format_timestamp(&Utc::now());

    for doc in docs {
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
            params![doc.id],
            |row| row.get(0),
        )?;
        if exists {
            summary.already_present += 1;
            continue;
        }

        let twin: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE content_hash = ?1)",
            params![doc.content_hash],
            |row| row.get(0),
        )?;
        if twin {
            summary.duplicate_content += 1;
        }

        tx.execute(
            "INSERT INTO documents (id, seq, content_hash, subject, from_addr, to_addr, sent_at, body, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                doc.id,
                next_seq,
                doc.content_hash,
                doc.headers.subject,
                doc.headers.from,
                doc.headers.to,
                doc.headers.date,
                doc.text,
                ingested_at,
            ],
        )?;
        next_seq += 1;
        summary.inserted += 1;
    }

    tx.commit()?;
    tracing::info!(
        inserted = summary.inserted,
        already_present = summary.already_present,
        duplicate_content = summary.duplicate_content,
        "Document batch stored"
    );
    Ok(summary)
}

pub fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, content_hash, subject, from_addr, to_addr, sent_at, body
             FROM documents WHERE id = ?1",
            params![id],
            |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    content_hash: row.get(1)?,
                    subject: row.get(2)?,
                    from_addr: row.get(3)?,
                    to_addr: row.get(4)?,
                    sent_at: row.get(5)?,
                    body: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row.map(document_from_row))
}

pub fn count_documents(conn: &Connection) -> Result<u64, DatabaseError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
    Ok(n as u64)
}

struct DocumentRow {
    id: String,
    content_hash: String,
    subject: Option<String>,
    from_addr: Option<String>,
    to_addr: Option<String>,
    sent_at: Option<String>,
    body: String,
}

fn document_from_row(row: DocumentRow) -> Document {
    Document {
        id: row.id,
        content_hash: row.content_hash,
        text: row.body,
        headers: EmailHeaders {
            subject: row.subject,
            from: row.from_addr,
            to: row.to_addr,
            date: row.sent_at,
        },
    }
}
