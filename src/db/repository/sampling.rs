use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{format_timestamp, parse_json_column, parse_optional_timestamp, parse_timestamp, to_json_column};
use crate::db::DatabaseError;
use crate::models::{SamplingItem, SamplingSet};

const ITEM_COLUMNS: &str = "i.id, i.sampling_set_id, i.position, i.document_id, i.classification_id,
     i.stratum, i.human_label, i.reviewer, i.labeled_at";

/// Store a drawn set and its items in one transaction.
pub fn insert_sampling_set(
    conn: &Connection,
    set: &SamplingSet,
    items: &[SamplingItem],
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO sampling_sets (id, run_id, seed, requested_size, size, bins, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            set.id,
            set.run_id,
            set.seed as i64,
            set.requested_size as i64,
            set.size as i64,
            to_json_column("bins", &set.bins)?,
            format_timestamp(&set.created_at),
        ],
    )?;

    for item in items {
        tx.execute(
            "INSERT INTO sampling_items (id, sampling_set_id, position, document_id, classification_id,
             stratum, human_label, reviewer, labeled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL)",
            params![
                item.id,
                item.sampling_set_id,
                item.position as i64,
                item.document_id,
                item.classification_id,
                item.stratum as i64,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn get_sampling_set(conn: &Connection, id: &str) -> Result<Option<SamplingSet>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, run_id, seed, requested_size, size, bins, created_at
             FROM sampling_sets WHERE id = ?1",
            params![id],
            |row| {
                Ok(SetRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    seed: row.get(2)?,
                    requested_size: row.get(3)?,
                    size: row.get(4)?,
                    bins: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    row.map(set_from_row).transpose()
}

pub fn get_sampling_item(conn: &Connection, id: &str) -> Result<Option<SamplingItem>, DatabaseError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sampling_items i WHERE i.id = ?1");
    let row = conn.query_row(&sql, params![id], read_item_row).optional()?;
    row.map(item_from_row).transpose()
}

/// All items of a set in review order.
pub fn list_sampling_items(conn: &Connection, set_id: &str) -> Result<Vec<SamplingItem>, DatabaseError> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sampling_items i WHERE i.sampling_set_id = ?1 ORDER BY i.position ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![set_id], read_item_row)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(item_from_row(row?)?);
    }
    Ok(items)
}

/// A sampled item together with the prediction it was drawn for.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: SamplingItem,
    pub predicted_responsive: bool,
    pub confidence: f64,
}

pub fn list_scored_items(conn: &Connection, set_id: &str) -> Result<Vec<ScoredItem>, DatabaseError> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS}, c.responsive, c.confidence
         FROM sampling_items i JOIN classifications c ON c.id = i.classification_id
         WHERE i.sampling_set_id = ?1 ORDER BY i.position ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![set_id], |row| {
        Ok((read_item_row(row)?, row.get::<_, i32>(9)?, row.get::<_, f64>(10)?))
    })?;
    let mut items = Vec::new();
    for row in rows {
        let (item, responsive, confidence) = row?;
        items.push(ScoredItem {
            item: item_from_row(item)?,
            predicted_responsive: responsive != 0,
            confidence,
        });
    }
    Ok(items)
}

/// First unlabeled item in review order, with how many remain unlabeled.
pub fn next_unlabeled_item(
    conn: &Connection,
    set_id: &str,
) -> Result<Option<(SamplingItem, u64)>, DatabaseError> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sampling_items i
         WHERE i.sampling_set_id = ?1 AND i.human_label IS NULL
         ORDER BY i.position ASC LIMIT 1"
    );
    let Some(row) = conn.query_row(&sql, params![set_id], read_item_row).optional()? else {
        return Ok(None);
    };
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sampling_items WHERE sampling_set_id = ?1 AND human_label IS NULL",
        params![set_id],
        |row| row.get(0),
    )?;
    Ok(Some((item_from_row(row)?, remaining as u64)))
}

/// Write a label. When the item already carries one, the prior label is
/// copied into `label_history` first, in the same transaction.
pub fn write_label(
    conn: &Connection,
    item_id: &str,
    label: bool,
    reviewer: &str,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO label_history (item_id, human_label, reviewer, labeled_at, archived_at)
         SELECT id, human_label, reviewer, labeled_at, ?2 FROM sampling_items
         WHERE id = ?1 AND human_label IS NOT NULL",
        params![item_id, format_timestamp(at)],
    )?;
    let changed = tx.execute(
        "UPDATE sampling_items SET human_label = ?2, reviewer = ?3, labeled_at = ?4 WHERE id = ?1",
        params![item_id, label as i32, reviewer, format_timestamp(at)],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("SamplingItem", item_id));
    }
    tx.commit()?;
    Ok(())
}

/// Archived labels for an item, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedLabel {
    pub human_label: bool,
    pub reviewer: String,
    pub labeled_at: DateTime<Utc>,
}

pub fn label_history(conn: &Connection, item_id: &str) -> Result<Vec<ArchivedLabel>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT human_label, reviewer, labeled_at FROM label_history WHERE item_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![item_id], |row| {
        Ok((row.get::<_, i32>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (label, reviewer, labeled_at) = row?;
        out.push(ArchivedLabel {
            human_label: label != 0,
            reviewer,
            labeled_at: parse_timestamp("labeled_at", &labeled_at)?,
        });
    }
    Ok(out)
}

struct SetRow {
    id: String,
    run_id: String,
    seed: i64,
    requested_size: i64,
    size: i64,
    bins: String,
    created_at: String,
}

fn set_from_row(row: SetRow) -> Result<SamplingSet, DatabaseError> {
    Ok(SamplingSet {
        id: row.id,
        run_id: row.run_id,
        seed: row.seed as u64,
        requested_size: row.requested_size as u64,
        size: row.size as u64,
        bins: parse_json_column("bins", &row.bins)?,
        created_at: parse_timestamp("created_at", &row.created_at)?,
    })
}

struct ItemRow {
    id: String,
    sampling_set_id: String,
    position: i64,
    document_id: String,
    classification_id: String,
    stratum: i64,
    human_label: Option<i32>,
    reviewer: Option<String>,
    labeled_at: Option<String>,
}

fn read_item_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        sampling_set_id: row.get(1)?,
        position: row.get(2)?,
        document_id: row.get(3)?,
        classification_id: row.get(4)?,
        stratum: row.get(5)?,
        human_label: row.get(6)?,
        reviewer: row.get(7)?,
        labeled_at: row.get(8)?,
    })
}

fn item_from_row(row: ItemRow) -> Result<SamplingItem, DatabaseError> {
    Ok(SamplingItem {
        id: row.id,
        sampling_set_id: row.sampling_set_id,
        position: row.position as u64,
        document_id: row.document_id,
        classification_id: row.classification_id,
        stratum: row.stratum as usize,
        human_label: row.human_label.map(|v| v != 0),
        reviewer: row.reviewer,
        labeled_at: parse_optional_timestamp("labeled_at", row.labeled_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::repository::{fixtures, record_classification};
    use crate::models::StratumBin;

    fn seed_set(conn: &Connection) -> (SamplingSet, Vec<SamplingItem>) {
        let docs = fixtures::seed_documents(conn, 2);
        fixtures::seed_run(conn, "r1");
        let mut items = Vec::new();
        let set = SamplingSet {
            id: "s1".into(),
            run_id: "r1".into(),
            seed: u64::MAX,
            requested_size: 3,
            size: 2,
            bins: vec![StratumBin::new(true, 0.0, 1.0), StratumBin::new(false, 0.0, 1.0)],
            created_at: fixtures::now(),
        };
        for (i, doc) in docs.iter().enumerate() {
            let c = fixtures::classification(doc, "r1", i == 0, 0.7);
            record_classification(conn, &c).unwrap();
            items.push(SamplingItem {
                id: format!("item-{i}"),
                sampling_set_id: "s1".into(),
                position: i as u64,
                document_id: doc.id.clone(),
                classification_id: c.id.clone(),
                stratum: i,
                human_label: None,
                reviewer: None,
                labeled_at: None,
            });
        }
        insert_sampling_set(conn, &set, &items).unwrap();
        (set, items)
    }

    #[test]
    fn set_round_trip_preserves_full_seed() {
        let conn = open_memory_database().unwrap();
        let (set, _) = seed_set(&conn);
        let fetched = get_sampling_set(&conn, "s1").unwrap().unwrap();
        assert_eq!(fetched.seed, u64::MAX);
        assert_eq!(fetched.bins, set.bins);
        assert_eq!(fetched.shortfall(), 1);
    }

    #[test]
    fn next_unlabeled_walks_positions() {
        let conn = open_memory_database().unwrap();
        seed_set(&conn);

        let (first, remaining) = next_unlabeled_item(&conn, "s1").unwrap().unwrap();
        assert_eq!(first.id, "item-0");
        assert_eq!(remaining, 2);

        write_label(&conn, "item-0", true, "reviewer-a", &Utc::now()).unwrap();
        let (second, remaining) = next_unlabeled_item(&conn, "s1").unwrap().unwrap();
        assert_eq!(second.id, "item-1");
        assert_eq!(remaining, 1);

        write_label(&conn, "item-1", false, "reviewer-a", &Utc::now()).unwrap();
        assert!(next_unlabeled_item(&conn, "s1").unwrap().is_none());
    }

    #[test]
    fn relabel_archives_previous() {
        let conn = open_memory_database().unwrap();
        seed_set(&conn);
        write_label(&conn, "item-0", true, "first", &Utc::now()).unwrap();
        assert!(label_history(&conn, "item-0").unwrap().is_empty());

        write_label(&conn, "item-0", false, "second", &Utc::now()).unwrap();
        let history = label_history(&conn, "item-0").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].human_label);
        assert_eq!(history[0].reviewer, "first");

        let item = get_sampling_item(&conn, "item-0").unwrap().unwrap();
        assert_eq!(item.human_label, Some(false));
        assert_eq!(item.reviewer.as_deref(), Some("second"));
    }

    #[test]
    fn scored_items_carry_predictions() {
        let conn = open_memory_database().unwrap();
        seed_set(&conn);
        let scored = list_scored_items(&conn, "s1").unwrap();
        assert_eq!(scored.len(), 2);
        assert!(scored[0].predicted_responsive);
        assert!(!scored[1].predicted_responsive);
    }

    #[test]
    fn label_unknown_item_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = write_label(&conn, "ghost", true, "r", &Utc::now()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
