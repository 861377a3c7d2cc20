//! `create_sample`: stratify a run's active classifications by caller bins,
//! draw a proportional share from each with a seeded shuffle, then shuffle
//! the draw once more to fix the review order.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::allocation::allocate;
use super::SamplingError;
use crate::db;
use crate::models::{validate_bins, Classification, SamplingItem, SamplingSet, StratumBin};

#[derive(Debug, Clone, Deserialize)]
pub struct SampleRequest {
    pub run_id: String,
    pub size: u64,
    pub seed: u64,
    pub bins: Vec<StratumBin>,
}

/// Population and draw for one stratum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumDraw {
    pub stratum: usize,
    pub label: String,
    pub population: u64,
    pub drawn: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleDraw {
    pub set: SamplingSet,
    pub strata: Vec<StratumDraw>,
    /// Requested minus drawn; non-zero when the eligible population was smaller.
    pub shortfall: u64,
    pub unbinned: u64,
}

pub fn create_sample(conn: &Connection, req: &SampleRequest) -> Result<SampleDraw, SamplingError> {
    if req.size == 0 {
        return Err(SamplingError::InvalidRequest("size must be positive".into()));
    }
    validate_bins(&req.bins).map_err(SamplingError::InvalidRequest)?;
    if db::get_run(conn, &req.run_id)?.is_none() {
        return Err(SamplingError::RunNotFound(req.run_id.clone()));
    }

    // Ingestion order, so the seeded shuffle sees a stable input.
    let classifications = db::list_active_classifications(conn, &req.run_id)?;
    let mut strata: Vec<Vec<&Classification>> = vec![Vec::new(); req.bins.len()];
    let mut unbinned = 0u64;
    for c in &classifications {
        match req.bins.iter().position(|b| b.contains(c.responsive, c.confidence)) {
            Some(i) => strata[i].push(c),
            None => unbinned += 1,
        }
    }

    let populations: Vec<usize> = strata.iter().map(Vec::len).collect();
    let size = usize::try_from(req.size).unwrap_or(usize::MAX);
    let seats = allocate(&populations, size);

    let mut rng = StdRng::seed_from_u64(req.seed);
    let mut drawn: Vec<(usize, &Classification)> = Vec::new();
    for (stratum, members) in strata.iter_mut().enumerate() {
        members.shuffle(&mut rng);
        drawn.extend(members.iter().take(seats[stratum]).map(|c| (stratum, *c)));
    }
    drawn.shuffle(&mut rng);

    let set = SamplingSet {
        id: Uuid::new_v4().to_string(),
        run_id: req.run_id.clone(),
        seed: req.seed,
        requested_size: req.size,
        size: drawn.len() as u64,
        bins: req.bins.clone(),
        created_at: Utc::now(),
    };
    let items: Vec<SamplingItem> = drawn
        .iter()
        .enumerate()
        .map(|(position, (stratum, c))| SamplingItem {
            id: Uuid::new_v4().to_string(),
            sampling_set_id: set.id.clone(),
            position: position as u64,
            document_id: c.document_id.clone(),
            classification_id: c.id.clone(),
            stratum: *stratum,
            human_label: None,
            reviewer: None,
            labeled_at: None,
        })
        .collect();

    db::insert_sampling_set(conn, &set, &items)?;

    let strata = req
        .bins
        .iter()
        .enumerate()
        .map(|(i, bin)| StratumDraw {
            stratum: i,
            label: bin.label(),
            population: populations[i] as u64,
            drawn: seats[i] as u64,
        })
        .collect();

    let shortfall = set.shortfall();
    if shortfall > 0 {
        tracing::warn!(
            sampling_set_id = %set.id,
            requested = set.requested_size,
            drawn = set.size,
            "Eligible population smaller than requested sample"
        );
    }
    tracing::info!(
        sampling_set_id = %set.id,
        run_id = %set.run_id,
        seed = set.seed,
        size = set.size,
        unbinned,
        "Sampling set created"
    );

    Ok(SampleDraw {
        set,
        strata,
        shortfall,
        unbinned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;
    use crate::db::{open_memory_database, DatabaseError};
    use crate::models::enums::DocumentRunStatus;

    /// Seed `confidences.len()` documents and record one classification each.
    fn classified_run(conn: &Connection, confidences: &[(bool, f64)]) {
        let docs = fixtures::seed_documents(conn, confidences.len());
        fixtures::seed_run(conn, "r1");
        for (doc, &(responsive, confidence)) in docs.iter().zip(confidences) {
            db::claim_next_document(conn, "r1").unwrap();
            db::record_classification(conn, &fixtures::classification(doc, "r1", responsive, confidence)).unwrap();
            db::transition_document(
                conn, "r1", &doc.id,
                DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, 0,
            )
            .unwrap();
        }
    }

    fn two_bins() -> Vec<StratumBin> {
        vec![StratumBin::new(true, 0.0, 0.3), StratumBin::new(true, 0.8, 1.0)]
    }

    fn request(size: u64, seed: u64, bins: Vec<StratumBin>) -> SampleRequest {
        SampleRequest {
            run_id: "r1".into(),
            size,
            seed,
            bins,
        }
    }

    fn drawn_documents(conn: &Connection, set_id: &str) -> Vec<String> {
        db::list_sampling_items(conn, set_id)
            .unwrap()
            .into_iter()
            .map(|i| i.document_id)
            .collect()
    }

    #[test]
    fn three_low_seven_high_draws_one_and_three() {
        let conn = open_memory_database().unwrap();
        let mut scores = vec![(true, 0.2); 3];
        scores.extend(vec![(true, 0.9); 7]);
        classified_run(&conn, &scores);

        let draw = create_sample(&conn, &request(4, 42, two_bins())).unwrap();
        assert_eq!(draw.set.size, 4);
        assert_eq!(draw.strata[0].drawn, 1);
        assert_eq!(draw.strata[1].drawn, 3);
        assert_eq!(draw.strata[0].population, 3);
        assert_eq!(draw.shortfall, 0);

        let items = db::list_sampling_items(&conn, &draw.set.id).unwrap();
        assert_eq!(items.iter().filter(|i| i.stratum == 0).count(), 1);
        let positions: Vec<u64> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn same_seed_reproduces_the_draw() {
        let conn = open_memory_database().unwrap();
        let scores: Vec<(bool, f64)> = (0..40).map(|i| (i % 3 != 0, (i as f64) / 40.0)).collect();
        classified_run(&conn, &scores);
        let bins = vec![
            StratumBin::new(true, 0.0, 0.5),
            StratumBin::new(true, 0.5, 1.0),
            StratumBin::new(false, 0.0, 1.0),
        ];

        let a = create_sample(&conn, &request(12, 42, bins.clone())).unwrap();
        let b = create_sample(&conn, &request(12, 42, bins.clone())).unwrap();
        assert_ne!(a.set.id, b.set.id);
        assert_eq!(drawn_documents(&conn, &a.set.id), drawn_documents(&conn, &b.set.id));

        let c = create_sample(&conn, &request(12, 7, bins)).unwrap();
        assert_ne!(drawn_documents(&conn, &a.set.id), drawn_documents(&conn, &c.set.id));
    }

    #[test]
    fn small_population_returns_everything_with_shortfall() {
        let conn = open_memory_database().unwrap();
        classified_run(&conn, &[(true, 0.9), (true, 0.1), (true, 0.5)]);

        let draw = create_sample(&conn, &request(10, 1, two_bins())).unwrap();
        assert_eq!(draw.set.size, 2);
        assert_eq!(draw.set.requested_size, 10);
        assert_eq!(draw.shortfall, 8);
        assert_eq!(draw.unbinned, 1);

        let stored = db::get_sampling_set(&conn, &draw.set.id).unwrap().unwrap();
        assert_eq!(stored.shortfall(), 8);
        assert_eq!(stored.bins, two_bins());
    }

    #[test]
    fn full_confidence_lands_in_closed_top_bin() {
        let conn = open_memory_database().unwrap();
        classified_run(&conn, &[(true, 1.0)]);
        let draw = create_sample(&conn, &request(1, 3, two_bins())).unwrap();
        assert_eq!(draw.strata[1].population, 1);
        assert_eq!(draw.set.size, 1);
    }

    #[test]
    fn rejects_bad_requests() {
        let conn = open_memory_database().unwrap();
        classified_run(&conn, &[(true, 0.9)]);

        let zero = create_sample(&conn, &request(0, 1, two_bins()));
        assert!(matches!(zero, Err(SamplingError::InvalidRequest(_))));

        let overlapping = vec![StratumBin::new(true, 0.0, 0.6), StratumBin::new(true, 0.5, 1.0)];
        assert!(matches!(
            create_sample(&conn, &request(2, 1, overlapping)),
            Err(SamplingError::InvalidRequest(_))
        ));

        let mut ghost = request(2, 1, two_bins());
        ghost.run_id = "ghost".into();
        assert!(matches!(create_sample(&conn, &ghost), Err(SamplingError::RunNotFound(_))));
    }

    #[test]
    fn superseded_classifications_are_not_eligible() -> Result<(), DatabaseError> {
        let conn = open_memory_database()?;
        classified_run(&conn, &[(true, 0.9), (true, 0.9)]);
        let doc = db::get_document(&conn, "doc-0")?.unwrap();
        // A forced re-run moved doc-0 out of the high bin.
        db::record_classification(&conn, &fixtures::classification(&doc, "r1", true, 0.1))?;

        let draw = create_sample(&conn, &request(5, 9, two_bins())).unwrap();
        assert_eq!(draw.strata[0].population, 1);
        assert_eq!(draw.strata[1].population, 1);
        Ok(())
    }
}
