//! Process-wide inference slots: single point of access for model generation.
//!
//! A local inference server degrades for everyone when flooded. Every
//! generation call, from every run, first takes a slot here. A run may not
//! ask for more workers than there are slots, so a lone run is bounded by
//! its own concurrency; concurrent runs share the slots.
//!
//! **Design**:
//! - `InferenceService` lives in `CoreState` (shared via `Arc`)
//! - `acquire()` waits for a free slot
//! - `in_flight()` lists the running calls for `GET /api/health`
//! - `in_flight_for_run()` feeds the run status snapshot

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Snapshot of one running generation call.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub run_id: String,
    pub document_id: String,
    pub model: String,
    /// When the call started (ISO 8601).
    pub started_at: String,
}

// ═══════════════════════════════════════════════════════════
// InferenceService
// ═══════════════════════════════════════════════════════════

pub struct InferenceService {
    slots: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveOperation>>,
}

impl InferenceService {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a free slot. Hold the returned guard for the whole call.
    pub async fn acquire(&self, run_id: &str, document_id: &str, model: &str) -> InferenceSlot<'_> {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok();
        self.register(permit, run_id, document_id, model)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Running calls, oldest first.
    pub fn in_flight(&self) -> Vec<ActiveOperation> {
        let Ok(active) = self.active.lock() else {
            return Vec::new();
        };
        let mut ops: Vec<(u64, ActiveOperation)> =
            active.iter().map(|(id, op)| (*id, op.clone())).collect();
        ops.sort_by_key(|(id, _)| *id);
        ops.into_iter().map(|(_, op)| op).collect()
    }

    /// Number of running calls belonging to one run.
    pub fn in_flight_for_run(&self, run_id: &str) -> usize {
        self.active
            .lock()
            .map(|active| active.values().filter(|op| op.run_id == run_id).count())
            .unwrap_or(0)
    }

    // ── Internal ────────────────────────────────────────────

    fn register(
        &self,
        permit: Option<OwnedSemaphorePermit>,
        run_id: &str,
        document_id: &str,
        model: &str,
    ) -> InferenceSlot<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                id,
                ActiveOperation {
                    run_id: run_id.to_string(),
                    document_id: document_id.to_string(),
                    model: model.to_string(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                },
            );
        }
        InferenceSlot {
            _permit: permit,
            service: self,
            id,
        }
    }

    fn release(&self, id: u64) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
    }
}

impl Default for InferenceService {
    fn default() -> Self {
        Self::new(8)
    }
}

// ═══════════════════════════════════════════════════════════
// InferenceSlot: RAII slot token
// ═══════════════════════════════════════════════════════════

/// Dropping the slot frees it and clears the in-flight entry.
pub struct InferenceSlot<'a> {
    _permit: Option<OwnedSemaphorePermit>,
    service: &'a InferenceService,
    id: u64,
}

impl Drop for InferenceSlot<'_> {
    fn drop(&mut self) {
        self.service.release(self.id);
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
