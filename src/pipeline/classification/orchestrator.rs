//! Classification orchestrator: the run-level state machine.
//!
//! Per document within a run:
//! `pending → in_flight → {recorded | retrying | dead_lettered}`,
//! `retrying → in_flight` after backoff. Workers claim pending documents
//! FIFO by ingestion order with a compare-and-swap on status; completion
//! order is not guaranteed. A run completes once every document is recorded
//! or dead-lettered. Cancellation stops claiming; in-flight calls finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::gateway::{GatewayError, GenerationRequest, ModelGateway};
use super::parser::{parse_response, ParsedClassification};
use super::prompt::PromptBuilder;
use super::ClassifyError;
use crate::db::{self, Database, DatabaseError};
use crate::inference_service::InferenceService;
use crate::models::enums::{DocumentRunStatus, FailureKind, RunStatus};
use crate::models::{Classification, ClassificationRun, DeadLetter, Document, RunDocument, RunParameters, RunSnapshot};

const SYSTEM_RESOLVER: &str = "system";
const GATEWAY_LOST_NOTE: &str = "model gateway became unavailable";

// ═══════════════════════════════════════════════════════════
// Configuration and requests
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub generation_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub low_confidence_threshold: f64,
    /// Used when a start request carries no parameters.
    pub default_parameters: RunParameters,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            generation_timeout: Duration::from_secs(120),
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            low_confidence_threshold: 0.65,
            default_parameters: RunParameters::default(),
        }
    }
}

/// `startRun` input. Re-issuing it with an existing `run_id` resumes that run.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub model: String,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default)]
    pub parameters: Option<RunParameters>,
    #[serde(default)]
    pub force: bool,
}

/// Whether a run's results can be handed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReadiness {
    pub run_id: String,
    pub run_completed: bool,
    pub unresolved_dead_letters: u64,
    pub low_confidence: u64,
    pub ready: bool,
}

// ═══════════════════════════════════════════════════════════
// Run control
// ═══════════════════════════════════════════════════════════

/// Stop signals shared by the workers of one active run.
#[derive(Default)]
struct RunControl {
    cancel: AtomicBool,
    abandon: AtomicBool,
    gateway_lost: AtomicBool,
    fatal: AtomicBool,
    wake: Notify,
}

impl RunControl {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
            || self.abandon.load(Ordering::SeqCst)
            || self.gateway_lost.load(Ordering::SeqCst)
            || self.fatal.load(Ordering::SeqCst)
    }

    fn raise(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Sleep for `delay`, waking early on any stop signal.
    /// Returns false when interrupted.
    async fn sleep(&self, delay: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.should_stop() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.should_stop(),
            _ = notified => false,
        }
    }
}

/// Everything a worker needs about the run it serves.
struct RunContext {
    run: ClassificationRun,
    policy: RetryPolicy,
    force: bool,
    control: Arc<RunControl>,
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct Orchestrator {
    db: Arc<Database>,
    gateway: Arc<dyn ModelGateway>,
    prompts: Arc<PromptBuilder>,
    inference: Arc<InferenceService>,
    settings: OrchestratorSettings,
    active: Mutex<HashMap<String, Arc<RunControl>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn ModelGateway>,
        prompts: Arc<PromptBuilder>,
        inference: Arc<InferenceService>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            prompts,
            inference,
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Validate, persist and launch (or resume) a run. Returns once the
    /// background workers are spawned; progress is observed by polling.
    pub async fn start_run(self: &Arc<Self>, req: StartRunRequest) -> Result<RunSnapshot, ClassifyError> {
        let prompt_version = self.check_request(&req)?;

        if !self.gateway.is_alive().await {
            return Err(ClassifyError::GatewayUnavailable(
                "liveness probe failed; is the inference service running?".into(),
            ));
        }

        let run_id = req
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let control = {
            let mut active = self.controls();
            if active.contains_key(&run_id) {
                return Err(ClassifyError::AlreadyRunning(run_id));
            }
            let control = Arc::new(RunControl::default());
            active.insert(run_id.clone(), Arc::clone(&control));
            control
        };

        let prepared = self
            .db
            .with_conn(|conn| prepare_run(conn, &run_id, &req, &prompt_version, &self.settings.default_parameters));
        let run = match prepared {
            Ok(run) => run,
            Err(e) => {
                self.controls().remove(&run_id);
                return Err(e);
            }
        };

        let ctx = Arc::new(RunContext {
            policy: RetryPolicy {
                max_attempts: run.parameters.max_attempts,
                base_delay: self.settings.base_delay,
                max_delay: self.settings.max_delay,
            },
            force: req.force,
            control,
            run,
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(ctx).await });

        self.get_run_status(&run_id)
    }

    /// Counters and status for polling observers.
    pub fn get_run_status(&self, run_id: &str) -> Result<RunSnapshot, ClassifyError> {
        let (run, counters) = self.db.with_conn(|conn| {
            let run = db::get_run(conn, run_id)?
                .ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))?;
            let counters = db::run_counters(conn, run_id)?;
            Ok::<_, ClassifyError>((run, counters))
        })?;

        let cancel_requested = self.control(run_id).is_some_and(|c| {
            c.cancel.load(Ordering::SeqCst) || c.abandon.load(Ordering::SeqCst)
        });

        Ok(RunSnapshot {
            total: counters.total(),
            counters,
            cancel_requested,
            in_flight_calls: self.inference.in_flight_for_run(run_id),
            run,
        })
    }

    /// Stop claiming new documents. The run pauses once in-flight calls finish.
    pub fn cancel_run(&self, run_id: &str) -> Result<RunSnapshot, ClassifyError> {
        if let Some(control) = self.control(run_id) {
            tracing::info!(run_id = %run_id, "Cancel requested");
            control.raise(&control.cancel);
        } else {
            self.db.with_conn(|conn| {
                let run = db::get_run(conn, run_id)?
                    .ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))?;
                // A run left "running" by a crashed process has no workers.
                if run.status == RunStatus::Running {
                    db::requeue_unsettled(conn, run_id)?;
                    db::set_run_status(conn, run_id, RunStatus::Paused, None)?;
                }
                Ok::<_, ClassifyError>(())
            })?;
        }
        self.get_run_status(run_id)
    }

    /// Stop the run for good. A later start on it is rejected.
    pub fn abandon_run(&self, run_id: &str) -> Result<RunSnapshot, ClassifyError> {
        let control = self.control(run_id);
        if let Some(control) = &control {
            control.raise(&control.abandon);
        }

        self.db.with_conn(|conn| {
            let run = db::get_run(conn, run_id)?
                .ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))?;
            if run.abandoned {
                return Ok(());
            }
            if run.status == RunStatus::Completed {
                return Err(ClassifyError::InvalidConfig(format!(
                    "run {run_id} already completed"
                )));
            }
            db::mark_run_abandoned(conn, run_id)?;
            if control.is_none() {
                db::requeue_unsettled(conn, run_id)?;
            }
            Ok(())
        })?;

        tracing::info!(run_id = %run_id, "Run abandoned");
        self.get_run_status(run_id)
    }

    /// True while the run has live workers in this process.
    pub fn is_active(&self, run_id: &str) -> bool {
        self.controls().contains_key(run_id)
    }

    /// Signal every active run to stop claiming. Returns their ids.
    pub fn cancel_all(&self) -> Vec<String> {
        let active = self.controls();
        for control in active.values() {
            control.raise(&control.cancel);
        }
        active.keys().cloned().collect()
    }

    /// Pause runs a previous process left marked `running`. Call once at
    /// startup, before any run is started.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, ClassifyError> {
        let active: Vec<String> = self.controls().keys().cloned().collect();
        let recovered = self.db.with_conn(|conn| {
            let mut recovered = Vec::new();
            for run_id in db::list_run_ids_with_status(conn, RunStatus::Running)? {
                if active.contains(&run_id) {
                    continue;
                }
                let requeued = db::requeue_unsettled(conn, &run_id)?;
                db::set_run_status(conn, &run_id, RunStatus::Paused, Some("interrupted by shutdown"))?;
                tracing::warn!(run_id = %run_id, requeued, "Interrupted run paused");
                recovered.push(run_id);
            }
            Ok::<_, DatabaseError>(recovered)
        })?;
        Ok(recovered)
    }

    // ── Manual-review queues ────────────────────────────────

    pub fn list_dead_letters(&self, run_id: &str, include_resolved: bool) -> Result<Vec<DeadLetter>, ClassifyError> {
        self.db.with_conn(|conn| {
            ensure_run(conn, run_id)?;
            Ok(db::list_dead_letters(conn, run_id, include_resolved)?)
        })
    }

    pub fn resolve_dead_letter(
        &self,
        id: &str,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<DeadLetter, ClassifyError> {
        if resolved_by.trim().is_empty() {
            return Err(ClassifyError::InvalidConfig("resolved_by must not be empty".into()));
        }
        self.db
            .with_conn(|conn| db::resolve_dead_letter(conn, id, resolved_by, note))
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => ClassifyError::DeadLetterNotFound(id.to_string()),
                DatabaseError::ConstraintViolation(_) => ClassifyError::AlreadyResolved(id.to_string()),
                other => ClassifyError::Database(other),
            })
    }

    /// Active classifications below `threshold` (configured default when `None`).
    pub fn low_confidence(&self, run_id: &str, threshold: Option<f64>) -> Result<Vec<Classification>, ClassifyError> {
        let threshold = threshold.unwrap_or(self.settings.low_confidence_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ClassifyError::InvalidConfig(format!(
                "threshold {threshold} outside [0, 1]"
            )));
        }
        self.db.with_conn(|conn| {
            ensure_run(conn, run_id)?;
            Ok(db::list_low_confidence(conn, run_id, threshold)?)
        })
    }

    /// A run is ready for export once it completed and every dead letter was
    /// consciously resolved.
    pub fn export_readiness(&self, run_id: &str) -> Result<ExportReadiness, ClassifyError> {
        let threshold = self.settings.low_confidence_threshold;
        self.db.with_conn(|conn| {
            let run = db::get_run(conn, run_id)?
                .ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))?;
            let unresolved = db::count_unresolved_dead_letters(conn, run_id)?;
            let low = db::list_low_confidence(conn, run_id, threshold)?.len() as u64;
            let run_completed = run.status == RunStatus::Completed;
            Ok(ExportReadiness {
                run_id: run_id.to_string(),
                run_completed,
                unresolved_dead_letters: unresolved,
                low_confidence: low,
                ready: run_completed && unresolved == 0,
            })
        })
    }

    // ── Internal: run driver ────────────────────────────────

    async fn drive(self: Arc<Self>, ctx: Arc<RunContext>) {
        let run_id = ctx.run.run_id.clone();
        let concurrency = ctx.run.parameters.concurrency.max(1);
        tracing::info!(
            run_id = %run_id,
            model = %ctx.run.model,
            prompt_version = %ctx.run.prompt_version,
            concurrency,
            force = ctx.force,
            "Classification run started"
        );

        let workers = (0..concurrency).map(|worker| self.worker(&ctx, worker));
        let results = futures_util::future::join_all(workers).await;
        let fatal = results.into_iter().find_map(Result::err);

        self.finish(&ctx, fatal);
        self.controls().remove(&run_id);
    }

    async fn worker(&self, ctx: &RunContext, worker: usize) -> Result<(), DatabaseError> {
        loop {
            if ctx.control.should_stop() {
                return Ok(());
            }
            let Some(claimed) = self
                .db
                .with_conn(|conn| db::claim_next_document(conn, &ctx.run.run_id))?
            else {
                return Ok(());
            };

            tracing::debug!(
                run_id = %ctx.run.run_id,
                document_id = %claimed.document_id,
                attempt = claimed.attempts,
                worker,
                "Document claimed"
            );

            if let Err(e) = self.process(ctx, &claimed).await {
                ctx.control.raise(&ctx.control.fatal);
                return Err(e);
            }
        }
    }

    async fn process(&self, ctx: &RunContext, claimed: &RunDocument) -> Result<(), DatabaseError> {
        let run_id = ctx.run.run_id.as_str();
        let doc = self
            .db
            .with_conn(|conn| db::get_document(conn, &claimed.document_id))?
            .ok_or_else(|| DatabaseError::not_found("Document", &claimed.document_id))?;

        if !ctx.force && self.try_reuse(run_id, &doc)? {
            return Ok(());
        }

        let prompt = self.prompts.build(&doc);
        let mut attempt = claimed.attempts;

        loop {
            let request = GenerationRequest {
                model: ctx.run.model.clone(),
                prompt: prompt.clone(),
                temperature: ctx.run.parameters.temperature,
                top_p: ctx.run.parameters.top_p,
                max_tokens: ctx.run.parameters.max_tokens,
                timeout: self.settings.generation_timeout,
            };

            let outcome = {
                let _slot = self.inference.acquire(run_id, &doc.id, &ctx.run.model).await;
                match tokio::time::timeout(self.settings.generation_timeout, self.gateway.generate(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(self.settings.generation_timeout)),
                }
            };

            let (kind, message) = match outcome {
                Ok(text) => match parse_response(&text) {
                    Ok(parsed) => return self.record(run_id, &doc, attempt, parsed),
                    Err(failure) => (failure.kind(), failure.to_string()),
                },
                Err(e @ GatewayError::Timeout(_)) => (FailureKind::GatewayTimeout, e.to_string()),
                Err(e) => {
                    if !self.gateway.is_alive().await {
                        tracing::warn!(
                            run_id = %run_id,
                            document_id = %doc.id,
                            error = %e,
                            "Model gateway unreachable, pausing run"
                        );
                        ctx.control.raise(&ctx.control.gateway_lost);
                        // The attempt never reached a model; give it back.
                        self.db.with_conn(|conn| {
                            db::transition_document(
                                conn, run_id, &doc.id,
                                DocumentRunStatus::InFlight, DocumentRunStatus::Pending, -1,
                            )
                        })?;
                        return Ok(());
                    }
                    (FailureKind::GatewayUnavailable, e.to_string())
                }
            };

            if ctx.policy.is_exhausted(attempt) {
                return self.dead_letter(run_id, &doc, attempt, kind, &message);
            }

            let delay = ctx.policy.delay_after(attempt);
            tracing::warn!(
                run_id = %run_id,
                document_id = %doc.id,
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Classification attempt failed, retrying"
            );
            self.db.with_conn(|conn| {
                db::transition_document(
                    conn, run_id, &doc.id,
                    DocumentRunStatus::InFlight, DocumentRunStatus::Retrying, 0,
                )
            })?;

            if !ctx.control.sleep(delay).await {
                self.db.with_conn(|conn| {
                    db::transition_document(
                        conn, run_id, &doc.id,
                        DocumentRunStatus::Retrying, DocumentRunStatus::Pending, 0,
                    )
                })?;
                return Ok(());
            }

            self.db.with_conn(|conn| {
                db::transition_document(
                    conn, run_id, &doc.id,
                    DocumentRunStatus::Retrying, DocumentRunStatus::InFlight, 1,
                )
            })?;
            attempt += 1;
        }
    }

    /// Copy the result of an identical document already recorded in this run.
    fn try_reuse(&self, run_id: &str, doc: &Document) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| {
            let Some(twin) = db::find_reusable_classification(conn, run_id, &doc.content_hash, &doc.id)? else {
                return Ok(false);
            };
            let copy = Classification {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                run_id: run_id.to_string(),
                content_hash: doc.content_hash.clone(),
                responsive: twin.responsive,
                confidence: twin.confidence,
                reason: twin.reason.clone(),
                labels: twin.labels.clone(),
                attempt: 0,
                reused_from: Some(twin.id.clone()),
                superseded_by: None,
                created_at: Utc::now(),
            };
            db::record_classification(conn, &copy)?;
            db::transition_document(
                conn, run_id, &doc.id,
                DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, -1,
            )?;
            tracing::debug!(
                run_id = %run_id,
                document_id = %doc.id,
                reused_from = %twin.id,
                "Reused classification of identical document"
            );
            Ok(true)
        })
    }

    fn record(&self, run_id: &str, doc: &Document, attempt: u32, parsed: ParsedClassification) -> Result<(), DatabaseError> {
        if !parsed.adjustments.is_empty() {
            tracing::debug!(
                run_id = %run_id,
                document_id = %doc.id,
                adjustments = ?parsed.adjustments,
                "Model output fields adjusted"
            );
        }
        let classification = Classification {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            run_id: run_id.to_string(),
            content_hash: doc.content_hash.clone(),
            responsive: parsed.responsive,
            confidence: parsed.confidence,
            reason: parsed.reason,
            labels: parsed.labels,
            attempt,
            reused_from: None,
            superseded_by: None,
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            let previous = db::record_classification(conn, &classification)?;
            db::transition_document(
                conn, run_id, &doc.id,
                DocumentRunStatus::InFlight, DocumentRunStatus::Recorded, 0,
            )?;
            tracing::debug!(
                run_id = %run_id,
                document_id = %doc.id,
                attempt,
                responsive = classification.responsive,
                confidence = classification.confidence,
                superseded = previous.is_some(),
                "Classification recorded"
            );
            Ok(())
        })
    }

    fn dead_letter(
        &self,
        run_id: &str,
        doc: &Document,
        attempts: u32,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), DatabaseError> {
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            document_id: doc.id.clone(),
            attempts,
            error_kind: kind,
            error_message: message.to_string(),
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        };
        self.db.with_conn(|conn| {
            db::insert_dead_letter(conn, &letter)?;
            db::transition_document(
                conn, run_id, &doc.id,
                DocumentRunStatus::InFlight, DocumentRunStatus::DeadLettered, 0,
            )?;
            Ok::<_, DatabaseError>(())
        })?;
        tracing::warn!(
            run_id = %run_id,
            document_id = %doc.id,
            attempts,
            kind = %kind,
            error = %message,
            "Attempts exhausted, document dead-lettered"
        );
        Ok(())
    }

    fn finish(&self, ctx: &RunContext, fatal: Option<DatabaseError>) {
        let run_id = ctx.run.run_id.as_str();
        let control = &ctx.control;

        let outcome = self.db.with_conn(|conn| {
            if let Some(e) = &fatal {
                db::requeue_unsettled(conn, run_id)?;
                db::set_run_status(conn, run_id, RunStatus::Failed, Some(&e.to_string()))?;
                return Ok(RunStatus::Failed);
            }
            if control.abandon.load(Ordering::SeqCst) {
                db::requeue_unsettled(conn, run_id)?;
                return Ok(RunStatus::Failed);
            }
            if db::run_counters(conn, run_id)?.is_settled() {
                db::set_run_status(conn, run_id, RunStatus::Completed, None)?;
                return Ok(RunStatus::Completed);
            }
            db::requeue_unsettled(conn, run_id)?;
            let note = control
                .gateway_lost
                .load(Ordering::SeqCst)
                .then_some(GATEWAY_LOST_NOTE);
            db::set_run_status(conn, run_id, RunStatus::Paused, note)?;
            Ok::<_, DatabaseError>(RunStatus::Paused)
        });

        match outcome {
            Ok(status) => {
                if let Some(e) = fatal {
                    tracing::error!(run_id = %run_id, error = %e, "Classification run failed");
                } else {
                    tracing::info!(run_id = %run_id, status = %status, "Classification run stopped");
                }
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Cannot record final run status");
            }
        }
    }

    fn check_request(&self, req: &StartRunRequest) -> Result<String, ClassifyError> {
        if req.model.trim().is_empty() {
            return Err(ClassifyError::InvalidConfig("model must not be empty".into()));
        }
        if let Some(params) = &req.parameters {
            validate_parameters(params)?;
            let slots = self.inference.capacity();
            if params.concurrency > slots {
                return Err(ClassifyError::InvalidConfig(format!(
                    "concurrency {} exceeds the {slots} inference slots",
                    params.concurrency
                )));
            }
        }
        if let Some(id) = &req.run_id {
            if id.trim().is_empty() {
                return Err(ClassifyError::InvalidConfig("run_id must not be empty".into()));
            }
        }
        match &req.prompt_version {
            Some(v) if v != self.prompts.version() => Err(ClassifyError::InvalidConfig(format!(
                "prompt version {v} is not loaded (current: {})",
                self.prompts.version()
            ))),
            _ => Ok(self.prompts.version().to_string()),
        }
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<String, Arc<RunControl>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn control(&self, run_id: &str) -> Option<Arc<RunControl>> {
        self.controls().get(run_id).cloned()
    }
}

fn validate_parameters(p: &RunParameters) -> Result<(), ClassifyError> {
    let invalid = |msg: String| Err(ClassifyError::InvalidConfig(msg));
    if !(p.temperature.is_finite() && (0.0..=2.0).contains(&p.temperature)) {
        return invalid(format!("temperature {} outside [0, 2]", p.temperature));
    }
    if !(p.top_p.is_finite() && p.top_p > 0.0 && p.top_p <= 1.0) {
        return invalid(format!("top_p {} outside (0, 1]", p.top_p));
    }
    if !(1..=64).contains(&p.concurrency) {
        return invalid(format!("concurrency {} outside 1..=64", p.concurrency));
    }
    if !(1..=10).contains(&p.max_attempts) {
        return invalid(format!("max_attempts {} outside 1..=10", p.max_attempts));
    }
    if p.max_tokens == Some(0) {
        return invalid("max_tokens must be positive".into());
    }
    Ok(())
}

fn ensure_run(conn: &rusqlite::Connection, run_id: &str) -> Result<(), ClassifyError> {
    db::get_run(conn, run_id)?
        .map(|_| ())
        .ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))
}

/// Create the run or bring an existing one back to a startable state.
fn prepare_run(
    conn: &rusqlite::Connection,
    run_id: &str,
    req: &StartRunRequest,
    prompt_version: &str,
    defaults: &RunParameters,
) -> Result<ClassificationRun, ClassifyError> {
    match db::get_run(conn, run_id)? {
        Some(existing) => {
            if existing.abandoned {
                return Err(ClassifyError::Abandoned(run_id.to_string()));
            }
            if existing.model != req.model {
                return Err(ClassifyError::InvalidConfig(format!(
                    "run {run_id} uses model {}, not {}",
                    existing.model, req.model
                )));
            }
            if existing.prompt_version != prompt_version {
                return Err(ClassifyError::InvalidConfig(format!(
                    "run {run_id} uses prompt version {}",
                    existing.prompt_version
                )));
            }
            if req.parameters.as_ref().is_some_and(|p| *p != existing.parameters) {
                return Err(ClassifyError::InvalidConfig(format!(
                    "run {run_id} was created with different parameters; start a new run instead"
                )));
            }

            if req.force {
                let reset = db::requeue_all(conn, run_id)?;
                let closed = db::resolve_open_dead_letters(
                    conn,
                    run_id,
                    SYSTEM_RESOLVER,
                    "superseded by forced re-run",
                )?;
                tracing::info!(run_id = %run_id, reset, dead_letters_closed = closed, "Forced re-run");
            } else {
                let requeued = db::requeue_unsettled(conn, run_id)?;
                tracing::info!(run_id = %run_id, requeued, "Resuming run");
            }
        }
        None => {
            let run = ClassificationRun {
                run_id: run_id.to_string(),
                model: req.model.clone(),
                prompt_version: prompt_version.to_string(),
                parameters: req.parameters.clone().unwrap_or_else(|| defaults.clone()),
                status: RunStatus::Queued,
                abandoned: false,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                last_error: None,
            };
            db::insert_run(conn, &run)?;
        }
    }

    let attached = db::attach_documents(conn, run_id)?;
    if attached > 0 {
        tracing::debug!(run_id = %run_id, attached, "Documents enrolled in run");
    }
    db::set_run_status(conn, run_id, RunStatus::Running, None)?;
    db::get_run(conn, run_id)?.ok_or_else(|| ClassifyError::RunNotFound(run_id.to_string()))
}
