//! Run coordination: single-flight dispatch, retries and durable run records.
//!
//! Every job moves through `Idle -> Dispatching -> Running`, then either back
//! to `Idle` or through `BackingOff` into another attempt. A job leaves `Idle`
//! only through `claim`, so at most one attempt of a job is ever in flight.
//! Scheduled occurrences that find the job busy are skipped, manual triggers
//! are rejected.
//!
//! Run-record writes are retried with backoff. Writes that still fail are
//! parked in the outbox and replayed in order on every tick; while the
//! outbox is at capacity the engine refuses to dispatch anything new.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{Completion, RunOutcome, RunRecord, RunStatus, TriggerSource};
use super::outbox::{FlushReport, Outbox, PendingWrite};
use super::pool::{ExecutorPool, Reservation};
use super::queue::WorkItem;
use super::registry::JobRegistry;
use crate::alert::{AlertDispatcher, FailureAlert, SystemAlert};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::jobs::{JobBody, JobContext, JobDefinition, JobHandlers};
use crate::storage::JobStore;

/// Reason stored on runs found in flight at startup.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Reason stored on a scheduled occurrence that found its job busy.
pub const SKIPPED_IN_PROGRESS: &str = "previous run still in progress";

const SKIPPED_SATURATED: &str = "executor pool saturated";

/// Issue type of the system alert raised on entering degraded mode.
pub const DEGRADED_ISSUE: &str = "degraded_mode";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Dispatching,
    Running,
    BackingOff,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Dispatching => "dispatching",
            JobPhase::Running => "running",
            JobPhase::BackingOff => "backing_off",
        }
    }
}

/// Outcome of the most recent attempt of a job, as seen by this process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// What a scheduled occurrence turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Started(Uuid),
    Skipped(&'static str),
}

#[derive(Debug, Default)]
struct JobSlot {
    phase: JobPhase,
    run_id: Option<Uuid>,
    attempt: u32,
    last_run: Option<LastRun>,
}

pub struct RunCoordinator {
    config: Arc<EngineConfig>,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    handlers: JobHandlers,
    alerter: Arc<dyn AlertDispatcher>,
    pool: ExecutorPool,
    outbox: Outbox,
    slots: Mutex<HashMap<String, JobSlot>>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    degraded: AtomicBool,
    tracker: TaskTracker,
    /// Cancelled when shutdown begins: no new dispatches, no further retries.
    draining: CancellationToken,
    /// Parent of every run's cancellation token.
    runs: CancellationToken,
}

impl RunCoordinator {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        handlers: JobHandlers,
        alerter: Arc<dyn AlertDispatcher>,
    ) -> Arc<Self> {
        let pool = ExecutorPool::new(config.engine.pool_size, config.engine.backlog);
        let outbox = Outbox::new(
            config.storage.outbox_capacity,
            config.storage.fallback_log.clone(),
        );
        Arc::new(Self {
            config,
            store,
            registry,
            handlers,
            alerter,
            pool,
            outbox,
            slots: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            draining: CancellationToken::new(),
            runs: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// True while parked writes are at capacity; cleared once they drain.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    pub fn phase(&self, job_id: &str) -> JobPhase {
        self.slots().get(job_id).map(|s| s.phase).unwrap_or_default()
    }

    pub fn last_run(&self, job_id: &str) -> Option<LastRun> {
        self.slots().get(job_id).and_then(|s| s.last_run.clone())
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Replay writes parked by a previous process, then fail runs it left in flight.
    ///
    /// Returns the number of runs marked failed.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        if let Err(e) = self.outbox.restore().await {
            warn!(error = %format!("{e:#}"), "could not read fallback log");
        }
        self.flush_outbox().await;
        if !self.outbox.is_empty() {
            return Err(EngineError::Unavailable);
        }

        let failed = self
            .store
            .fail_interrupted(INTERRUPTED_BY_RESTART, Utc::now())
            .await
            .map_err(EngineError::store)?;
        if failed > 0 {
            warn!(failed, "marked runs interrupted by restart as failed");
        }
        Ok(failed)
    }

    // -----------------------------------------------------------------------
    // Job mutations
    // -----------------------------------------------------------------------

    /// Validate, persist and register a new job definition.
    pub async fn add_job(&self, def: JobDefinition) -> Result<JobDefinition, EngineError> {
        def.validate()?;
        if self.handlers.get(def.kind).is_none() {
            return Err(EngineError::UnknownKind(def.kind.to_string()));
        }
        let lock = self.write_lock(&def.id);
        let _guard = lock.lock().await;

        let stored = self.store.get_job(&def.id).await.map_err(EngineError::store)?;
        if stored.is_some() || self.registry.contains(&def.id) {
            return Err(EngineError::Duplicate(def.id));
        }
        self.store.insert_job(&def).await.map_err(EngineError::store)?;
        self.registry.insert(def.clone(), Utc::now())?;
        info!(job = %def.id, kind = %def.kind, schedule = %def.schedule, "job added");
        Ok(def)
    }

    /// Enable or disable a job. Idempotent; an in-flight run is not interrupted.
    pub async fn toggle_job(
        &self,
        job_id: &str,
        enabled: bool,
    ) -> Result<JobDefinition, EngineError> {
        if !self.registry.contains(job_id) {
            return Err(EngineError::NotFound(job_id.to_string()));
        }
        let lock = self.write_lock(job_id);
        let _guard = lock.lock().await;

        let found = self
            .store
            .set_enabled(job_id, enabled)
            .await
            .map_err(EngineError::store)?;
        if !found || !self.registry.set_enabled(job_id, enabled, Utc::now()) {
            return Err(EngineError::NotFound(job_id.to_string()));
        }
        info!(job = %job_id, enabled, "job toggled");
        self.registry
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Start a job now. Returns its run id as soon as the work is accepted.
    pub fn trigger_job(self: &Arc<Self>, job_id: &str) -> Result<Uuid, EngineError> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if self.is_degraded() || self.is_draining() {
            return Err(EngineError::Unavailable);
        }
        let body = self
            .handlers
            .get(job.kind)
            .ok_or_else(|| EngineError::UnknownKind(job.kind.to_string()))?;
        if !self.claim(&job.id) {
            return Err(EngineError::AlreadyRunning(job.id));
        }
        let reservation = match self.pool.try_reserve() {
            Ok(r) => r,
            Err(e) => {
                self.release(&job.id);
                return Err(e);
            }
        };
        info!(job = %job.id, "manual trigger accepted");
        Ok(self.launch(job, body, TriggerSource::Manual, reservation))
    }

    /// Dispatch a scheduled occurrence, or skip it when the job is busy or
    /// the pool stays full for longer than the dispatch wait.
    pub async fn dispatch_scheduled(self: &Arc<Self>, job: JobDefinition) -> Dispatch {
        if self.is_degraded() || self.is_draining() {
            warn!(job = %job.id, "scheduled occurrence dropped, engine not accepting work");
            return Dispatch::Skipped("engine not accepting work");
        }
        let Some(body) = self.handlers.get(job.kind) else {
            error!(job = %job.id, kind = %job.kind, "no handler registered for job kind");
            return Dispatch::Skipped("no handler for job kind");
        };
        if !self.claim(&job.id) {
            warn!(job = %job.id, phase = self.phase(&job.id).as_str(), "skipped: previous run still in progress");
            self.record_skip(&job, SKIPPED_IN_PROGRESS).await;
            return Dispatch::Skipped(SKIPPED_IN_PROGRESS);
        }

        let reservation = match self.pool.try_reserve() {
            Ok(r) => r,
            Err(_) => {
                let wait = self.config.engine.dispatch_wait();
                match tokio::time::timeout(wait, self.pool.reserve()).await {
                    Ok(Ok(r)) => r,
                    _ => {
                        self.release(&job.id);
                        warn!(job = %job.id, ?wait, "skipped: executor pool saturated");
                        self.record_skip(&job, SKIPPED_SATURATED).await;
                        return Dispatch::Skipped(SKIPPED_SATURATED);
                    }
                }
            }
        };
        Dispatch::Started(self.launch(job, body, TriggerSource::Scheduled, reservation))
    }

    fn launch(
        self: &Arc<Self>,
        job: JobDefinition,
        body: Arc<dyn JobBody>,
        trigger: TriggerSource,
        reservation: Reservation,
    ) -> Uuid {
        let run_id = Uuid::new_v4();
        self.set_phase(&job.id, JobPhase::Dispatching, Some(run_id), 1);
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.drive(job, body, trigger, reservation, run_id).await;
        });
        run_id
    }

    /// Runs attempts until one succeeds or the retry budget is spent.
    async fn drive(
        self: Arc<Self>,
        job: JobDefinition,
        body: Arc<dyn JobBody>,
        trigger: TriggerSource,
        reservation: Reservation,
        first_run: Uuid,
    ) {
        let _release = SlotRelease {
            coordinator: self.as_ref(),
            job_id: &job.id,
        };
        let policy = self.config.policy_for(job.kind);
        let mut reservation = reservation;
        let mut run_id = first_run;
        let mut attempt = 1;

        loop {
            let outcome = self
                .run_attempt(&job, &body, trigger, attempt, run_id, reservation, policy.timeout)
                .await;

            let error = match outcome {
                RunOutcome::Failed(error) => error,
                RunOutcome::Success(_) | RunOutcome::Skipped(_) => break,
            };
            if attempt >= policy.max_attempts {
                self.alert(&job, error, attempt).await;
                break;
            }

            let delay = policy.delay_after(attempt);
            self.set_phase(&job.id, JobPhase::BackingOff, None, attempt);
            warn!(
                job = %job.id,
                attempt,
                max_attempts = policy.max_attempts,
                ?delay,
                "attempt failed, retrying after backoff"
            );

            let next = tokio::select! {
                _ = self.draining.cancelled() => None,
                r = async {
                    tokio::time::sleep(delay).await;
                    self.pool.reserve().await
                } => r.ok(),
            };
            let Some(next) = next else {
                info!(job = %job.id, attempt, "retries abandoned on shutdown");
                break;
            };

            reservation = next;
            attempt += 1;
            run_id = Uuid::new_v4();
            self.set_phase(&job.id, JobPhase::Dispatching, Some(run_id), attempt);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        job: &JobDefinition,
        body: &Arc<dyn JobBody>,
        trigger: TriggerSource,
        attempt: u32,
        run_id: Uuid,
        reservation: Reservation,
        timeout: Option<Duration>,
    ) -> RunOutcome {
        let record = RunRecord::pending(run_id, job, trigger, attempt, Utc::now());
        self.persist(&job.id, PendingWrite::Save { record }).await;

        let ctx = JobContext {
            job: job.clone(),
            run_id,
            attempt,
            data_dir: self.config.engine.data_dir.clone(),
            store: Arc::clone(&self.store),
            cancel: self.runs.child_token(),
        };
        let mut handle = reservation.submit(WorkItem {
            body: Arc::clone(body),
            ctx,
            trigger,
            timeout,
        });

        if let Some(started_at) = handle.started().await {
            self.set_phase(&job.id, JobPhase::Running, Some(run_id), attempt);
            info!(job = %job.id, %run_id, attempt, %trigger, "run started");
            self.persist(&job.id, PendingWrite::MarkRunning { id: run_id, started_at })
                .await;
        }

        let execution = handle.finished().await;
        let completion = Completion::new(&execution.outcome, execution.finished_at);
        match &execution.outcome {
            RunOutcome::Failed(e) => warn!(job = %job.id, %run_id, attempt, error = %e, "run failed"),
            _ => info!(job = %job.id, %run_id, attempt, "run succeeded"),
        }
        self.remember(
            &job.id,
            LastRun {
                run_id,
                status: completion.status,
                attempt,
                started_at: execution.started_at,
                completed_at: completion.completed_at,
                error: completion.error.clone(),
            },
        );
        self.persist(&job.id, PendingWrite::Complete { id: run_id, completion })
            .await;

        execution.outcome
    }

    async fn record_skip(&self, job: &JobDefinition, reason: &str) {
        if !self.config.engine.record_skipped {
            return;
        }
        let record = RunRecord::skipped(job, reason, Utc::now());
        self.persist(&job.id, PendingWrite::Save { record }).await;
    }

    async fn alert(&self, job: &JobDefinition, error: String, attempts: u32) {
        let alert = FailureAlert {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            kind: job.kind,
            error,
            attempts,
            at: Utc::now(),
        };
        let alerter = Arc::clone(&self.alerter);
        let delivery = tokio::spawn(async move { alerter.notify(&alert).await });
        match delivery.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(job = %job.id, error = %format!("{e:#}"), "failed to deliver failure alert")
            }
            Err(e) => error!(job = %job.id, error = %e, "alert dispatcher panicked"),
        }
    }

    fn alert_degraded(&self, parked: usize) {
        let issue = SystemAlert {
            issue: DEGRADED_ISSUE.to_string(),
            details: format!(
                "run store unreachable, {parked} run writes parked; new dispatches are refused"
            ),
            at: Utc::now(),
        };
        let alerter = Arc::clone(&self.alerter);
        let delivery = tokio::spawn(async move { alerter.notify_system(&issue).await });
        self.tracker.spawn(async move {
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "failed to deliver system alert"),
                Err(e) => error!(error = %e, "alert dispatcher panicked"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write through to the store, retrying with backoff; park the write when that fails.
    async fn persist(&self, job_id: &str, write: PendingWrite) {
        let lock = self.write_lock(job_id);
        let _guard = lock.lock().await;

        if !self.outbox.is_empty() {
            self.outbox.park(write).await;
            self.outbox.flush(self.store.as_ref()).await;
            self.update_degraded();
            return;
        }

        let attempts = self.config.storage.write_attempts.max(1);
        for n in 1..=attempts {
            match write.apply(self.store.as_ref()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        op = write.op(),
                        run_id = %write.run_id(),
                        attempt = n,
                        error = %format!("{e:#}"),
                        "run write failed"
                    );
                    if n < attempts {
                        tokio::time::sleep(self.config.storage.write_backoff(n)).await;
                    }
                }
            }
        }

        error!(op = write.op(), run_id = %write.run_id(), "store unavailable, parking run write");
        self.outbox.park(write).await;
        self.update_degraded();
    }

    /// Replay parked writes. Called once per tick.
    pub async fn flush_outbox(&self) -> FlushReport {
        if self.outbox.is_empty() {
            return FlushReport::default();
        }
        let report = self.outbox.flush(self.store.as_ref()).await;
        self.update_degraded();
        report
    }

    fn update_degraded(&self) {
        if self.outbox.is_full() {
            if !self.degraded.swap(true, Ordering::SeqCst) {
                let parked = self.outbox.len();
                error!(parked, "run store unreachable, engine degraded to read-only");
                self.alert_degraded(parked);
            }
        } else if self.outbox.is_empty() && self.degraded.swap(false, Ordering::SeqCst) {
            info!("run store reachable again, leaving degraded mode");
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Wait for every dispatched run, including its retries, to finish.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work, let in-flight runs finish within `grace`, then cancel them.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.cancel();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            warn!(?grace, "in-flight runs did not finish in time, cancelling");
            self.runs.cancel();
            self.wait_idle().await;
        }
        self.flush_outbox().await;
        if !self.outbox.is_empty() {
            warn!(parked = self.outbox.len(), "exiting with parked run writes on disk");
        }
    }

    // -----------------------------------------------------------------------
    // Job slots
    // -----------------------------------------------------------------------

    fn slots(&self) -> MutexGuard<'_, HashMap<String, JobSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Idle -> Dispatching. False when the job is already busy.
    fn claim(&self, job_id: &str) -> bool {
        let mut slots = self.slots();
        let slot = slots.entry(job_id.to_string()).or_default();
        if slot.phase != JobPhase::Idle {
            return false;
        }
        slot.phase = JobPhase::Dispatching;
        slot.run_id = None;
        slot.attempt = 1;
        true
    }

    fn set_phase(&self, job_id: &str, phase: JobPhase, run_id: Option<Uuid>, attempt: u32) {
        let mut slots = self.slots();
        let slot = slots.entry(job_id.to_string()).or_default();
        debug!(job = %job_id, from = slot.phase.as_str(), to = phase.as_str(), "phase change");
        slot.phase = phase;
        slot.run_id = run_id;
        slot.attempt = attempt;
    }

    fn release(&self, job_id: &str) {
        self.set_phase(job_id, JobPhase::Idle, None, 0);
    }

    fn remember(&self, job_id: &str, last: LastRun) {
        self.slots().entry(job_id.to_string()).or_default().last_run = Some(last);
    }

    fn write_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }
}

/// Returns a job to `Idle` however its drive task ends, unwinding included.
struct SlotRelease<'a> {
    coordinator: &'a RunCoordinator,
    job_id: &'a str,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.job_id);
    }
}
