use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::{Dispatch, RunCoordinator};
use super::outbox::FlushReport;

/// What one evaluator tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub flushed: FlushReport,
    pub started: Vec<(String, Uuid)>,
    pub skipped: Vec<(String, &'static str)>,
}

/// Main scheduler loop. Ticks every `interval` until `shutdown` flips to true.
pub async fn run_scheduler_loop(
    coordinator: Arc<RunCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(?interval, jobs = coordinator.registry().len(), "Scheduler engine started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = evaluate(&coordinator, Utc::now()).await;
                if !report.started.is_empty() || !report.skipped.is_empty() {
                    debug!(
                        started = report.started.len(),
                        skipped = report.skipped.len(),
                        "tick complete"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Scheduler engine stopped");
}

/// One tick: replay parked writes, merge store changes, dispatch due jobs.
pub async fn evaluate(coordinator: &Arc<RunCoordinator>, now: DateTime<Utc>) -> TickReport {
    let mut report = TickReport {
        flushed: coordinator.flush_outbox().await,
        ..Default::default()
    };

    match coordinator.store().load_jobs().await {
        Ok(defs) => coordinator.registry().refresh(defs, now),
        Err(e) => warn!(error = %format!("{e:#}"), "could not reload jobs, using cached registry"),
    }

    for job in coordinator.registry().due(now) {
        info!(job = %job.id, "Task due");
        let id = job.id.clone();
        match coordinator.dispatch_scheduled(job).await {
            Dispatch::Started(run_id) => report.started.push((id, run_id)),
            Dispatch::Skipped(reason) => report.skipped.push((id, reason)),
        }
    }

    if coordinator.is_degraded() {
        error!(parked = coordinator.outbox().len(), "engine degraded, scheduled work is paused");
    }

    report
}
