//! Status API -- the read/trigger/toggle surface consumed by an external REST layer.
//!
//! Reads keep working while the engine is degraded; anything that would
//! create a run fails with `Unavailable` instead.

pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use self::types::{
    JobView, RunList, RunView, StatsView, ToggleResponse, TriggerResponse, UpcomingRun,
    VisibleStatus,
};
use crate::error::EngineError;
use crate::jobs::JobDefinition;
use crate::scheduler::coordinator::{JobPhase, RunCoordinator};
use crate::scheduler::history::{RunRecord, RunStatus};
use crate::storage::RunFilter;

/// Records scanned when looking for a job's last completed run.
const LAST_RUN_SCAN: usize = 10;

/// Longest dry-run window; longer requests are clamped.
pub const MAX_PREVIEW_HOURS: u32 = 24 * 31;

#[derive(Clone)]
pub struct StatusApi {
    coordinator: Arc<RunCoordinator>,
}

impl StatusApi {
    pub fn new(coordinator: Arc<RunCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    /// Every job with its last and next run.
    pub async fn list_jobs(&self) -> Result<Vec<JobView>, EngineError> {
        let registry = self.coordinator.registry();
        let mut views = Vec::new();

        for snap in registry.snapshot() {
            let phase = self.coordinator.phase(&snap.def.id);
            let last = self.last_finished(&snap.def.id).await;

            let status = if phase != JobPhase::Idle {
                VisibleStatus::Running
            } else {
                last.map(|(_, s)| s).unwrap_or(VisibleStatus::Idle)
            };

            views.push(JobView {
                id: snap.def.id,
                name: snap.def.name,
                schedule: snap.def.schedule,
                kind: snap.def.kind,
                enabled: snap.def.enabled,
                last_run: last.map(|(at, _)| at),
                next_run: snap.next_fire_at,
                status,
            });
        }
        Ok(views)
    }

    /// Start time and status of the newest run that was not skipped.
    async fn last_finished(
        &self,
        job_id: &str,
    ) -> Option<(DateTime<Utc>, VisibleStatus)> {
        if let Some(last) = self.coordinator.last_run(job_id) {
            return Some((last.started_at, last.status.into()));
        }
        let filter = RunFilter::for_job(job_id).with_limit(LAST_RUN_SCAN);
        match self.coordinator.store().list_runs(&filter).await {
            Ok(runs) => runs
                .into_iter()
                .find(|r: &RunRecord| r.status != RunStatus::Skipped)
                .map(|r| (r.started_at, r.status.into())),
            Err(e) => {
                warn!(job = %job_id, error = %format!("{e:#}"), "could not read run history");
                None
            }
        }
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobDefinition, EngineError> {
        self.coordinator
            .registry()
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    /// Start a job now; returns as soon as the run is accepted.
    pub fn trigger_job(&self, job_id: &str) -> Result<TriggerResponse, EngineError> {
        let run_id = self.coordinator.trigger_job(job_id)?;
        Ok(TriggerResponse {
            message: format!("Task '{}' started successfully", job_id),
            run_id,
        })
    }

    pub async fn toggle_job(
        &self,
        job_id: &str,
        enabled: bool,
    ) -> Result<ToggleResponse, EngineError> {
        let def = self.coordinator.toggle_job(job_id, enabled).await?;
        Ok(ToggleResponse {
            id: def.id,
            enabled: def.enabled,
        })
    }

    pub async fn add_job(&self, def: JobDefinition) -> Result<JobDefinition, EngineError> {
        self.coordinator.add_job(def).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<RunList, EngineError> {
        let runs: Vec<RunView> = self
            .coordinator
            .store()
            .list_runs(filter)
            .await
            .map_err(EngineError::store)?
            .into_iter()
            .map(RunView::from)
            .collect();
        Ok(RunList {
            count: runs.len(),
            runs,
        })
    }

    pub async fn run_stats(&self) -> Result<StatsView, EngineError> {
        let stats = self
            .coordinator
            .store()
            .aggregate_stats()
            .await
            .map_err(EngineError::store)?;
        Ok(stats.into())
    }

    /// Planned fire times of enabled jobs over the next `hours`, at most
    /// `MAX_PREVIEW_HOURS`.
    pub fn preview(&self, hours: u32) -> Vec<UpcomingRun> {
        if hours > MAX_PREVIEW_HOURS {
            warn!(hours, max = MAX_PREVIEW_HOURS, "preview window clamped");
        }
        let window = Duration::hours(i64::from(hours.min(MAX_PREVIEW_HOURS)));
        let now = Utc::now();
        let until = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.coordinator
            .registry()
            .preview(now, until)
            .into_iter()
            .map(|p| UpcomingRun {
                at: p.at,
                job_id: p.job_id,
                kind: p.kind,
            })
            .collect()
    }
}
