//! Response shapes of the status API. Field names follow the REST contract (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobKind;
use crate::scheduler::history::{RunRecord, RunStats, RunStatus, TriggerSource};

/// Status as callers see it. Pending is reported as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibleStatus {
    Idle,
    Running,
    Success,
    Failed,
    Skipped,
}

impl From<RunStatus> for VisibleStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending | RunStatus::Running => VisibleStatus::Running,
            RunStatus::Success => VisibleStatus::Success,
            RunStatus::Failed => VisibleStatus::Failed,
            RunStatus::Skipped => VisibleStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub kind: JobKind,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: VisibleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub message: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub id: Uuid,
    pub job_id: String,
    pub kind: JobKind,
    pub trigger: TriggerSource,
    pub attempt: u32,
    pub status: VisibleStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl From<RunRecord> for RunView {
    fn from(r: RunRecord) -> Self {
        Self {
            id: r.id,
            job_id: r.job_id,
            kind: r.job_kind,
            trigger: r.trigger,
            attempt: r.attempt,
            status: r.status.into(),
            started_at: r.started_at,
            completed_at: r.completed_at,
            result: r.result,
            error: r.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunList {
    pub count: usize,
    pub runs: Vec<RunView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    /// Pending and running records together.
    pub running: u64,
    pub skipped: u64,
    pub success_rate: f64,
}

impl From<RunStats> for StatsView {
    fn from(s: RunStats) -> Self {
        Self {
            total_executions: s.total_executions,
            completed: s.completed,
            failed: s.failed,
            running: s.running + s.pending,
            skipped: s.skipped,
            success_rate: s.success_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub job_id: String,
    pub kind: JobKind,
}
