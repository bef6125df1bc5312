//! Run history: one `RunRecord` per execution attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{JobDefinition, JobKind};

/// Stored result and error text are capped at this many characters.
pub const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// A scheduled occurrence dropped because the previous run was still in progress.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" | "completed" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => anyhow::bail!("unknown run status '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerSource::Scheduled),
            "manual" => Ok(TriggerSource::Manual),
            other => anyhow::bail!("unknown trigger source '{}'", other),
        }
    }
}

/// Terminal outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum RunOutcome {
    Success(String),
    Failed(String),
    Skipped(String),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success(_) => RunStatus::Success,
            RunOutcome::Failed(_) => RunStatus::Failed,
            RunOutcome::Skipped(_) => RunStatus::Skipped,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }
}

/// Terminal state written exactly once per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Completion {
    /// Build a completion; exactly one of `result`/`error` is populated.
    pub fn new(outcome: &RunOutcome, completed_at: DateTime<Utc>) -> Self {
        let (result, error) = match outcome {
            RunOutcome::Success(r) | RunOutcome::Skipped(r) => (Some(truncate(r)), None),
            RunOutcome::Failed(e) => (None, Some(truncate(e))),
        };
        Self {
            status: outcome.status(),
            completed_at,
            result,
            error,
        }
    }
}

/// A single execution attempt of a job (a.k.a. task log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub job_id: String,
    pub job_kind: JobKind,
    pub trigger: TriggerSource,
    /// 1-based attempt number within one dispatch (retries increment it).
    pub attempt: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn pending(
        id: Uuid,
        job: &JobDefinition,
        trigger: TriggerSource,
        attempt: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id: job.id.clone(),
            job_kind: job.kind,
            trigger,
            attempt,
            status: RunStatus::Pending,
            started_at: at,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// An already-terminal record for a skipped scheduled occurrence.
    pub fn skipped(job: &JobDefinition, reason: &str, at: DateTime<Utc>) -> Self {
        let mut record = Self::pending(Uuid::new_v4(), job, TriggerSource::Scheduled, 1, at);
        record.apply(&Completion::new(&RunOutcome::Skipped(reason.to_string()), at));
        record
    }

    /// Pending -> Running. The start time is clamped so it never precedes dispatch.
    pub fn start(&mut self, at: DateTime<Utc>) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
            self.started_at = at.max(self.started_at);
        }
    }

    /// Apply the terminal state. A record that is already terminal is left untouched.
    pub fn apply(&mut self, completion: &Completion) {
        if self.status.is_terminal() {
            return;
        }
        self.status = completion.status;
        self.completed_at = Some(completion.completed_at.max(self.started_at));
        self.result = completion.result.clone();
        self.error = completion.error.clone();
    }
}

/// Aggregate counts over all run records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Every record except skipped occurrences.
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub pending: u64,
    pub skipped: u64,
    /// `completed / total_executions * 100`, two decimals.
    pub success_rate: f64,
}

impl RunStats {
    pub fn from_counts(completed: u64, failed: u64, running: u64, pending: u64, skipped: u64) -> Self {
        let total = completed + failed + running + pending;
        let success_rate = if total > 0 {
            (completed as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_executions: total,
            completed,
            failed,
            running,
            pending,
            skipped,
            success_rate,
        }
    }
}

/// Truncate to `MAX_DETAIL_CHARS` characters on a char boundary.
pub fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
