//! Job definitions and the job bodies that run them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::scheduler::cron::CronSchedule;
use crate::storage::store::JobStore;

pub mod backup;
pub mod cleanup;
pub mod report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Cleanup,
    Report,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Backup, JobKind::Cleanup, JobKind::Report];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Cleanup => "cleanup",
            JobKind::Report => "report",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backup" => Ok(JobKind::Backup),
            "cleanup" => Ok(JobKind::Cleanup),
            "report" => Ok(JobKind::Report),
            other => Err(EngineError::UnknownKind(other.to_string())),
        }
    }
}

/// A named, schedulable unit of automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    /// 5-field cron expression, UTC.
    pub schedule: String,
    pub enabled: bool,
    pub kind: JobKind,
    /// Kind-specific parameters, opaque to the engine.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schedule: impl Into<String>,
        kind: JobKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: schedule.into(),
            enabled: true,
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse the schedule; a definition that fails here never enters the registry.
    pub fn validate(&self) -> Result<CronSchedule, EngineError> {
        CronSchedule::parse(&self.schedule)
    }
}

/// Everything a job body gets to see while it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job: JobDefinition,
    pub run_id: Uuid,
    pub attempt: u32,
    pub data_dir: PathBuf,
    pub store: Arc<dyn JobStore>,
    /// Cancelled when the run times out or the engine shuts down.
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Resolve a directory parameter, defaulting to `<data_dir>/<default>`.
    pub fn dir_param(&self, key: &str, default: &str) -> PathBuf {
        match self.job.param(key) {
            Some(p) => PathBuf::from(p),
            None => self.data_dir.join(default),
        }
    }

    /// Return an error if the run has been cancelled. Bodies call this between steps.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("run {} cancelled", self.run_id);
        }
        Ok(())
    }
}

/// The logic of one job kind. Errors become a `Failed` run with the error text.
#[async_trait::async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value>;
}

/// Maps job kinds to their bodies. Extended by callers (or tests) via `register`.
#[derive(Clone, Default)]
pub struct JobHandlers {
    bodies: HashMap<JobKind, Arc<dyn JobBody>>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in backup, cleanup and report bodies.
    pub fn with_defaults() -> Self {
        let mut handlers = Self::new();
        handlers.register(JobKind::Backup, Arc::new(backup::BackupJob));
        handlers.register(JobKind::Cleanup, Arc::new(cleanup::CleanupJob));
        handlers.register(JobKind::Report, Arc::new(report::ReportJob));
        handlers
    }

    pub fn register(&mut self, kind: JobKind, body: Arc<dyn JobBody>) {
        tracing::debug!(%kind, "registered job body");
        self.bodies.insert(kind, body);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobBody>> {
        self.bodies.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<_> = self.bodies.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

pub(crate) fn timestamp_slug() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) async fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
