//! Job store: persistence of job definitions and run history.
//!
//! Run-record writes are idempotent so the coordinator can replay them after
//! an outage: saving an existing record is a no-op, and a terminal record is
//! never updated again.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Pool;
use crate::jobs::{JobDefinition, JobKind};
use crate::scheduler::history::{Completion, RunRecord, RunStats, RunStatus};

const DEFAULT_LIST_LIMIT: usize = 50;

/// Filter for `list_runs`. Results are newest first.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub kind: Option<JobKind>,
    pub status: Option<RunStatus>,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            job_id: None,
            kind: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl RunFilter {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn matches(&self, r: &RunRecord) -> bool {
        self.job_id.as_deref().map_or(true, |id| r.job_id == id)
            && self.kind.map_or(true, |k| r.job_kind == k)
            && self.status.map_or(true, |s| r.status == s)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// All job definitions, enabled or not.
    async fn load_jobs(&self) -> Result<Vec<JobDefinition>>;

    async fn load_enabled_jobs(&self) -> Result<Vec<JobDefinition>> {
        let jobs = self.load_jobs().await?;
        Ok(jobs.into_iter().filter(|j| j.enabled).collect())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>>;

    /// Insert a new job. Fails if the id already exists.
    async fn insert_job(&self, job: &JobDefinition) -> Result<()>;

    /// Returns `false` if no such job exists.
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool>;

    /// Insert a run record; a record with the same id is left as is.
    async fn save_run_record(&self, record: &RunRecord) -> Result<()>;

    /// Pending -> Running. No-op for records that already moved on.
    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()>;

    /// Write the terminal state. No-op for records that are already terminal.
    async fn update_run_record(&self, id: Uuid, completion: &Completion) -> Result<()>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;

    async fn aggregate_stats(&self) -> Result<RunStats>;

    /// Fail every record left in flight by a previous process. Returns the count.
    async fn fail_interrupted(&self, reason: &str, at: DateTime<Utc>) -> Result<usize>;
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp '{}'", s))?
        .with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed store. Queries run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool,
}

impl SqliteJobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context("database connection unavailable")?;
            f(&conn)
        })
        .await?
    }
}

struct RawJob {
    id: String,
    name: String,
    schedule: String,
    kind: String,
    enabled: bool,
    params_json: String,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            schedule: row.get(2)?,
            kind: row.get(3)?,
            enabled: row.get::<_, i64>(4)? != 0,
            params_json: row.get(5)?,
        })
    }

    fn into_job(self) -> Result<JobDefinition> {
        Ok(JobDefinition {
            kind: self.kind.parse()?,
            params: serde_json::from_str(&self.params_json)
                .with_context(|| format!("bad params for job '{}'", self.id))?,
            id: self.id,
            name: self.name,
            schedule: self.schedule,
            enabled: self.enabled,
        })
    }
}

const JOB_COLUMNS: &str = "id, name, schedule, kind, enabled, params_json";

struct RawRun {
    id: String,
    job_id: String,
    job_kind: String,
    trigger: String,
    attempt: u32,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl RawRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            job_kind: row.get(2)?,
            trigger: row.get(3)?,
            attempt: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: Uuid::parse_str(&self.id)?,
            job_id: self.job_id,
            job_kind: self.job_kind.parse()?,
            trigger: self.trigger.parse()?,
            attempt: self.attempt,
            status: self.status.parse()?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            result: self.result,
            error: self.error,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, job_id, job_kind, trigger_source, attempt, status, started_at, completed_at, result, error";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS))?;
            let rows = stmt.query_map([], RawJob::from_row)?;
            let mut jobs = Vec::new();
            for r in rows {
                jobs.push(r?.into_job()?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    params![id],
                    RawJob::from_row,
                )
                .optional()?;
            raw.map(RawJob::into_job).transpose()
        })
        .await
    }

    async fn insert_job(&self, job: &JobDefinition) -> Result<()> {
        let job = job.clone();
        self.with_conn(move |conn| {
            let params_json = serde_json::to_string(&job.params)?;
            conn.execute(
                "INSERT INTO jobs (id, name, schedule, kind, enabled, params_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job.id, job.name, job.schedule, job.kind.as_str(), job.enabled, params_json],
            )
            .with_context(|| format!("Failed to insert job '{}'", job.id))?;
            Ok(())
        })
        .await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET enabled = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, enabled],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn save_run_record(&self, record: &RunRecord) -> Result<()> {
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO run_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO NOTHING",
                    RUN_COLUMNS
                ),
                params![
                    r.id.to_string(),
                    r.job_id,
                    r.job_kind.as_str(),
                    r.trigger.as_str(),
                    r.attempt,
                    r.status.as_str(),
                    ts(&r.started_at),
                    r.completed_at.as_ref().map(ts),
                    r.result,
                    r.error,
                ],
            )
            .context("Failed to insert run record")?;
            Ok(())
        })
        .await
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE run_records SET status = 'running', started_at = MAX(started_at, ?2)
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), ts(&started_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_run_record(&self, id: Uuid, completion: &Completion) -> Result<()> {
        let c = completion.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE run_records
                 SET status = ?2, completed_at = MAX(started_at, ?3), result = ?4, error = ?5
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id.to_string(), c.status.as_str(), ts(&c.completed_at), c.result, c.error],
            )?;
            if changed == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM run_records WHERE id = ?1)",
                    params![id.to_string()],
                    |row| row.get(0),
                )?;
                if !exists {
                    anyhow::bail!("run record {} not found", id);
                }
            }
            Ok(())
        })
        .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<rusqlite::types::Value> = Vec::new();
            if let Some(id) = filter.job_id {
                values.push(id.into());
                clauses.push(format!("job_id = ?{}", values.len()));
            }
            if let Some(kind) = filter.kind {
                values.push(kind.as_str().to_string().into());
                clauses.push(format!("job_kind = ?{}", values.len()));
            }
            if let Some(status) = filter.status {
                values.push(status.as_str().to_string().into());
                clauses.push(format!("status = ?{}", values.len()));
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            values.push((filter.limit as i64).into());
            let sql = format!(
                "SELECT {} FROM run_records {} ORDER BY started_at DESC, rowid DESC LIMIT ?{}",
                RUN_COLUMNS,
                where_sql,
                values.len()
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), RawRun::from_row)?;
            let mut runs = Vec::new();
            for r in rows {
                runs.push(r?.into_record()?);
            }
            Ok(runs)
        })
        .await
    }

    async fn aggregate_stats(&self) -> Result<RunStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM run_records GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut counts: HashMap<RunStatus, u64> = HashMap::new();
            for r in rows {
                let (status, n) = r?;
                counts.insert(status.parse()?, n as u64);
            }
            Ok(stats_from(&counts))
        })
        .await
    }

    async fn fail_interrupted(&self, reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE run_records SET status = 'failed', completed_at = MAX(started_at, ?1), error = ?2
                 WHERE status IN ('pending', 'running')",
                params![ts(&at), reason],
            )?;
            Ok(changed)
        })
        .await
    }
}

fn stats_from(counts: &HashMap<RunStatus, u64>) -> RunStats {
    let n = |s: RunStatus| counts.get(&s).copied().unwrap_or(0);
    RunStats::from_counts(
        n(RunStatus::Success),
        n(RunStatus::Failed),
        n(RunStatus::Running),
        n(RunStatus::Pending),
        n(RunStatus::Skipped),
    )
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, JobDefinition>,
    /// Insertion order doubles as the tiebreak for equal start times.
    runs: Vec<RunRecord>,
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_jobs(&self) -> Result<Vec<JobDefinition>> {
        let state = self.state.read().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn insert_job(&self, job: &JobDefinition) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            anyhow::bail!("job '{}' already exists", job.id);
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(id) {
            Some(job) => {
                job.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_run_record(&self, record: &RunRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.runs.iter().any(|r| r.id == record.id) {
            state.runs.push(record.clone());
        }
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(r) = state.runs.iter_mut().find(|r| r.id == id) {
            r.start(started_at);
        }
        Ok(())
    }

    async fn update_run_record(&self, id: Uuid, completion: &Completion) -> Result<()> {
        let mut state = self.state.write().await;
        match state.runs.iter_mut().find(|r| r.id == id) {
            Some(r) => {
                r.apply(completion);
                Ok(())
            }
            None => anyhow::bail!("run record {} not found", id),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let state = self.state.read().await;
        let mut runs: Vec<(usize, &RunRecord)> =
            state.runs.iter().enumerate().filter(|(_, r)| filter.matches(r)).collect();
        runs.sort_by(|(ia, a), (ib, b)| b.started_at.cmp(&a.started_at).then(ib.cmp(ia)));
        Ok(runs.into_iter().take(filter.limit).map(|(_, r)| r.clone()).collect())
    }

    async fn aggregate_stats(&self) -> Result<RunStats> {
        let state = self.state.read().await;
        let mut counts: HashMap<RunStatus, u64> = HashMap::new();
        for r in &state.runs {
            *counts.entry(r.status).or_default() += 1;
        }
        Ok(stats_from(&counts))
    }

    async fn fail_interrupted(&self, reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let completion = Completion {
            status: RunStatus::Failed,
            completed_at: at,
            result: None,
            error: Some(reason.to_string()),
        };
        let mut n = 0;
        for r in state.runs.iter_mut().filter(|r| r.status.is_in_flight()) {
            r.apply(&completion);
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::history::{RunOutcome, TriggerSource};
    use chrono::{Duration, SubsecRound};
    use std::sync::Arc;

    fn sqlite_store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("test.db")).unwrap();
        (dir, SqliteJobStore::new(pool))
    }

    fn job(id: &str, kind: JobKind) -> JobDefinition {
        JobDefinition::new(id, id, "0 * * * *", kind).with_param("dir", "/tmp/x")
    }

    async fn exercise(store: Arc<dyn JobStore>) {
        store.insert_job(&job("cleanup_logs", JobKind::Cleanup)).await.unwrap();
        store.insert_job(&job("backup_daily", JobKind::Backup)).await.unwrap();
        assert!(store.insert_job(&job("backup_daily", JobKind::Backup)).await.is_err());

        let loaded = store.get_job("cleanup_logs").await.unwrap().unwrap();
        assert_eq!(loaded.param("dir"), Some("/tmp/x"));
        assert_eq!(store.load_jobs().await.unwrap().len(), 2);

        assert!(store.set_enabled("cleanup_logs", false).await.unwrap());
        assert!(!store.set_enabled("missing", false).await.unwrap());
        let enabled = store.load_enabled_jobs().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "backup_daily");

        // Whole seconds so records survive the timestamp round trip unchanged
        let t0 = Utc::now().trunc_subsecs(0);
        let cleanup = job("cleanup_logs", JobKind::Cleanup);
        let backup = job("backup_daily", JobKind::Backup);

        let mut ok = RunRecord::pending(Uuid::new_v4(), &cleanup, TriggerSource::Manual, 1, t0);
        store.save_run_record(&ok).await.unwrap();
        // Replaying the insert is harmless.
        store.save_run_record(&ok).await.unwrap();
        store.mark_running(ok.id, t0 + Duration::seconds(1)).await.unwrap();
        let done = Completion::new(&RunOutcome::Success("done".into()), t0 + Duration::seconds(2));
        store.update_run_record(ok.id, &done).await.unwrap();
        // Terminal records are immutable.
        let late = Completion::new(&RunOutcome::Failed("late".into()), t0 + Duration::seconds(3));
        store.update_run_record(ok.id, &late).await.unwrap();
        ok.start(t0 + Duration::seconds(1));
        ok.apply(&done);

        let failed = RunRecord::pending(Uuid::new_v4(), &backup, TriggerSource::Scheduled, 2, t0 + Duration::seconds(5));
        store.save_run_record(&failed).await.unwrap();
        store
            .update_run_record(failed.id, &Completion::new(&RunOutcome::Failed("disk full".into()), t0 + Duration::seconds(6)))
            .await
            .unwrap();

        let skipped = RunRecord::skipped(&cleanup, "previous run still in progress", t0 + Duration::seconds(7));
        store.save_run_record(&skipped).await.unwrap();

        let all = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, skipped.id, "newest first");
        assert_eq!(all[2], ok);

        let by_kind = store.list_runs(&RunFilter::default().with_kind(JobKind::Backup)).await.unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].error.as_deref(), Some("disk full"));
        assert_eq!(by_kind[0].attempt, 2);

        let by_status = store.list_runs(&RunFilter::for_job("cleanup_logs").with_status(RunStatus::Success)).await.unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(store.list_runs(&RunFilter::default().with_limit(1)).await.unwrap().len(), 1);

        let stats = store.aggregate_stats().await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.success_rate, 50.0);

        assert!(store.update_run_record(Uuid::new_v4(), &done).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let (_dir, store) = sqlite_store();
        exercise(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(Arc::new(MemoryJobStore::new())).await;
    }

    #[tokio::test]
    async fn test_fail_interrupted() {
        let (_dir, store) = sqlite_store();
        let def = job("cleanup_logs", JobKind::Cleanup);
        store.insert_job(&def).await.unwrap();
        let r = RunRecord::pending(Uuid::new_v4(), &def, TriggerSource::Scheduled, 1, Utc::now());
        store.save_run_record(&r).await.unwrap();
        store.mark_running(r.id, Utc::now()).await.unwrap();

        assert_eq!(store.fail_interrupted("interrupted by restart", Utc::now()).await.unwrap(), 1);
        let runs = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("interrupted by restart"));
        assert!(runs[0].completed_at.unwrap() >= runs[0].started_at);
    }
}
