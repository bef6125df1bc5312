//! Parked run-record writes.
//!
//! When the store keeps failing, writes are parked here in arrival order and
//! mirrored to a JSON-lines fallback file so they survive a restart. Once
//! anything is parked every later write queues behind it, which keeps the
//! per-record order Save, MarkRunning, Complete intact. The file is truncated
//! whenever the queue drains.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{Completion, RunRecord};
use crate::storage::JobStore;

/// One store mutation of a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingWrite {
    Save {
        record: RunRecord,
    },
    MarkRunning {
        id: Uuid,
        started_at: DateTime<Utc>,
    },
    Complete {
        id: Uuid,
        completion: Completion,
    },
}

impl PendingWrite {
    pub fn run_id(&self) -> Uuid {
        match self {
            PendingWrite::Save { record } => record.id,
            PendingWrite::MarkRunning { id, .. } | PendingWrite::Complete { id, .. } => *id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            PendingWrite::Save { .. } => "save",
            PendingWrite::MarkRunning { .. } => "mark_running",
            PendingWrite::Complete { .. } => "complete",
        }
    }

    /// Apply to the store. Every operation is idempotent, so replays are safe.
    pub async fn apply(&self, store: &dyn JobStore) -> Result<()> {
        match self {
            PendingWrite::Save { record } => store.save_run_record(record).await,
            PendingWrite::MarkRunning { id, started_at } => store.mark_running(*id, *started_at).await,
            PendingWrite::Complete { id, completion } => store.update_run_record(*id, completion).await,
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub remaining: usize,
}

pub struct Outbox {
    queue: Mutex<VecDeque<PendingWrite>>,
    len: AtomicUsize,
    capacity: usize,
    fallback: Option<PathBuf>,
}

impl Outbox {
    pub fn new(capacity: usize, fallback: Option<PathBuf>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            capacity: capacity.max(1),
            fallback,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// At or over capacity: the engine stops dispatching until this drains.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fallback_path(&self) -> Option<&Path> {
        self.fallback.as_deref()
    }

    /// Reload writes left in the fallback file by a previous process.
    pub async fn restore(&self) -> Result<usize> {
        let Some(path) = &self.fallback else {
            return Ok(0);
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let mut queue = self.queue.lock().await;
        let mut restored = 0;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PendingWrite>(line) {
                Ok(write) => {
                    queue.push_back(write);
                    restored += 1;
                }
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable fallback entry"),
            }
        }
        self.len.store(queue.len(), Ordering::SeqCst);
        if restored > 0 {
            info!(restored, path = %path.display(), "restored parked run writes");
        }
        Ok(restored)
    }

    /// Queue a write behind everything already parked.
    pub async fn park(&self, write: PendingWrite) {
        let mut queue = self.queue.lock().await;
        if let Some(path) = &self.fallback {
            if let Err(e) = append_line(path, &write).await {
                error!(error = %e, run_id = %write.run_id(), "failed to mirror parked write to disk");
            }
        }
        debug!(op = write.op(), run_id = %write.run_id(), "run write parked");
        queue.push_back(write);
        self.len.store(queue.len(), Ordering::SeqCst);
    }

    /// Apply parked writes in order, stopping at the first failure.
    pub async fn flush(&self, store: &dyn JobStore) -> FlushReport {
        let mut queue = self.queue.lock().await;
        let mut applied = 0;

        while let Some(write) = queue.front() {
            match write.apply(store).await {
                Ok(()) => {
                    queue.pop_front();
                    applied += 1;
                }
                Err(e) => {
                    debug!(error = %e, remaining = queue.len(), "store still unavailable");
                    break;
                }
            }
        }
        self.len.store(queue.len(), Ordering::SeqCst);

        if applied > 0 && queue.is_empty() {
            info!(applied, "parked run writes flushed");
            if let Some(path) = &self.fallback {
                if let Err(e) = tokio::fs::write(path, b"").await {
                    warn!(error = %e, path = %path.display(), "failed to truncate fallback log");
                }
            }
        }

        FlushReport {
            applied,
            remaining: queue.len(),
        }
    }
}

async fn append_line(path: &Path, write: &PendingWrite) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut line = serde_json::to_string(write).context("failed to serialize run write")?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDefinition, JobKind};
    use crate::scheduler::history::{RunOutcome, RunStatus, TriggerSource};
    use crate::storage::{MemoryJobStore, RunFilter};
    use std::sync::Arc;

    async fn store_with_job() -> (Arc<MemoryJobStore>, JobDefinition) {
        let store = Arc::new(MemoryJobStore::new());
        let job = JobDefinition::new("backup_daily", "Backup", "0 2 * * *", JobKind::Backup);
        store.insert_job(&job).await.unwrap();
        (store, job)
    }

    fn lifecycle(job: &JobDefinition) -> Vec<PendingWrite> {
        let t0 = Utc::now();
        let record = RunRecord::pending(Uuid::new_v4(), job, TriggerSource::Manual, 1, t0);
        let id = record.id;
        vec![
            PendingWrite::Save { record },
            PendingWrite::MarkRunning { id, started_at: t0 },
            PendingWrite::Complete {
                id,
                completion: Completion::new(&RunOutcome::Success("ok".into()), t0),
            },
        ]
    }

    #[tokio::test]
    async fn test_flush_applies_in_order() {
        let (store, job) = store_with_job().await;
        let outbox = Outbox::new(8, None);
        for w in lifecycle(&job) {
            outbox.park(w).await;
        }
        assert_eq!(outbox.len(), 3);

        let report = outbox.flush(store.as_ref()).await;
        assert_eq!(report, FlushReport { applied: 3, remaining: 0 });
        assert!(outbox.is_empty());

        let runs = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let (_, job) = store_with_job().await;
        let empty = MemoryJobStore::new();
        let outbox = Outbox::new(8, None);
        let mut writes = lifecycle(&job);
        // Complete without Save fails against a store that has never seen the record.
        outbox.park(writes.remove(2)).await;
        let report = outbox.flush(&empty).await;
        assert_eq!(report, FlushReport { applied: 0, remaining: 1 });
    }

    #[tokio::test]
    async fn test_capacity_marks_full() {
        let (_, job) = store_with_job().await;
        let outbox = Outbox::new(2, None);
        let mut writes = lifecycle(&job).into_iter();
        outbox.park(writes.next().unwrap()).await;
        assert!(!outbox.is_full());
        outbox.park(writes.next().unwrap()).await;
        assert!(outbox.is_full());
    }

    #[tokio::test]
    async fn test_fallback_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill").join("runs.jsonl");
        let (store, job) = store_with_job().await;

        let first = Outbox::new(8, Some(path.clone()));
        for w in lifecycle(&job) {
            first.park(w).await;
        }
        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
        assert!(lines.contains(r#""op":"mark_running""#));

        let second = Outbox::new(8, Some(path.clone()));
        assert_eq!(second.restore().await.unwrap(), 3);
        second.flush(store.as_ref()).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let runs = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_restore_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::new(8, Some(dir.path().join("missing.jsonl")));
        assert_eq!(outbox.restore().await.unwrap(), 0);
    }
}
