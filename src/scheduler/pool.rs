//! Bounded executor pool.
//!
//! At most `size` job bodies run at once and at most `backlog` more may wait
//! for a worker. Admission is a two-step affair: a `Reservation` claims a
//! backlog slot synchronously, and `Reservation::submit` hands over the work.
//! Each body runs in its own task so a panic or an abort stays contained to
//! that one run.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::history::RunOutcome;
use super::queue::WorkItem;
use crate::error::EngineError;

/// How a single attempt ended, as seen by the worker.
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

#[derive(Clone)]
pub struct ExecutorPool {
    workers: Arc<Semaphore>,
    capacity: Arc<Semaphore>,
    size: usize,
    backlog: usize,
    active: Arc<AtomicUsize>,
    total_processed: Arc<AtomicU64>,
}

impl ExecutorPool {
    pub fn new(size: usize, backlog: usize) -> Self {
        let size = size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            capacity: Arc::new(Semaphore::new(size + backlog)),
            size,
            backlog,
            active: Arc::new(AtomicUsize::new(0)),
            total_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Claim a slot without waiting.
    pub fn try_reserve(&self) -> Result<Reservation, EngineError> {
        match self.capacity.clone().try_acquire_owned() {
            Ok(permit) => Ok(Reservation {
                permit,
                pool: self.clone(),
            }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(EngineError::PoolSaturated)
            }
        }
    }

    /// Wait until a slot frees up.
    pub async fn reserve(&self) -> Result<Reservation, EngineError> {
        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolSaturated)?;
        Ok(Reservation {
            permit,
            pool: self.clone(),
        })
    }

    /// Reserve and submit in one step; fails fast when the backlog is full.
    pub fn submit(&self, item: WorkItem) -> Result<RunHandle, EngineError> {
        Ok(self.try_reserve()?.submit(item))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Bodies currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accepted work still waiting for a worker.
    pub fn queued(&self) -> usize {
        let held = self.size + self.backlog - self.capacity.available_permits();
        held.saturating_sub(self.active())
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::SeqCst)
    }
}

/// A claimed backlog slot. Dropping it unused gives the slot back.
pub struct Reservation {
    permit: OwnedSemaphorePermit,
    pool: ExecutorPool,
}

impl Reservation {
    pub fn submit(self, item: WorkItem) -> RunHandle {
        let Reservation { permit, pool } = self;
        let run_id = item.run_id();
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        debug!(job = %item.job_id(), %run_id, queued = pool.queued(), "work accepted");

        tokio::spawn(async move {
            let worker = match pool.workers.clone().acquire_owned().await {
                Ok(worker) => worker,
                Err(_) => {
                    drop(permit);
                    let now = Utc::now();
                    let _ = done_tx.send(Execution {
                        run_id,
                        started_at: now,
                        finished_at: now,
                        outcome: RunOutcome::Failed("executor pool closed".into()),
                    });
                    return;
                }
            };

            let started_at = Utc::now();
            let _ = started_tx.send(started_at);
            pool.active.fetch_add(1, Ordering::SeqCst);

            let outcome = execute(item).await;

            pool.active.fetch_sub(1, Ordering::SeqCst);
            pool.total_processed.fetch_add(1, Ordering::SeqCst);
            drop(worker);
            drop(permit);

            let _ = done_tx.send(Execution {
                run_id,
                started_at,
                finished_at: Utc::now(),
                outcome,
            });
        });

        RunHandle {
            run_id,
            started: Some(started_rx),
            done: done_rx,
        }
    }
}

/// Completion signal for one submitted attempt.
pub struct RunHandle {
    pub run_id: Uuid,
    started: Option<oneshot::Receiver<DateTime<Utc>>>,
    done: oneshot::Receiver<Execution>,
}

impl RunHandle {
    /// Resolves when a worker picks the attempt up. `None` if it never will.
    pub async fn started(&mut self) -> Option<DateTime<Utc>> {
        match self.started.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }

    pub async fn finished(self) -> Execution {
        let run_id = self.run_id;
        match self.done.await {
            Ok(execution) => execution,
            Err(_) => {
                let now = Utc::now();
                Execution {
                    run_id,
                    started_at: now,
                    finished_at: now,
                    outcome: RunOutcome::Failed("worker exited without reporting".into()),
                }
            }
        }
    }
}

async fn execute(item: WorkItem) -> RunOutcome {
    let WorkItem {
        body, ctx, timeout, ..
    } = item;
    let cancel = ctx.cancel.clone();
    let job_id = ctx.job.id.clone();

    let mut task = tokio::spawn(async move { body.run(&ctx).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                task.abort();
                warn!(job = %job_id, ?limit, "job exceeded its timeout, worker aborted");
                return RunOutcome::Failed(EngineError::Timeout(limit).to_string());
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(value)) => RunOutcome::Success(render_result(value)),
        Ok(Err(e)) => RunOutcome::Failed(format!("{e:#}")),
        Err(e) => RunOutcome::Failed(describe_join_error(e)),
    }
}

fn render_result(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        format!("job panicked: {msg}")
    } else {
        "job cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobBody, JobContext, JobDefinition, JobKind};
    use crate::scheduler::history::TriggerSource;
    use crate::storage::MemoryJobStore;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Sleepy(Duration);

    #[async_trait::async_trait]
    impl JobBody for Sleepy {
        async fn run(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(self.0).await;
            Ok(serde_json::json!({ "attempt": ctx.attempt }))
        }
    }

    struct Boom;

    #[async_trait::async_trait]
    impl JobBody for Boom {
        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            panic!("disk on fire");
        }
    }

    struct Fails;

    #[async_trait::async_trait]
    impl JobBody for Fails {
        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("backup target unreachable")
        }
    }

    fn item(body: Arc<dyn JobBody>, timeout: Option<Duration>) -> WorkItem {
        let job = JobDefinition::new("t", "Test", "* * * * *", JobKind::Report);
        WorkItem {
            body,
            ctx: JobContext {
                job,
                run_id: Uuid::new_v4(),
                attempt: 1,
                data_dir: std::env::temp_dir(),
                store: Arc::new(MemoryJobStore::new()),
                cancel: CancellationToken::new(),
            },
            trigger: TriggerSource::Manual,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_success_result_is_json() {
        let pool = ExecutorPool::new(1, 0);
        let mut handle = pool
            .submit(item(Arc::new(Sleepy(Duration::ZERO)), None))
            .unwrap();
        assert!(handle.started().await.is_some());
        let exec = handle.finished().await;
        assert_eq!(exec.outcome, RunOutcome::Success(r#"{"attempt":1}"#.into()));
        assert!(exec.finished_at >= exec.started_at);
        assert_eq!(pool.total_processed(), 1);
    }

    #[tokio::test]
    async fn test_error_becomes_failed_outcome() {
        let pool = ExecutorPool::new(1, 0);
        let exec = pool.submit(item(Arc::new(Fails), None)).unwrap().finished().await;
        assert_eq!(exec.outcome, RunOutcome::Failed("backup target unreachable".into()));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let pool = ExecutorPool::new(1, 0);
        let exec = pool.submit(item(Arc::new(Boom), None)).unwrap().finished().await;
        match exec.outcome {
            RunOutcome::Failed(msg) => assert!(msg.contains("disk on fire"), "{msg}"),
            other => panic!("unexpected outcome {other:?}"),
        }
        // The worker slot came back.
        let exec = pool
            .submit(item(Arc::new(Sleepy(Duration::ZERO)), None))
            .unwrap()
            .finished()
            .await;
        assert!(exec.outcome.is_success());
    }

    #[tokio::test]
    async fn test_timeout_aborts_and_reports() {
        let pool = ExecutorPool::new(1, 0);
        let work = item(Arc::new(Sleepy(Duration::from_secs(30))), Some(Duration::from_millis(50)));
        let cancel = work.ctx.cancel.clone();
        let exec = pool.submit(work).unwrap().finished().await;
        assert_eq!(exec.outcome, RunOutcome::Failed("timed out after 0.05s".into()));
        assert!(cancel.is_cancelled());
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_saturation_rejects_beyond_backlog() {
        let pool = ExecutorPool::new(1, 1);
        let long = || item(Arc::new(Sleepy(Duration::from_millis(200))), None);

        let mut first = pool.submit(long()).unwrap();
        first.started().await;
        let second = pool.submit(long()).unwrap();
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.queued(), 1);

        assert!(matches!(pool.submit(long()), Err(EngineError::PoolSaturated)));

        first.finished().await;
        second.finished().await;
        assert!(pool.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_reservation_frees_slot() {
        let pool = ExecutorPool::new(1, 0);
        let reservation = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_err());
        drop(reservation);
        assert!(pool.try_reserve().is_ok());
    }
}
