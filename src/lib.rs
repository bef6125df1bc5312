//! maintd -- background maintenance job engine.
//!
//! This crate provides cron-style scheduling of maintenance jobs (backup,
//! log cleanup, reporting), bounded concurrent execution with retries and
//! timeouts, durable run history, failure alerting, and a status API.

pub mod alert;
pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alert::AlertDispatcher;
use crate::api::StatusApi;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::jobs::JobHandlers;
use crate::scheduler::{JobRegistry, RunCoordinator};
use crate::storage::{JobStore, SqliteJobStore};

/// A wired-up engine: store, registry, coordinator and the status API over them.
pub struct Engine {
    coordinator: Arc<RunCoordinator>,
    api: StatusApi,
}

impl Engine {
    /// Open the SQLite store named in `config` with the built-in job bodies.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
        let pool = storage::open_pool(&config.storage.db_path)?;
        let alerter = alert::from_config(&config.alert)?;
        Self::with_parts(
            config,
            Arc::new(SqliteJobStore::new(pool)),
            JobHandlers::with_defaults(),
            alerter,
        )
        .await
    }

    /// Assemble an engine from explicit parts. Seeds the default jobs into an empty store.
    pub async fn with_parts(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        handlers: JobHandlers,
        alerter: Arc<dyn AlertDispatcher>,
    ) -> Result<Self> {
        scheduler::profiles::seed_defaults(store.as_ref())
            .await
            .context("failed to seed default jobs")?;
        let defs = store.load_jobs().await.context("failed to load jobs")?;
        let registry = Arc::new(JobRegistry::from_definitions(defs, Utc::now()));

        let coordinator =
            RunCoordinator::new(Arc::new(config), store, registry, handlers, alerter);
        let api = StatusApi::new(Arc::clone(&coordinator));
        Ok(Self { coordinator, api })
    }

    pub fn api(&self) -> &StatusApi {
        &self.api
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    /// Startup recovery. Only the process that owns the scheduler may call this.
    pub async fn recover(&self) -> Result<()> {
        match self.coordinator.recover().await {
            Ok(_) => Ok(()),
            Err(EngineError::Unavailable) => {
                tracing::warn!("parked run writes could not be replayed, starting degraded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn the evaluator loop. Send `true` on the returned channel to stop it.
    pub fn spawn_scheduler(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let coordinator = Arc::clone(&self.coordinator);
        let interval = coordinator.config().engine.tick_interval();
        let handle = tokio::spawn(async move {
            scheduler::run_scheduler_loop(coordinator, interval, rx).await;
        });
        (tx, handle)
    }

    /// Stop the evaluator, then drain in-flight runs.
    pub async fn shutdown(&self, stop: watch::Sender<bool>, evaluator: JoinHandle<()>) {
        let _ = stop.send(true);
        if let Err(e) = evaluator.await {
            tracing::error!(error = %e, "scheduler loop ended abnormally");
        }
        let grace = self.coordinator.config().engine.shutdown_grace();
        self.coordinator.shutdown(grace).await;
    }
}

/// Start the daemon: recover, run the scheduler until Ctrl-C, then drain.
pub async fn serve(config: EngineConfig) -> Result<()> {
    let engine = Engine::open(config).await?;
    engine.recover().await?;

    let (stop, evaluator) = engine.spawn_scheduler();
    tracing::info!(
        jobs = engine.coordinator().registry().len(),
        workers = engine.coordinator().pool().size(),
        "maintd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    engine.shutdown(stop, evaluator).await;
    tracing::info!("maintd stopped");
    Ok(())
}
