//! In-memory view of every job and its next fire time.
//!
//! The registry is rebuilt from the store at startup and merged with it on
//! every tick, so mutations made by another process take effect without a
//! restart. Disabled jobs carry no fire time; re-enabling schedules from now
//! and never replays occurrences missed while disabled.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cron::CronSchedule;
use crate::error::EngineError;
use crate::jobs::{JobDefinition, JobKind};

/// Upper bound on occurrences listed per job by `preview`.
pub const PREVIEW_RUNS_PER_JOB: usize = 1000;

struct ScheduledJob {
    def: JobDefinition,
    schedule: CronSchedule,
    next_fire_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    fn new(def: JobDefinition, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let schedule = def.validate()?;
        let next_fire_at = if def.enabled {
            schedule.next_after(now)
        } else {
            None
        };
        Ok(Self {
            def,
            schedule,
            next_fire_at,
        })
    }

    fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled && !self.def.enabled {
            self.next_fire_at = self.schedule.next_after(now);
        } else if !enabled {
            self.next_fire_at = None;
        }
        self.def.enabled = enabled;
    }
}

/// A job as seen by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub def: JobDefinition,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// One entry of a dry-run preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub job_id: String,
    pub kind: JobKind,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored definitions. Definitions with a bad schedule are logged and left out.
    pub fn from_definitions(defs: Vec<JobDefinition>, now: DateTime<Utc>) -> Self {
        let registry = Self::new();
        registry.refresh(defs, now);
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<JobDefinition> {
        self.read().get(id).map(|j| j.def.clone())
    }

    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        self.read().get(id).and_then(|j| j.next_fire_at)
    }

    /// Add a new definition. Fails on a bad schedule or a taken id.
    pub fn insert(&self, def: JobDefinition, now: DateTime<Utc>) -> Result<(), EngineError> {
        let job = ScheduledJob::new(def, now)?;
        let mut jobs = self.write();
        if jobs.contains_key(&job.def.id) {
            return Err(EngineError::Duplicate(job.def.id.clone()));
        }
        debug!(job = %job.def.id, next = ?job.next_fire_at, "job registered");
        jobs.insert(job.def.id.clone(), job);
        Ok(())
    }

    /// Returns false when the job is unknown.
    pub fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> bool {
        match self.write().get_mut(id) {
            Some(job) => {
                job.set_enabled(enabled, now);
                true
            }
            None => false,
        }
    }

    /// Merge the stored definitions into the registry.
    ///
    /// Unchanged jobs keep their fire time; a changed schedule or a flip of the
    /// enabled flag recomputes it from `now`. Jobs gone from the store are dropped.
    pub fn refresh(&self, defs: Vec<JobDefinition>, now: DateTime<Utc>) {
        let mut jobs = self.write();
        let mut seen = Vec::with_capacity(defs.len());

        for def in defs {
            seen.push(def.id.clone());
            match jobs.get_mut(&def.id) {
                Some(existing) if existing.def.schedule == def.schedule => {
                    existing.set_enabled(def.enabled, now);
                    existing.def = def;
                }
                _ => match ScheduledJob::new(def, now) {
                    Ok(job) => {
                        if !jobs.contains_key(&job.def.id) {
                            info!(job = %job.def.id, schedule = %job.def.schedule, "job loaded");
                        }
                        jobs.insert(job.def.id.clone(), job);
                    }
                    Err(e) => warn!(error = %e, "ignoring job with invalid schedule"),
                },
            }
        }

        jobs.retain(|id, _| seen.contains(id));
    }

    /// Jobs whose fire time has arrived. Each one's fire time moves past `now`,
    /// so several missed occurrences collapse into one.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<JobDefinition> {
        let mut due = Vec::new();
        for job in self.write().values_mut() {
            if !job.def.enabled {
                continue;
            }
            if let Some(next) = job.next_fire_at {
                if next <= now {
                    due.push(job.def.clone());
                    job.next_fire_at = job.schedule.next_after(now);
                }
            }
        }
        due
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.read()
            .values()
            .map(|j| JobSnapshot {
                def: j.def.clone(),
                next_fire_at: j.next_fire_at,
            })
            .collect()
    }

    /// Every fire time of every enabled job in `(from, until]`, in time order.
    pub fn preview(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<PlannedRun> {
        let mut planned: Vec<PlannedRun> = self
            .read()
            .values()
            .filter(|j| j.def.enabled)
            .flat_map(|j| {
                j.schedule
                    .upcoming(from)
                    .take_while(move |at| *at <= until)
                    .take(PREVIEW_RUNS_PER_JOB)
                    .map(move |at| PlannedRun {
                        at,
                        job_id: j.def.id.clone(),
                        kind: j.def.kind,
                    })
            })
            .collect();
        planned.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.job_id.cmp(&b.job_id)));
        planned
    }
}
