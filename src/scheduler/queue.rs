//! Work items handed from the coordinator to the executor pool.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::jobs::{JobBody, JobContext};
use crate::scheduler::history::TriggerSource;

/// One attempt of one job, ready to run.
pub struct WorkItem {
    pub body: Arc<dyn JobBody>,
    pub ctx: JobContext,
    pub trigger: TriggerSource,
    /// Hard limit for this attempt; the worker is aborted when it expires.
    pub timeout: Option<Duration>,
}

impl WorkItem {
    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn job_id(&self) -> &str {
        &self.ctx.job.id
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("job", &self.ctx.job.id)
            .field("run_id", &self.ctx.run_id)
            .field("attempt", &self.ctx.attempt)
            .field("trigger", &self.trigger)
            .field("timeout", &self.timeout)
            .finish()
    }
}
