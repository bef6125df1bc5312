//! Default job set, seeded into an empty store.

use anyhow::Result;
use tracing::info;

use crate::jobs::{JobDefinition, JobKind};
use crate::storage::JobStore;

/// Return the default out-of-box jobs.
pub fn defaults() -> Vec<JobDefinition> {
    vec![
        // 2am daily
        JobDefinition::new("backup_daily", "Daily Backup", "0 2 * * *", JobKind::Backup),
        // hourly
        JobDefinition::new("cleanup_logs", "Cleanup Old Logs", "0 * * * *", JobKind::Cleanup),
        // 9am daily
        JobDefinition::new("daily_report", "Generate Daily Report", "0 9 * * *", JobKind::Report),
    ]
}

/// Insert the defaults when the store holds no jobs at all. Returns how many were added.
pub async fn seed_defaults(store: &dyn JobStore) -> Result<usize> {
    if !store.load_jobs().await?.is_empty() {
        return Ok(0);
    }
    let jobs = defaults();
    for job in &jobs {
        store.insert_job(job).await?;
    }
    info!(count = jobs.len(), "seeded default jobs");
    Ok(jobs.len())
}
