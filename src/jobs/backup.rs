//! Backup job: snapshot of all job definitions to a timestamped JSON file.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use super::{timestamp_slug, write_json, JobBody, JobContext};

pub struct BackupJob;

#[async_trait::async_trait]
impl JobBody for BackupJob {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let dest = ctx.dir_param("dest", "backups");
        let jobs = ctx
            .store
            .load_jobs()
            .await
            .context("failed to read job definitions for backup")?;
        ctx.checkpoint()?;

        let timestamp = timestamp_slug();
        let file = dest.join(format!("backup_{}.json", timestamp));
        let snapshot = json!({
            "timestamp": timestamp,
            "type": "full_backup",
            "run_id": ctx.run_id,
            "jobs": jobs,
        });
        write_json(&file, &snapshot).await?;

        info!(job = %ctx.job.id, file = %file.display(), jobs = jobs.len(), "Backup written");
        Ok(json!({ "file": file.display().to_string(), "jobs": jobs.len() }))
    }
}
