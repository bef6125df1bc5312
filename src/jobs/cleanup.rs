//! Cleanup job: remove aged files from a log directory.

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{JobBody, JobContext};

const DEFAULT_MAX_AGE_HOURS: u64 = 168;

pub struct CleanupJob;

#[async_trait::async_trait]
impl JobBody for CleanupJob {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let dir = ctx.dir_param("dir", "logs");
        let suffix = ctx.job.param("suffix").unwrap_or(".log").to_string();
        let max_age_hours = match ctx.job.param("max_age_hours") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("invalid max_age_hours '{}'", v))?,
            None => DEFAULT_MAX_AGE_HOURS,
        };
        let cutoff = max_age_hours
            .checked_mul(3600)
            .and_then(|secs| SystemTime::now().checked_sub(Duration::from_secs(secs)))
            .with_context(|| format!("max_age_hours {} out of range", max_age_hours))?;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Cleanup directory missing, nothing to do");
                return Ok(json!({ "files_removed": 0, "bytes_freed": 0 }));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", dir.display()))
            }
        };

        let mut removed = 0u64;
        let mut freed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            ctx.checkpoint()?;

            let path = entry.path();
            if !path.to_string_lossy().ends_with(&suffix) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::now());
            if modified > cutoff {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    freed += meta.len();
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
            }
        }

        info!(job = %ctx.job.id, dir = %dir.display(), removed, freed, "Cleanup finished");
        Ok(json!({ "files_removed": removed, "bytes_freed": freed }))
    }
}
