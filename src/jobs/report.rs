//! Report job: run statistics and recent history written to a JSON report.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use super::{timestamp_slug, write_json, JobBody, JobContext};
use crate::storage::store::RunFilter;

const RECENT_RUNS: usize = 10;

pub struct ReportJob;

#[async_trait::async_trait]
impl JobBody for ReportJob {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let dest = ctx.dir_param("dest", "reports");

        let stats = ctx.store.aggregate_stats().await.context("failed to aggregate run stats")?;
        let recent = ctx
            .store
            .list_runs(&RunFilter::default().with_limit(RECENT_RUNS))
            .await
            .context("failed to list recent runs")?;
        ctx.checkpoint()?;

        let timestamp = timestamp_slug();
        let file = dest.join(format!("report_{}.json", timestamp));
        let report = json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "system_status": "operational",
            "stats": stats,
            "recent_runs": recent,
        });
        write_json(&file, &report).await?;

        info!(job = %ctx.job.id, file = %file.display(), "Report generated");
        Ok(json!({ "report_file": file.display().to_string() }))
    }
}
