use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maintd::config::{EngineConfig, LogFormat, LoggingConfig};
use maintd::jobs::{JobDefinition, JobKind};
use maintd::scheduler::RunStatus;
use maintd::storage::RunFilter;
use maintd::Engine;

#[derive(Parser)]
#[command(
    name = "maintd",
    about = "Background maintenance job engine",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to ./maintd.toml, then /etc/maintd/maintd.toml)
    #[arg(long, global = true, env = "MAINTD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + executor pool)
    Serve,

    /// Manage job definitions
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Show run history, newest first
    Runs {
        /// Only runs of this job
        #[arg(long)]
        job: Option<String>,

        /// Only runs of this kind (backup, cleanup, report)
        #[arg(long)]
        kind: Option<JobKind>,

        /// Only runs in this status (pending, running, success, failed, skipped)
        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Aggregate run statistics
    Stats {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u32,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List all jobs
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Add a new job
    Add {
        /// Unique job id
        #[arg(long)]
        id: String,

        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,

        /// Cron expression (5-field, UTC)
        #[arg(long)]
        schedule: String,

        /// Job kind: backup, cleanup or report
        #[arg(long)]
        kind: JobKind,

        /// Kind-specific parameter, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Enable a job
    Enable {
        #[arg(long)]
        id: String,
    },

    /// Disable a job (history is kept)
    Disable {
        #[arg(long)]
        id: String,
    },

    /// Run a job now in this process and wait for it
    Trigger {
        #[arg(long)]
        id: String,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Stderr subscriber used while the config (and its log settings) is loading.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        match &cli.config {
            Some(path) => EngineConfig::load(path),
            None => Ok(EngineConfig::load_or_default()),
        }
    })?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    if !matches!(cli.command, Commands::Serve) {
        config = config.one_shot();
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(db = %config.storage.db_path.display(), "Starting maintd daemon");
            maintd::serve(config).await?;
        }
        Commands::Jobs { action } => {
            let engine = Engine::open(config).await?;
            let api = engine.api();

            match action {
                JobsAction::List { json } => {
                    let jobs = api.list_jobs().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&jobs)?);
                    } else if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<16} | {:<13} | {:<8} | {:<7} | {:<8} | Next run",
                            "Id", "Schedule", "Kind", "Enabled", "Status"
                        );
                        println!("{:-<16}-|-{:-<13}-|-{:-<8}-|-{:-<7}-|-{:-<8}-|-{:-<25}", "", "", "", "", "", "");
                        for job in jobs {
                            let status = serde_json::to_value(job.status)?;
                            println!(
                                "{:<16} | {:<13} | {:<8} | {:<7} | {:<8} | {}",
                                job.id,
                                job.schedule,
                                job.kind,
                                job.enabled,
                                status.as_str().unwrap_or_default(),
                                job.next_run
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| "-".to_string()),
                            );
                        }
                    }
                }
                JobsAction::Add {
                    id,
                    name,
                    schedule,
                    kind,
                    params,
                    disabled,
                } => {
                    let name = name.unwrap_or_else(|| id.clone());
                    let mut def = JobDefinition::new(id, name, schedule, kind).with_enabled(!disabled);
                    for (k, v) in params {
                        def = def.with_param(k, v);
                    }
                    let def = api.add_job(def).await?;
                    println!("Job '{}' added.", def.id);
                }
                JobsAction::Enable { id } => {
                    api.toggle_job(&id, true).await?;
                    println!("Job '{}' enabled.", id);
                }
                JobsAction::Disable { id } => {
                    api.toggle_job(&id, false).await?;
                    println!("Job '{}' disabled.", id);
                }
                JobsAction::Trigger { id } => {
                    let response = api.trigger_job(&id)?;
                    println!("{} (run {})", response.message, response.run_id);
                    engine.coordinator().wait_idle().await;
                    engine.coordinator().flush_outbox().await;
                    let parked = engine.coordinator().outbox().len();
                    if parked > 0 {
                        anyhow::bail!("{} run writes for job '{}' could not be stored", parked, id);
                    }

                    let runs = api.list_runs(&RunFilter::for_job(&id).with_limit(1)).await?;
                    let run = runs.runs.first().context("run record missing")?;
                    match &run.error {
                        Some(error) => anyhow::bail!("job '{}' failed: {}", id, error),
                        None => println!("Result: {}", run.result.as_deref().unwrap_or("-")),
                    }
                }
            }
        }
        Commands::Runs {
            job,
            kind,
            status,
            limit,
            json,
        } => {
            let engine = Engine::open(config).await?;
            let filter = RunFilter {
                job_id: job,
                kind,
                status,
                limit,
            };
            let list = engine.api().list_runs(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.runs.is_empty() {
                println!("No runs found.");
            } else {
                for run in list.runs {
                    let status = serde_json::to_value(run.status)?;
                    println!(
                        "{} {:<16} #{} {:<8} {}",
                        run.started_at.to_rfc3339(),
                        run.job_id,
                        run.attempt,
                        status.as_str().unwrap_or_default(),
                        run.error.or(run.result).unwrap_or_default(),
                    );
                }
            }
        }
        Commands::Stats { json } => {
            let engine = Engine::open(config).await?;
            let stats = engine.api().run_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Total executions: {}", stats.total_executions);
                println!("Completed:        {}", stats.completed);
                println!("Failed:           {}", stats.failed);
                println!("Running:          {}", stats.running);
                println!("Skipped:          {}", stats.skipped);
                println!("Success rate:     {:.2}%", stats.success_rate);
            }
        }
        Commands::DryRun { hours } => {
            let engine = Engine::open(config).await?;
            let preview = engine.api().preview(hours);
            let hours = hours.min(maintd::api::MAX_PREVIEW_HOURS);
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} ({})", run.at.to_rfc3339(), run.job_id, run.kind);
                }
            }
        }
    }

    Ok(())
}
