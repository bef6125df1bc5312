//! TOML configuration for the maintenance engine.
//!
//! Every section has compiled-in defaults, so a partial (or empty) file is
//! valid. The configuration is read once at startup and never changes during
//! the process lifetime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::jobs::JobKind;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MAINTD_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `$MAINTD_CONFIG`.
    /// 2. `./maintd.toml`.
    /// 3. `/etc/maintd/maintd.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MAINTD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        for candidate in ["maintd.toml", "/etc/maintd/maintd.toml"] {
            let path = Path::new(candidate);
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file exists but could not be loaded, trying fallback"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.pool_size == 0 {
            anyhow::bail!("engine.pool_size must be at least 1");
        }
        if self.engine.tick_interval_secs == 0 {
            anyhow::bail!("engine.tick_interval_secs must be at least 1");
        }
        for (kind, policy) in std::iter::once(("default".to_string(), &self.retry.default))
            .chain(self.retry.kinds.iter().map(|(k, p)| (k.to_string(), p)))
        {
            if policy.max_attempts == Some(0) {
                anyhow::bail!("retry policy '{}': max_attempts must be at least 1", kind);
            }
        }
        Ok(())
    }

    /// Settings for a short-lived CLI process. The fallback log belongs to
    /// the daemon: only `serve` replays it at startup and truncates it once
    /// drained, so a one-shot process must not write to it.
    pub fn one_shot(mut self) -> Self {
        self.storage.fallback_log = None;
        self
    }

    /// Effective retry/timeout policy for a job kind.
    pub fn policy_for(&self, kind: JobKind) -> RetryPolicy {
        let base = &self.retry.default;
        let over = self.retry.kinds.get(&kind);
        let pick = |f: fn(&PolicyOverride) -> Option<u64>, default: u64| {
            over.and_then(f).or(f(base)).unwrap_or(default)
        };
        RetryPolicy {
            max_attempts: over
                .and_then(|o| o.max_attempts)
                .or(base.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_base: Duration::from_millis(pick(|p| p.backoff_base_ms, DEFAULT_BACKOFF_BASE_MS)),
            backoff_cap: Duration::from_millis(pick(|p| p.backoff_cap_ms, DEFAULT_BACKOFF_CAP_MS)),
            timeout: over
                .and_then(|o| o.timeout_secs)
                .or(base.timeout_secs)
                .map(Duration::from_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between evaluator ticks.
    pub tick_interval_secs: u64,
    /// Number of concurrent workers.
    pub pool_size: usize,
    /// Work items that may wait for a worker beyond `pool_size`.
    pub backlog: usize,
    /// How long a scheduled dispatch waits for pool room before skipping.
    pub dispatch_wait_ms: u64,
    /// Store skipped scheduled occurrences as `skipped` run records.
    pub record_skipped: bool,
    /// Root for job outputs (backups, reports) and the default log directory.
    pub data_dir: PathBuf,
    /// On shutdown, how long in-flight runs may finish before they are cancelled.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            pool_size: 4,
            backlog: 16,
            dispatch_wait_ms: 1000,
            record_skipped: true,
            data_dir: PathBuf::from("data"),
            shutdown_grace_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Attempts per run-record write before it is parked in the outbox.
    pub write_attempts: u32,
    pub write_backoff_base_ms: u64,
    pub write_backoff_cap_ms: u64,
    /// Parked writes beyond which the engine degrades to read-only.
    pub outbox_capacity: usize,
    /// JSON-lines file receiving a copy of every parked write.
    pub fallback_log: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/maintd.db"),
            write_attempts: 5,
            write_backoff_base_ms: 200,
            write_backoff_cap_ms: 5000,
            outbox_capacity: 1024,
            fallback_log: Some(PathBuf::from("data/run_fallback.jsonl")),
        }
    }
}

impl StorageConfig {
    pub fn write_backoff(&self, attempt: u32) -> Duration {
        backoff(
            Duration::from_millis(self.write_backoff_base_ms),
            Duration::from_millis(self.write_backoff_cap_ms),
            attempt,
        )
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// Default policy at the top of `[retry]`, per-kind overrides under `[retry.kinds.<kind>]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(flatten)]
    pub default: PolicyOverride,
    #[serde(default)]
    pub kinds: BTreeMap<JobKind, PolicyOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: PolicyOverride {
                max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
                backoff_base_ms: Some(DEFAULT_BACKOFF_BASE_MS),
                backoff_cap_ms: Some(DEFAULT_BACKOFF_CAP_MS),
                timeout_secs: None,
            },
            kinds: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Total attempts including the first run.
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    /// Maximum execution time of one attempt.
    pub timeout_secs: Option<u64>,
}

/// Resolved policy for one job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        EngineConfig::default().policy_for(JobKind::Backup)
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff(self.backoff_base, self.backoff_cap, attempt)
    }
}

/// `min(base * 2^(attempt-1), cap)`.
pub fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// POST target for alerts.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
    /// SMTP delivery, enabled by an `[alert.email]` section.
    pub email: Option<EmailConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
            email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    /// 587 negotiates STARTTLS, 465 connects with implicit TLS.
    pub smtp_port: u16,
    /// Plaintext SMTP when false. Only for a local relay.
    pub tls: bool,
    /// `SMTP_USERNAME` / `SMTP_PASSWORD` are used when these are unset.
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            tls: true,
            username: None,
            password: None,
            from: "maintd@localhost".to_string(),
            to: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}
