//! Engine error taxonomy.
//!
//! Configuration errors reject a job before it reaches the registry,
//! concurrency-contract violations are returned synchronously to the caller,
//! and infrastructure errors never surface as job failures.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The schedule expression cannot be parsed or never fires.
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("job '{0}' not found")]
    NotFound(String),

    /// Single-flight: the job already has a run in progress (or is backing off).
    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("job '{0}' already exists")]
    Duplicate(String),

    /// Executor pool and its backlog are both full.
    #[error("executor pool saturated")]
    PoolSaturated,

    #[error("no handler registered for job kind '{0}'")]
    UnknownKind(String),

    /// Persistence is unreachable and the engine has degraded to read-only status reporting.
    #[error("engine is degraded to read-only mode")]
    Unavailable,

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn invalid_schedule(expr: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap an infrastructure failure from the store.
    pub fn store(err: anyhow::Error) -> Self {
        EngineError::Store(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            EngineError::NotFound("cleanup_logs".into()).to_string(),
            "job 'cleanup_logs' not found"
        );
        assert_eq!(
            EngineError::Timeout(Duration::from_secs(30)).to_string(),
            "timed out after 30s"
        );
        let e = EngineError::invalid_schedule("61 * * * *", "minute out of range");
        assert!(e.to_string().contains("61 * * * *"));
    }
}
