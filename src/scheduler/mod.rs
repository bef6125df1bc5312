//! Scheduling engine: trigger evaluation, run coordination and execution.

pub mod coordinator;
pub mod cron;
pub mod engine;
pub mod history;
pub mod outbox;
pub mod pool;
pub mod profiles;
pub mod queue;
pub mod registry;

pub use self::coordinator::{Dispatch, JobPhase, LastRun, RunCoordinator};
pub use self::cron::{next_fire, CronSchedule};
pub use self::engine::{evaluate, run_scheduler_loop, TickReport};
pub use self::history::{RunOutcome, RunRecord, RunStats, RunStatus, TriggerSource};
pub use self::pool::ExecutorPool;
pub use self::registry::{JobRegistry, JobSnapshot, PlannedRun};
