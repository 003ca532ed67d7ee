//! showsync-scheduler: recurring task scheduling and execution.
//!
//! One timer per enabled task; firing acquires the task's lock before the
//! execution runner is allowed to touch the import collaborator, so the same
//! task never runs twice concurrently even with several showsync processes
//! sharing one database.

pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod status;

pub use runner::{
    DEFAULT_EXECUTION_TIMEOUT, ExecutionRunner, ImportError, ImportSummary, MetadataImporter,
    RunOutcome,
};
pub use schedule::{ScheduleError, next_run};
pub use scheduler::{InvalidTask, RunNowOutcome, SchedulerError, TaskScheduler};
pub use status::{StatusChange, StatusHandler, StatusStore, TaskStatusEvent};
