//! The task scheduler: one armed timer per enabled task, lock-guarded
//! execution, and reconciliation against persisted state.
//!
//! The scheduler's timer map is a derived view — persisted tasks are the
//! source of truth, and `reconcile` rebuilds the view from them at startup.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use showsync_locks::{LockAttempt, LockManager};
use showsync_resolver::find_candidates;
use showsync_storage::{ShowSyncStorage, StorageError};
use showsync_types::{LockKind, MatchCandidate, ScheduledTask};

use crate::runner::{ExecutionRunner, RunOutcome};
use crate::schedule;
use crate::status::StatusStore;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("lock error: {0}")]
    Lock(#[from] showsync_locks::LockError),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Outcome of a manual "run now" request.
#[derive(Debug)]
pub enum RunNowOutcome {
    Completed(RunOutcome),
    /// The task holds an unexpired lock elsewhere — reported to the user,
    /// unlike the silent skip of a timed occurrence.
    AlreadyRunning { reason: String },
}

/// A task whose target id no longer resolves, with relink suggestions.
#[derive(Debug)]
pub struct InvalidTask {
    pub task: ScheduledTask,
    pub candidates: Vec<MatchCandidate>,
}

struct ArmedTimer {
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Owns the armed-timer set and drives lock-guarded execution.
pub struct TaskScheduler {
    storage: Arc<ShowSyncStorage>,
    locks: Arc<LockManager>,
    status: Arc<StatusStore>,
    runner: Arc<ExecutionRunner>,
    lock_timeout: Duration,
    timers: Mutex<HashMap<String, ArmedTimer>>,
}

impl TaskScheduler {
    /// Build the scheduler. Fails if the lock timeout does not exceed the
    /// execution timeout — a run must never outlive its own lock.
    pub fn new(
        storage: Arc<ShowSyncStorage>,
        locks: Arc<LockManager>,
        status: Arc<StatusStore>,
        runner: Arc<ExecutionRunner>,
        lock_timeout: Duration,
    ) -> Result<Arc<Self>> {
        if lock_timeout <= runner.timeout() {
            return Err(SchedulerError::Config(format!(
                "lock timeout ({:?}) must exceed execution timeout ({:?})",
                lock_timeout,
                runner.timeout()
            )));
        }
        Ok(Arc::new(Self {
            storage,
            locks,
            status,
            runner,
            lock_timeout,
            timers: Mutex::new(HashMap::new()),
        }))
    }

    /// Rebuild the timer set from persisted tasks and clear any locks left
    /// behind by crashed processes. Returns the number of armed tasks.
    pub async fn reconcile(self: &Arc<Self>) -> Result<usize> {
        let swept = self.locks.sweep_expired().await?;
        if swept > 0 {
            tracing::info!(swept, "Cleared stale locks at startup");
        }

        let tasks = self.storage.get_tasks().await?;
        for task in &tasks {
            self.sync_task(task).await?;
        }
        let armed = self.armed_count().await;
        tracing::info!(total = tasks.len(), armed, "Scheduler reconciled");
        Ok(armed)
    }

    /// Bring one task's timer in line with its persisted definition.
    /// Called on create, update, enable, and disable.
    ///
    /// A schedule that cannot produce a next run disarms the task and
    /// surfaces the problem through the status store; it is not an error at
    /// this boundary.
    pub async fn sync_task(self: &Arc<Self>, task: &ScheduledTask) -> Result<()> {
        self.disarm(&task.id).await;

        let next = match schedule::next_run(&task.schedule, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Cannot arm timer");
                self.status.record_schedule_error(&task.id, &e.to_string()).await?;
                return Ok(());
            }
        };
        self.status.set_next_run(&task.id, Some(next)).await?;

        if !task.enabled {
            // next_run stays informational; no timer for a disabled task
            return Ok(());
        }

        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let scheduler = Arc::clone(self);
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(task_id).await;
        });

        self.timers.lock().await.insert(
            task.id.clone(),
            ArmedTimer {
                fire_at: next,
                handle,
            },
        );
        tracing::debug!(task_id = %task.id, fire_at = %next, "Timer armed");
        Ok(())
    }

    /// Disarm a deleted task and drop our lock on it if we hold one.
    /// An execution already in flight is left to finish on its own.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        self.disarm(task_id).await;
        self.locks.release(task_id).await?;
        Ok(())
    }

    /// Cancel a pending timer. No effect on an in-flight execution.
    async fn disarm(&self, task_id: &str) {
        if let Some(timer) = self.timers.lock().await.remove(task_id) {
            timer.handle.abort();
            tracing::debug!(task_id, "Timer disarmed");
        }
    }

    /// One timer firing. Never propagates an error: whatever happens to this
    /// occurrence, the task is re-armed and other tasks are untouched.
    // Returns a boxed `Send` future rather than being a plain `async fn` so the
    // compiler can resolve `Send` for the `sync_task` → `fire` → `sync_task`
    // recursion: `sync_task` spawns `fire`, and `fire` re-arms via `sync_task`.
    // A boxed `dyn Future + Send` return type gives the spawn site a concrete
    // `Send` type instead of a cyclic opaque one. Behaviour is unchanged.
    fn fire(self: Arc<Self>, task_id: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.timers.lock().await.remove(&task_id);

            if let Err(e) = self.run_occurrence(&task_id).await {
                tracing::error!(task_id = %task_id, error = %e, "Task occurrence failed");
            }

            // Re-arm from fresh state — enabled may have changed while running
            match self.storage.get_task(&task_id).await {
                Ok(Some(task)) => {
                    if let Err(e) = self.sync_task(&task).await {
                        tracing::error!(task_id = %task_id, error = %e, "Failed to re-arm task");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(task_id = %task_id, error = %e, "Failed to reload task for re-arm"),
            }
        })
    }

    async fn run_occurrence(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.storage.get_task(task_id).await? else {
            return Ok(());
        };
        if !task.enabled {
            return Ok(());
        }

        match self
            .locks
            .acquire(task_id, LockKind::TaskExecution, self.lock_timeout)
            .await?
        {
            LockAttempt::Denied { reason } => {
                // Already running elsewhere; this occurrence is skipped, not
                // queued — the next one is armed by the caller.
                tracing::info!(task_id, reason = %reason, "Occurrence skipped");
                Ok(())
            }
            LockAttempt::Granted(_) => {
                self.status.mark_running(task_id).await;
                let outcome = self.runner.run(&task).await;
                let persisted = self
                    .status
                    .mark_finished(task_id, outcome.status, outcome.error.clone())
                    .await;
                if let Err(e) = self.locks.release(task_id).await {
                    tracing::warn!(task_id, error = %e, "Failed to release lock after run");
                }
                if outcome.is_target_missing() {
                    tracing::warn!(
                        task_id,
                        target_id = %task.target_id,
                        "Target is gone; clean_invalid_tasks will suggest replacements"
                    );
                }
                persisted?;
                Ok(())
            }
        }
    }

    /// Run a task immediately, outside its schedule. Lock denial is reported
    /// to the caller as "already running" instead of being silently skipped.
    pub async fn run_now(&self, task_id: &str) -> Result<RunNowOutcome> {
        let Some(task) = self.storage.get_task(task_id).await? else {
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };

        match self
            .locks
            .acquire(task_id, LockKind::TaskExecution, self.lock_timeout)
            .await?
        {
            LockAttempt::Denied { reason } => Ok(RunNowOutcome::AlreadyRunning { reason }),
            LockAttempt::Granted(_) => {
                self.status.mark_running(task_id).await;
                let outcome = self.runner.run(&task).await;
                let persisted = self
                    .status
                    .mark_finished(task_id, outcome.status, outcome.error.clone())
                    .await;
                if let Err(e) = self.locks.release(task_id).await {
                    tracing::warn!(task_id, error = %e, "Failed to release lock after run");
                }
                persisted?;
                Ok(RunNowOutcome::Completed(outcome))
            }
        }
    }

    /// Find every task whose target id no longer resolves and pair it with
    /// ranked relink candidates. Deletes nothing.
    pub async fn clean_invalid_tasks(&self) -> Result<Vec<InvalidTask>> {
        let tasks = self.storage.get_tasks().await?;
        let items = self.storage.get_items().await?;
        let known: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();

        let mut invalid = Vec::new();
        for task in tasks {
            if known.contains(task.target_id.as_str()) {
                continue;
            }
            let candidates = find_candidates(&task, &items);
            tracing::info!(
                task_id = %task.id,
                target_id = %task.target_id,
                candidates = candidates.len(),
                "Task has a dangling target"
            );
            invalid.push(InvalidTask { task, candidates });
        }
        Ok(invalid)
    }

    /// Number of currently armed timers.
    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// When the given task's timer will fire, if armed.
    pub async fn next_fire(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.timers.lock().await.get(task_id).map(|t| t.fire_at)
    }

    /// Disarm everything and release every lock this process holds.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        drop(timers);

        let released = self.locks.release_all().await;
        tracing::info!(released, "Scheduler shut down");
    }
}
