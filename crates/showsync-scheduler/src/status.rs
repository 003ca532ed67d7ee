//! Per-task execution status: persistence, aggregate counts, and change
//! notification for UI surfaces.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use showsync_storage::{Result, ShowSyncStorage};
use showsync_types::{AggregateCounts, RunStatus, TaskStatusSnapshot};

/// What changed about a task's status.
#[derive(Debug, Clone)]
pub enum StatusChange {
    /// Execution started; `is_running` is now true.
    Started,
    /// Execution finished with a terminal status.
    Finished {
        status: RunStatus,
        error: Option<String>,
    },
    /// The task's schedule could not produce a next run time.
    ScheduleInvalid { message: String },
}

/// A status change notification.
#[derive(Debug, Clone)]
pub struct TaskStatusEvent {
    pub task_id: String,
    pub change: StatusChange,
}

/// Async status change handler.
pub type StatusHandler =
    Arc<dyn Fn(TaskStatusEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Records run outcomes and the running flag; notifies subscribers of
/// changes. Subscription replaces any ambient event bus — UI layers register
/// a handler and receive events on their own tasks.
pub struct StatusStore {
    storage: Arc<ShowSyncStorage>,
    running: RwLock<HashSet<String>>,
    handlers: RwLock<Vec<StatusHandler>>,
}

impl StatusStore {
    pub fn new(storage: Arc<ShowSyncStorage>) -> Self {
        Self {
            storage,
            running: RwLock::new(HashSet::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for task status changes.
    pub async fn subscribe(&self, handler: StatusHandler) {
        self.handlers.write().await.push(handler);
    }

    async fn notify(&self, event: TaskStatusEvent) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            let event = event.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
        }
    }

    /// Flag a task as running.
    pub async fn mark_running(&self, task_id: &str) {
        self.running.write().await.insert(task_id.to_string());
        self.notify(TaskStatusEvent {
            task_id: task_id.to_string(),
            change: StatusChange::Started,
        })
        .await;
    }

    /// Whether a task is currently executing in this process.
    pub async fn is_running(&self, task_id: &str) -> bool {
        self.running.read().await.contains(task_id)
    }

    /// Record a terminal run outcome and clear the running flag.
    pub async fn mark_finished(
        &self,
        task_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.running.write().await.remove(task_id);

        if let Some(mut task) = self.storage.get_task(task_id).await? {
            task.last_run = Some(Utc::now());
            task.last_run_status = Some(status);
            task.last_run_error = error.clone();
            task.updated_at = Utc::now();
            self.storage.save_task(&task).await?;
        } else {
            // Task deleted while it was running; nothing to persist
            tracing::debug!(task_id, "Finished run for a task that no longer exists");
        }

        self.notify(TaskStatusEvent {
            task_id: task_id.to_string(),
            change: StatusChange::Finished { status, error },
        })
        .await;
        Ok(())
    }

    /// Surface a schedule computation failure. The task keeps its previous
    /// run history; only the error field and next_run are touched.
    pub async fn record_schedule_error(&self, task_id: &str, message: &str) -> Result<()> {
        if let Some(mut task) = self.storage.get_task(task_id).await? {
            task.last_run_error = Some(format!("cannot arm timer: {message}"));
            task.next_run = None;
            task.updated_at = Utc::now();
            self.storage.save_task(&task).await?;
        }
        self.notify(TaskStatusEvent {
            task_id: task_id.to_string(),
            change: StatusChange::ScheduleInvalid {
                message: message.to_string(),
            },
        })
        .await;
        Ok(())
    }

    /// Persist a recomputed next run time.
    pub async fn set_next_run(
        &self,
        task_id: &str,
        next_run: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(mut task) = self.storage.get_task(task_id).await? {
            task.next_run = next_run;
            task.updated_at = Utc::now();
            self.storage.save_task(&task).await?;
        }
        Ok(())
    }

    /// Status of one task, or None if it does not exist.
    pub async fn snapshot(&self, task_id: &str) -> Result<Option<TaskStatusSnapshot>> {
        let Some(task) = self.storage.get_task(task_id).await? else {
            return Ok(None);
        };
        let is_running = self.is_running(task_id).await;
        Ok(Some(TaskStatusSnapshot {
            task_id: task.id,
            enabled: task.enabled,
            is_running,
            next_run: task.next_run,
            last_run: task.last_run,
            last_run_status: task.last_run_status,
            last_run_error: task.last_run_error,
        }))
    }

    /// Status of every task.
    pub async fn snapshots(&self) -> Result<Vec<TaskStatusSnapshot>> {
        let tasks = self.storage.get_tasks().await?;
        let running = self.running.read().await;
        Ok(tasks
            .into_iter()
            .map(|task| TaskStatusSnapshot {
                is_running: running.contains(&task.id),
                task_id: task.id,
                enabled: task.enabled,
                next_run: task.next_run,
                last_run: task.last_run,
                last_run_status: task.last_run_status,
                last_run_error: task.last_run_error,
            })
            .collect())
    }

    /// Aggregate counts for dashboards.
    pub async fn counts(&self) -> Result<AggregateCounts> {
        let tasks = self.storage.get_tasks().await?;
        let running = self.running.read().await;
        let mut counts = AggregateCounts::default();
        for task in &tasks {
            if task.enabled {
                counts.enabled += 1;
            } else {
                counts.disabled += 1;
            }
            if running.contains(&task.id) {
                counts.running += 1;
            }
            if task.last_run_status.is_some_and(RunStatus::is_failed) {
                counts.failed += 1;
            }
        }
        Ok(counts)
    }
}
