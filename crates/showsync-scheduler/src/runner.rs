//! One task execution: target resolution, importer invocation, timeout
//! enforcement, and outcome reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use showsync_storage::ShowSyncStorage;
use showsync_types::{MediaItem, RunStatus, ScheduledTask};

/// Default hard wall-clock limit for one task execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import request failed: {0}")]
    Request(String),
    #[error("target item is missing required fields: {0}")]
    Precondition(String),
    #[error("import was cancelled")]
    Cancelled,
}

/// What the importer accomplished.
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub episodes_updated: u32,
    pub detail: Option<String>,
}

/// The external import/upload collaborator. All metadata-source specifics
/// live behind this seam; the runner only orchestrates.
#[async_trait]
pub trait MetadataImporter: Send + Sync {
    /// Perform one import. Implementations must stop work promptly when
    /// `cancel` fires — the runner cancels it on timeout.
    async fn perform_import(
        &self,
        task: &ScheduledTask,
        item: &MediaItem,
        cancel: CancellationToken,
    ) -> Result<ImportSummary, ImportError>;
}

/// Terminal result of one run, ready for the status store.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunOutcome {
    fn success() -> Self {
        Self {
            status: RunStatus::Success,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// Whether this failure calls for the reference resolver.
    pub fn is_target_missing(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.starts_with("target not found"))
    }
}

/// Runs one task at a time under a hard timeout. Never returns an error:
/// every failure mode becomes a `RunOutcome` for the status store.
pub struct ExecutionRunner {
    storage: Arc<ShowSyncStorage>,
    importer: Arc<dyn MetadataImporter>,
    timeout: Duration,
}

impl ExecutionRunner {
    pub fn new(
        storage: Arc<ShowSyncStorage>,
        importer: Arc<dyn MetadataImporter>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            importer,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute the task against its target item.
    pub async fn run(&self, task: &ScheduledTask) -> RunOutcome {
        let item = match self.storage.get_item(&task.target_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                tracing::warn!(task_id = %task.id, target_id = %task.target_id, "Import target is gone");
                return RunOutcome::failed(format!("target not found: {}", task.target_id));
            }
            Err(e) => return RunOutcome::failed(format!("storage error: {e}")),
        };

        // The import runs on its own task so that timing out delivers a real
        // cancellation signal instead of silently dropping the call mid-await.
        let cancel = CancellationToken::new();
        let mut handle = {
            let importer = self.importer.clone();
            let task = task.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { importer.perform_import(&task, &item, cancel).await })
        };

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(summary))) => {
                tracing::info!(
                    task_id = %task.id,
                    episodes_updated = summary.episodes_updated,
                    "Import finished"
                );
                RunOutcome::success()
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(task_id = %task.id, error = %e, "Import failed");
                RunOutcome::failed(e.to_string())
            }
            Ok(Err(join_err)) => {
                tracing::error!(task_id = %task.id, error = %join_err, "Import task aborted");
                RunOutcome::failed(format!("import task aborted: {join_err}"))
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(task_id = %task.id, timeout_secs = self.timeout.as_secs(), "Import timed out");
                RunOutcome::failed(format!("timeout after {}s", self.timeout.as_secs()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;
    use showsync_types::{ImportAction, Schedule};

    fn sample_task(target_id: &str) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: "task-1".into(),
            target_id: target_id.into(),
            name: "Dark Harbor auto-import".into(),
            target_title: "Dark Harbor".into(),
            schedule: Schedule::Daily { hour: 4, minute: 0 },
            action: ImportAction::default(),
            enabled: true,
            last_run: None,
            last_run_status: None,
            last_run_error: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_item(id: &str) -> MediaItem {
        MediaItem {
            id: id.into(),
            title: "Dark Harbor".into(),
            year: Some(2021),
            is_anime: false,
            seasons: vec![1, 2],
            created_at: Utc::now(),
        }
    }

    struct OkImporter;

    #[async_trait]
    impl MetadataImporter for OkImporter {
        async fn perform_import(
            &self,
            _task: &ScheduledTask,
            _item: &MediaItem,
            _cancel: CancellationToken,
        ) -> Result<ImportSummary, ImportError> {
            Ok(ImportSummary {
                episodes_updated: 10,
                detail: None,
            })
        }
    }

    struct FailingImporter;

    #[async_trait]
    impl MetadataImporter for FailingImporter {
        async fn perform_import(
            &self,
            _task: &ScheduledTask,
            _item: &MediaItem,
            _cancel: CancellationToken,
        ) -> Result<ImportSummary, ImportError> {
            Err(ImportError::Precondition("no air date".into()))
        }
    }

    /// Sleeps until cancelled, recording whether cancellation was observed.
    struct SlowImporter {
        saw_cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MetadataImporter for SlowImporter {
        async fn perform_import(
            &self,
            _task: &ScheduledTask,
            _item: &MediaItem,
            cancel: CancellationToken,
        ) -> Result<ImportSummary, ImportError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    Err(ImportError::Cancelled)
                }
                _ = tokio::time::sleep(Duration::from_secs(600)) => Ok(ImportSummary::default()),
            }
        }
    }

    async fn storage_with_item(id: &str) -> Arc<ShowSyncStorage> {
        let storage = Arc::new(ShowSyncStorage::open_in_memory().unwrap());
        storage.save_item(&sample_item(id)).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_successful_run() {
        let storage = storage_with_item("item-1").await;
        let runner = ExecutionRunner::new(storage, Arc::new(OkImporter), DEFAULT_EXECUTION_TIMEOUT);

        let outcome = runner.run(&sample_task("item-1")).await;
        assert_eq!(outcome.status, RunStatus::Success);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_target() {
        let storage = Arc::new(ShowSyncStorage::open_in_memory().unwrap());
        let runner = ExecutionRunner::new(storage, Arc::new(OkImporter), DEFAULT_EXECUTION_TIMEOUT);

        let outcome = runner.run(&sample_task("gone")).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("target not found: gone"));
        assert!(outcome.is_target_missing());
    }

    #[tokio::test]
    async fn test_importer_failure_recorded() {
        let storage = storage_with_item("item-1").await;
        let runner =
            ExecutionRunner::new(storage, Arc::new(FailingImporter), DEFAULT_EXECUTION_TIMEOUT);

        let outcome = runner.run(&sample_task("item-1")).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.clone().unwrap().contains("no air date"));
        assert!(!outcome.is_target_missing());
    }

    #[tokio::test]
    async fn test_timeout_cancels_importer() {
        let storage = storage_with_item("item-1").await;
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let importer = Arc::new(SlowImporter {
            saw_cancel: saw_cancel.clone(),
        });
        let runner = ExecutionRunner::new(storage, importer, Duration::from_millis(50));

        let outcome = runner.run(&sample_task("item-1")).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("timeout"));

        // The cancellation signal reaches the importer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(saw_cancel.load(Ordering::SeqCst));
    }
}
