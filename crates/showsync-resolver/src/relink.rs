//! Batch re-pointing of tasks at a replacement item.

use chrono::Utc;

use showsync_storage::{Result, ShowSyncStorage};
use showsync_types::{MediaItem, RunStatus};

use crate::TASK_NAME_SUFFIX;

/// Per-task outcome of a batch relink.
#[derive(Debug, Clone)]
pub struct RelinkResult {
    pub task_id: String,
    pub relinked: bool,
    pub error: Option<String>,
}

/// Re-point every task that still references `dangling_id` and whose last
/// run failed at `new_item`.
///
/// Each task is saved individually: one failed save is reported in its
/// result and never aborts the rest of the batch.
pub async fn relink_batch(
    storage: &ShowSyncStorage,
    dangling_id: &str,
    new_item: &MediaItem,
) -> Result<Vec<RelinkResult>> {
    let tasks = storage.get_tasks().await?;
    let mut results = Vec::new();

    for mut task in tasks {
        let failed = task
            .last_run_status
            .is_some_and(RunStatus::is_failed);
        if task.target_id != dangling_id || !failed {
            continue;
        }

        task.target_id = new_item.id.clone();
        task.target_title = new_item.title.clone();
        // Keep the auto-import naming convention in step with the new target
        if task.name.ends_with(TASK_NAME_SUFFIX) {
            task.name = format!("{}{}", new_item.title, TASK_NAME_SUFFIX);
        }
        task.updated_at = Utc::now();

        let task_id = task.id.clone();
        match storage.save_task(&task).await {
            Ok(()) => {
                tracing::info!(task_id = %task_id, new_target = %new_item.id, "Task re-linked");
                results.push(RelinkResult {
                    task_id,
                    relinked: true,
                    error: None,
                });
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Task re-link failed");
                results.push(RelinkResult {
                    task_id,
                    relinked: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use showsync_types::{ImportAction, Schedule, ScheduledTask};

    fn task(id: &str, target_id: &str, status: Option<RunStatus>) -> ScheduledTask {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ScheduledTask {
            id: id.into(),
            target_id: target_id.into(),
            name: "Old Title auto-import".into(),
            target_title: "Old Title".into(),
            schedule: Schedule::Daily { hour: 4, minute: 0 },
            action: ImportAction::default(),
            enabled: true,
            last_run: None,
            last_run_status: status,
            last_run_error: None,
            next_run: None,
            created_at: t,
            updated_at: t,
        }
    }

    fn replacement() -> MediaItem {
        MediaItem {
            id: "item-new".into(),
            title: "New Title".into(),
            year: None,
            is_anime: false,
            seasons: vec![1],
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_relinks_only_failed_tasks_with_dangling_id() {
        let storage = ShowSyncStorage::open_in_memory().unwrap();
        storage
            .save_task(&task("a", "gone", Some(RunStatus::Failed)))
            .await
            .unwrap();
        storage
            .save_task(&task("b", "gone", Some(RunStatus::Failed)))
            .await
            .unwrap();
        // Same dangling id but last run succeeded: left alone
        storage
            .save_task(&task("c", "gone", Some(RunStatus::Success)))
            .await
            .unwrap();
        // Failed but points elsewhere: left alone
        storage
            .save_task(&task("d", "other", Some(RunStatus::Failed)))
            .await
            .unwrap();

        let results = relink_batch(&storage, "gone", &replacement()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.relinked && r.error.is_none()));

        let a = storage.get_task("a").await.unwrap().unwrap();
        assert_eq!(a.target_id, "item-new");
        assert_eq!(a.target_title, "New Title");
        assert_eq!(a.name, "New Title auto-import");

        let c = storage.get_task("c").await.unwrap().unwrap();
        assert_eq!(c.target_id, "gone");

        let d = storage.get_task("d").await.unwrap().unwrap();
        assert_eq!(d.target_id, "other");
    }

    #[tokio::test]
    async fn test_empty_batch_is_fine() {
        let storage = ShowSyncStorage::open_in_memory().unwrap();
        let results = relink_batch(&storage, "gone", &replacement()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_custom_task_names_are_preserved() {
        let storage = ShowSyncStorage::open_in_memory().unwrap();
        let mut t = task("a", "gone", Some(RunStatus::Failed));
        t.name = "my weekly refresh".into();
        storage.save_task(&t).await.unwrap();

        relink_batch(&storage, "gone", &replacement()).await.unwrap();
        let a = storage.get_task("a").await.unwrap().unwrap();
        assert_eq!(a.name, "my weekly refresh");
        assert_eq!(a.target_id, "item-new");
    }
}
