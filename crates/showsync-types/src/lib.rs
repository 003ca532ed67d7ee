use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Schedule Types ────────────────────

/// When a recurring task fires.
///
/// Weekday numbering is ISO throughout the codebase: 0 = Monday .. 6 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every day at `hour:minute` (UTC).
    Daily { hour: u32, minute: u32 },
    /// Every week on `weekday` at `hour:minute` (UTC).
    /// `second_weekday` adds a second occurrence per week.
    Weekly {
        weekday: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        second_weekday: Option<u8>,
        hour: u32,
        minute: u32,
    },
}

// ──────────────────── Task Types ────────────────────

/// How the importer handles fields that already have a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    /// Leave existing metadata untouched.
    Skip,
    /// Replace existing metadata with the imported values.
    Overwrite,
    /// Fill empty fields only.
    #[default]
    Merge,
}

/// Per-task import parameters. Opaque to the scheduler — it is passed
/// through to the execution runner unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportAction {
    /// Season to import (whole show if None).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    /// Use absolute anime episode numbering.
    #[serde(default)]
    pub anime_numbering: bool,
    /// Re-download artwork even if present.
    #[serde(default)]
    pub refresh_artwork: bool,
    /// Conflict resolution mode.
    #[serde(default)]
    pub conflict_mode: ConflictMode,
}

/// Terminal status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    UserInterrupted,
}

impl RunStatus {
    pub fn is_failed(self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

/// A user-defined recurring import task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique task ID.
    pub id: String,
    /// ID of the tracked media item this task imports metadata for.
    /// May become dangling if the item is removed.
    pub target_id: String,
    /// Display name (auto-created tasks use "<title> auto-import").
    pub name: String,
    /// Cached title of the target item for display.
    pub target_title: String,
    /// When to run.
    pub schedule: Schedule,
    /// Import parameters, passed through to the runner.
    #[serde(default)]
    pub action: ImportAction,
    /// Whether the scheduler arms a timer for this task.
    pub enabled: bool,
    /// Last execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Outcome of the last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    /// Error detail of the last execution, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
    /// Next scheduled execution time. Recomputed whenever `schedule` or
    /// `enabled` changes; informational only while disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

// ──────────────────── Lock Types ────────────────────

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    TaskExecution,
    StorageWrite,
    Validation,
}

/// A time-bounded mutual-exclusion marker keyed by task id.
///
/// At most one unexpired lock may exist per task. A lock is released only by
/// the holder that created it, except during expiry cleanup which any
/// context may perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique per acquisition.
    pub id: String,
    /// The task this lock guards.
    pub task_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Identifies the acquiring execution context.
    pub holder_id: String,
    pub kind: LockKind,
}

impl LockInfo {
    /// Whether the lock has passed its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ──────────────────── Media Types ────────────────────

/// A tracked media item — the target of import tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    /// Unique item ID.
    pub id: String,
    /// Display title.
    pub title: String,
    /// First-air year, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    /// Whether the item is tracked as anime (absolute numbering source).
    #[serde(default)]
    pub is_anime: bool,
    /// Season numbers known for this item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seasons: Vec<u32>,
    /// When the item was added.
    pub created_at: DateTime<Utc>,
}

// ──────────────────── Resolver Types ────────────────────

/// A scored replacement suggestion for a task whose target is gone.
/// Produced by the reference resolver; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub item: MediaItem,
    pub score: i64,
    /// The highest-weighted contributing reason.
    pub primary_reason: String,
    /// All contributing reasons, for display.
    pub all_reasons: Vec<String>,
}

// ──────────────────── Status Types ────────────────────

/// Per-task status as read by UI surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusSnapshot {
    pub task_id: String,
    pub enabled: bool,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
}

/// Aggregate task counts for dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregateCounts {
    pub enabled: usize,
    pub disabled: usize,
    pub running: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> ScheduledTask {
        ScheduledTask {
            id: "task-1".into(),
            target_id: "item-1".into(),
            name: "Dark Harbor auto-import".into(),
            target_title: "Dark Harbor".into(),
            schedule: Schedule::Weekly {
                weekday: 0,
                second_weekday: Some(3),
                hour: 9,
                minute: 30,
            },
            action: ImportAction {
                season: Some(2),
                ..Default::default()
            },
            enabled: true,
            last_run: None,
            last_run_status: None,
            last_run_error: None,
            next_run: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_schedule_serde() {
        let daily = Schedule::Daily { hour: 4, minute: 15 };
        let json = serde_json::to_string(&daily).unwrap();
        assert!(json.contains("\"kind\":\"daily\""));
        let parsed: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, daily);

        // second_weekday is omitted when unset
        let weekly = Schedule::Weekly {
            weekday: 6,
            second_weekday: None,
            hour: 0,
            minute: 0,
        };
        let json = serde_json::to_string(&weekly).unwrap();
        assert!(!json.contains("second_weekday"));
    }

    #[test]
    fn test_task_serde_roundtrip() {
        let task = sample_task();
        let json = serde_json::to_string(&task).unwrap();
        let parsed: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "task-1");
        assert_eq!(parsed.schedule, task.schedule);
        assert_eq!(parsed.action.season, Some(2));
    }

    #[test]
    fn test_task_optional_fields_default() {
        // Older rows without status fields still deserialize
        let json = r#"{
            "id": "t", "target_id": "m", "name": "n", "target_title": "T",
            "schedule": {"kind": "daily", "hour": 1, "minute": 2},
            "enabled": false,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let task: ScheduledTask = serde_json::from_str(json).unwrap();
        assert!(task.last_run.is_none());
        assert!(task.last_run_status.is_none());
        assert_eq!(task.action.conflict_mode, ConflictMode::Merge);
    }

    #[test]
    fn test_run_status_serde() {
        let json = serde_json::to_string(&RunStatus::UserInterrupted).unwrap();
        assert_eq!(json, "\"user_interrupted\"");
        assert!(RunStatus::Failed.is_failed());
        assert!(!RunStatus::Success.is_failed());
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let lock = LockInfo {
            id: "lock-1".into(),
            task_id: "task-1".into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::minutes(5),
            holder_id: "holder-a".into(),
            kind: LockKind::TaskExecution,
        };
        assert!(!lock.is_expired(now));
        assert!(!lock.is_expired(now + chrono::Duration::minutes(4)));
        assert!(lock.is_expired(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_lock_kind_serde() {
        let json = serde_json::to_string(&LockKind::TaskExecution).unwrap();
        assert_eq!(json, "\"task_execution\"");
    }

    #[test]
    fn test_media_item_defaults() {
        let json = r#"{"id": "m", "title": "Show", "created_at": "2024-01-01T00:00:00Z"}"#;
        let item: MediaItem = serde_json::from_str(json).unwrap();
        assert!(!item.is_anime);
        assert!(item.seasons.is_empty());
        assert!(item.year.is_none());
    }
}
