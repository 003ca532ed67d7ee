//! showsync-storage: SQLite-based persistence for tasks, media items, and
//! generic key-value state.
//!
//! One database file is shared by every showsync process on the machine;
//! cross-process coordination happens through the lock records stored in the
//! key-value table (see showsync-locks).

pub mod kv;

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use showsync_types::{ImportAction, MediaItem, RunStatus, Schedule, ScheduledTask};

pub use kv::{KvStore, MemoryKvStore};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        target_id TEXT NOT NULL,
        name TEXT NOT NULL,
        target_title TEXT NOT NULL,
        schedule TEXT NOT NULL,
        action TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run TEXT,
        last_run_status TEXT,
        last_run_error TEXT,
        next_run TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS media_items (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        year INTEGER,
        is_anime INTEGER NOT NULL DEFAULT 0,
        seasons TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS config_values (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

/// SQLite-based storage for showsync state.
pub struct ShowSyncStorage {
    conn: Arc<Mutex<Connection>>,
}

impl ShowSyncStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Tasks ───────────────────────────────────

    /// List all tasks.
    pub async fn get_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, target_id, name, target_title, schedule, action, enabled,
                        last_run, last_run_status, last_run_error, next_run, created_at, updated_at
                 FROM tasks ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([], task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, target_id, name, target_title, schedule, action, enabled,
                        last_run, last_run_status, last_run_error, next_run, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )?;
            let result = stmt
                .query_row(rusqlite::params![id], task_from_row)
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// Insert or update a task.
    pub async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.conn.clone();
        let task = task.clone();
        let schedule = serde_json::to_string(&task.schedule)?;
        let action = serde_json::to_string(&task.action)?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO tasks
                    (id, target_id, name, target_title, schedule, action, enabled,
                     last_run, last_run_status, last_run_error, next_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    target_id = excluded.target_id,
                    name = excluded.name,
                    target_title = excluded.target_title,
                    schedule = excluded.schedule,
                    action = excluded.action,
                    enabled = excluded.enabled,
                    last_run = excluded.last_run,
                    last_run_status = excluded.last_run_status,
                    last_run_error = excluded.last_run_error,
                    next_run = excluded.next_run,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    task.id,
                    task.target_id,
                    task.name,
                    task.target_title,
                    schedule,
                    action,
                    task.enabled as i32,
                    task.last_run.map(|t| t.to_rfc3339()),
                    task.last_run_status.map(run_status_to_str),
                    task.last_run_error,
                    task.next_run.map(|t| t.to_rfc3339()),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Delete a task. Returns false if it did not exist.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await?
    }

    // ─── Media Items ───────────────────────────────────

    /// List all tracked media items.
    pub async fn get_items(&self) -> Result<Vec<MediaItem>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, title, year, is_anime, seasons, created_at FROM media_items ORDER BY title",
            )?;
            let rows = stmt
                .query_map([], item_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Get a media item by ID.
    pub async fn get_item(&self, id: &str) -> Result<Option<MediaItem>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, title, year, is_anime, seasons, created_at FROM media_items WHERE id = ?1",
            )?;
            let result = stmt
                .query_row(rusqlite::params![id], item_from_row)
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// Insert or update a media item.
    pub async fn save_item(&self, item: &MediaItem) -> Result<()> {
        let conn = self.conn.clone();
        let item = item.clone();
        let seasons = serde_json::to_string(&item.seasons)?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO media_items (id, title, year, is_anime, seasons, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    item.id,
                    item.title,
                    item.year,
                    item.is_anime as i32,
                    seasons,
                    item.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Delete a media item. Returns false if it did not exist.
    pub async fn delete_item(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count =
                conn.execute("DELETE FROM media_items WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await?
    }

    // ─── Config Values ───────────────────────────────────

    /// Get a raw config value by key.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    "SELECT value FROM config_values WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// Set a raw config value.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO config_values (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
        .await?
    }

    /// Delete a config value. Returns false if it did not exist.
    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "DELETE FROM config_values WHERE key = ?1",
                rusqlite::params![key],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// List config keys with the given prefix.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT key FROM config_values WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![pattern], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
        .await?
    }
}

// ─── Row Mapping ───────────────────────────────────

fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
        RunStatus::UserInterrupted => "user_interrupted",
    }
}

fn run_status_from_str(s: &str) -> Option<RunStatus> {
    match s {
        "success" => Some(RunStatus::Success),
        "failed" => Some(RunStatus::Failed),
        "user_interrupted" => Some(RunStatus::UserInterrupted),
        _ => None,
    }
}

fn parse_timestamp(s: String) -> Option<chrono::DateTime<chrono::Utc>> {
    s.parse().ok()
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let schedule: Schedule = serde_json::from_str(&row.get::<_, String>(4)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?;
    let action: ImportAction = serde_json::from_str(&row.get::<_, String>(5)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        target_id: row.get(1)?,
        name: row.get(2)?,
        target_title: row.get(3)?,
        schedule,
        action,
        enabled: row.get::<_, i32>(6)? != 0,
        last_run: row.get::<_, Option<String>>(7)?.and_then(parse_timestamp),
        last_run_status: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(run_status_from_str),
        last_run_error: row.get(9)?,
        next_run: row.get::<_, Option<String>>(10)?.and_then(parse_timestamp),
        created_at: row
            .get::<_, String>(11)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: row
            .get::<_, String>(12)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaItem> {
    let seasons: Vec<u32> = serde_json::from_str(&row.get::<_, String>(4)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(MediaItem {
        id: row.get(0)?,
        title: row.get(1)?,
        year: row.get(2)?,
        is_anime: row.get::<_, i32>(3)? != 0,
        seasons,
        created_at: row
            .get::<_, String>(5)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}
