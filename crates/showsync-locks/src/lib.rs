//! showsync-locks: time-bounded mutual-exclusion locks keyed by task id.
//!
//! Multiple showsync processes share one database; locks stored in the
//! key-value table are what keeps a task from running twice concurrently.
//! Locks self-expire so a crashed holder cannot deadlock a task forever.

pub mod manager;

use thiserror::Error;

pub use manager::{DEFAULT_LOCK_TIMEOUT, LockAttempt, LockManager};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("storage error: {0}")]
    Storage(#[from] showsync_storage::StorageError),
    #[error("lock record decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Key under which a task's lock record lives in the key-value store.
pub fn lock_key(task_id: &str) -> String {
    format!("lock:{task_id}")
}

/// Generate a holder identity for this execution context.
/// Unique across processes; stable within one process lifetime.
pub fn generate_holder_id() -> String {
    format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}
