//! Lock acquisition, release, extension, and expiry cleanup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use showsync_storage::KvStore;
use showsync_types::{LockInfo, LockKind};

use crate::{Result, lock_key};

/// Default lock lifetime. Callers pass a longer timeout for known long
/// executions; the scheduler derives its timeout from config.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of a lock acquisition attempt. Denial is a normal result, not an
/// error — the task is simply already running somewhere.
#[derive(Debug, Clone)]
pub enum LockAttempt {
    Granted(LockInfo),
    Denied { reason: String },
}

impl LockAttempt {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockAttempt::Granted(_))
    }
}

/// Manages time-bounded locks for one execution context.
///
/// The backing store offers no transactional primitive, so acquisition is a
/// check-then-write against "absent or expired". Two contexts observing
/// "absent" at the same instant can both write; this race is accepted, and
/// every read path self-heals expired records.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    holder_id: String,
    /// Task ids whose locks this context currently holds, for shutdown release.
    held: Mutex<HashSet<String>>,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, holder_id: String) -> Self {
        Self {
            kv,
            holder_id,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Read the current lock record for a task, deleting it if expired.
    pub async fn lock_info(&self, task_id: &str) -> Result<Option<LockInfo>> {
        let key = lock_key(task_id);
        let Some(raw) = self.kv.get_value(&key).await? else {
            return Ok(None);
        };
        let lock: LockInfo = serde_json::from_str(&raw)?;
        if lock.is_expired(Utc::now()) {
            tracing::debug!(task_id, lock_id = %lock.id, "Removing expired lock");
            self.kv.delete_value(&key).await?;
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Attempt to acquire the lock for a task.
    ///
    /// Re-entry by the same holder on an unexpired lock is idempotent and
    /// returns the existing record. A different unexpired holder yields
    /// `Denied` with the estimated release time.
    pub async fn acquire(
        &self,
        task_id: &str,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<LockAttempt> {
        let key = lock_key(task_id);
        let now = Utc::now();

        if let Some(raw) = self.kv.get_value(&key).await? {
            let existing: LockInfo = serde_json::from_str(&raw)?;
            if !existing.is_expired(now) {
                if existing.holder_id == self.holder_id {
                    tracing::debug!(task_id, lock_id = %existing.id, "Re-entrant acquire");
                    return Ok(LockAttempt::Granted(existing));
                }
                return Ok(LockAttempt::Denied {
                    reason: format!(
                        "task is locked by another process until about {}",
                        existing.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                });
            }
            // Expired: clear it before writing ours
            self.kv.delete_value(&key).await?;
        }

        let lock = LockInfo {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300)),
            holder_id: self.holder_id.clone(),
            kind,
        };
        self.kv
            .set_value(&key, &serde_json::to_string(&lock)?)
            .await?;
        self.held.lock().await.insert(task_id.to_string());
        tracing::debug!(task_id, lock_id = %lock.id, "Lock acquired");
        Ok(LockAttempt::Granted(lock))
    }

    /// Release a task's lock if this context holds it.
    /// Returns false (not an error) if the lock is gone or held elsewhere.
    pub async fn release(&self, task_id: &str) -> Result<bool> {
        let key = lock_key(task_id);
        self.held.lock().await.remove(task_id);

        let Some(raw) = self.kv.get_value(&key).await? else {
            return Ok(false);
        };
        let lock: LockInfo = serde_json::from_str(&raw)?;
        if lock.holder_id != self.holder_id {
            tracing::warn!(
                task_id,
                holder = %lock.holder_id,
                "Refusing to release lock held by another context"
            );
            return Ok(false);
        }
        self.kv.delete_value(&key).await?;
        tracing::debug!(task_id, lock_id = %lock.id, "Lock released");
        Ok(true)
    }

    /// Whether an unexpired lock exists for the task.
    /// Performs lazy expiry cleanup as a side effect.
    pub async fn is_locked(&self, task_id: &str) -> Result<bool> {
        Ok(self.lock_info(task_id).await?.is_some())
    }

    /// Push out the expiry of a lock this context holds.
    /// Used by long-running executions to avoid losing the lock mid-flight.
    pub async fn extend(&self, task_id: &str, additional: Duration) -> Result<bool> {
        let key = lock_key(task_id);
        let Some(raw) = self.kv.get_value(&key).await? else {
            return Ok(false);
        };
        let mut lock: LockInfo = serde_json::from_str(&raw)?;
        if lock.is_expired(Utc::now()) || lock.holder_id != self.holder_id {
            return Ok(false);
        }
        lock.expires_at =
            lock.expires_at + chrono::Duration::from_std(additional).unwrap_or(chrono::Duration::zero());
        self.kv
            .set_value(&key, &serde_json::to_string(&lock)?)
            .await?;
        tracing::debug!(task_id, expires_at = %lock.expires_at, "Lock extended");
        Ok(true)
    }

    /// Delete every expired lock record. Run once at startup; a periodic
    /// sweep only bounds storage growth, since read paths self-heal.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for key in self.kv.list_keys("lock:").await? {
            let Some(raw) = self.kv.get_value(&key).await? else {
                continue;
            };
            let expired = match serde_json::from_str::<LockInfo>(&raw) {
                Ok(lock) => lock.is_expired(now),
                // Unreadable record: treat as stale
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping undecodable lock record");
                    true
                }
            };
            if expired && self.kv.delete_value(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Swept expired locks");
        }
        Ok(removed)
    }

    /// Best-effort release of every lock this context holds.
    /// Called on shutdown; failures are logged, not propagated.
    pub async fn release_all(&self) -> usize {
        let task_ids: Vec<String> = self.held.lock().await.iter().cloned().collect();
        let mut released = 0;
        for task_id in task_ids {
            match self.release(&task_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to release lock on shutdown")
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showsync_storage::MemoryKvStore;

    fn manager(kv: &Arc<MemoryKvStore>, holder: &str) -> LockManager {
        LockManager::new(kv.clone() as Arc<dyn KvStore>, holder.to_string())
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let kv = Arc::new(MemoryKvStore::new());
        let locks = manager(&kv, "holder-a");

        let attempt = locks
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        assert!(attempt.is_granted());
        assert!(locks.is_locked("task-1").await.unwrap());

        assert!(locks.release("task-1").await.unwrap());
        assert!(!locks.is_locked("task-1").await.unwrap());
        // Releasing again reports the lock as already gone
        assert!(!locks.release("task-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let kv = Arc::new(MemoryKvStore::new());
        let a = manager(&kv, "holder-a");
        let b = manager(&kv, "holder-b");

        let first = a
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        assert!(first.is_granted());

        let second = b
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        match second {
            LockAttempt::Denied { reason } => assert!(reason.contains("until")),
            LockAttempt::Granted(_) => panic!("second holder must be denied"),
        }

        // The other holder cannot release it either
        assert!(!b.release("task-1").await.unwrap());
        assert!(a.is_locked("task-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reentrant_acquire_returns_existing_lock() {
        let kv = Arc::new(MemoryKvStore::new());
        let locks = manager(&kv, "holder-a");

        let first = match locks
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap()
        {
            LockAttempt::Granted(l) => l,
            _ => panic!(),
        };
        let second = match locks
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap()
        {
            LockAttempt::Granted(l) => l,
            _ => panic!(),
        };
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_expired_lock_self_heals() {
        let kv = Arc::new(MemoryKvStore::new());
        let a = manager(&kv, "holder-a");
        let b = manager(&kv, "holder-b");

        a.acquire("task-1", LockKind::TaskExecution, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The stale record is cleaned and the new acquire succeeds
        let attempt = b
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        assert!(attempt.is_granted());

        let info = b.lock_info("task-1").await.unwrap().unwrap();
        assert_eq!(info.holder_id, "holder-b");
    }

    #[tokio::test]
    async fn test_is_locked_cleans_expired_record() {
        let kv = Arc::new(MemoryKvStore::new());
        let locks = manager(&kv, "holder-a");

        locks
            .acquire("task-1", LockKind::Validation, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!locks.is_locked("task-1").await.unwrap());
        // The record itself is gone from the store
        assert!(kv.get_value("lock:task-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extend_by_holder_only() {
        let kv = Arc::new(MemoryKvStore::new());
        let a = manager(&kv, "holder-a");
        let b = manager(&kv, "holder-b");

        let lock = match a
            .acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap()
        {
            LockAttempt::Granted(l) => l,
            _ => panic!(),
        };

        assert!(!b.extend("task-1", Duration::from_secs(60)).await.unwrap());
        assert!(a.extend("task-1", Duration::from_secs(60)).await.unwrap());

        let extended = a.lock_info("task-1").await.unwrap().unwrap();
        assert!(extended.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let kv = Arc::new(MemoryKvStore::new());
        let locks = manager(&kv, "holder-a");

        locks
            .acquire("stale-1", LockKind::TaskExecution, Duration::from_millis(10))
            .await
            .unwrap();
        locks
            .acquire("stale-2", LockKind::StorageWrite, Duration::from_millis(10))
            .await
            .unwrap();
        locks
            .acquire("fresh", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(locks.sweep_expired().await.unwrap(), 2);
        assert!(locks.is_locked("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_on_shutdown() {
        let kv = Arc::new(MemoryKvStore::new());
        let a = manager(&kv, "holder-a");
        let b = manager(&kv, "holder-b");

        a.acquire("task-1", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        a.acquire("task-2", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();
        b.acquire("task-3", LockKind::TaskExecution, DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(a.release_all().await, 2);
        assert!(!a.is_locked("task-1").await.unwrap());
        assert!(!a.is_locked("task-2").await.unwrap());
        // Other holders' locks are untouched
        assert!(b.is_locked("task-3").await.unwrap());
    }
}
