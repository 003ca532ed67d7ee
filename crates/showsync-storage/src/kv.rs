//! Generic key-value contract over the config_values table.
//!
//! The lock manager talks to storage only through this trait, so the
//! check-then-write locking scheme can later move onto a backend with a real
//! atomic primitive without touching callers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Result, ShowSyncStorage};

/// String key-value store with prefix listing.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;
    /// Returns false if the key did not exist.
    async fn delete_value(&self, key: &str) -> Result<bool>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl KvStore for ShowSyncStorage {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        ShowSyncStorage::get_value(self, key).await
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        ShowSyncStorage::set_value(self, key, value).await
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        ShowSyncStorage::delete_value(self, key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        ShowSyncStorage::list_keys(self, prefix).await
    }
}

/// In-memory key-value store (for testing).
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        Ok(self.values.write().await.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
