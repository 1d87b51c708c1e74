use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{BackendResult, KeyValueBackend};

/// Volatile backend used by tests and embedders without persistence
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend pre-populated with `entries`
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get_multi(&self, keys: &[String]) -> BackendResult<HashMap<String, Value>> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    async fn get_all(&self) -> BackendResult<BTreeMap<String, Value>> {
        Ok(self.entries.read().await.clone())
    }

    async fn set_multi(&self, batch: Vec<(String, Value)>) -> BackendResult<()> {
        let mut entries = self.entries.write().await;
        entries.extend(batch);
        Ok(())
    }

    async fn remove_multi(&self, keys: &[String]) -> BackendResult<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
