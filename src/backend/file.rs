use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BackendError, BackendResult, KeyValueBackend};

/// Backend persisting every entry into a single JSON object on disk.
///
/// The whole map is kept in memory and rewritten after each batch through a
/// temporary file, so an interrupted write leaves the previous file intact.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileBackend {
    /// Open `path`, starting empty when the file does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> BackendResult<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| BackendError::Corrupt {
                    key: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Data file {} not found, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, Value>) -> BackendResult<()> {
        let bytes = serde_json::to_vec(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for JsonFileBackend {
    async fn get_multi(&self, keys: &[String]) -> BackendResult<HashMap<String, Value>> {
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    async fn get_all(&self) -> BackendResult<BTreeMap<String, Value>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn set_multi(&self, batch: Vec<(String, Value)>) -> BackendResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.lock().await;
        entries.extend(batch);
        self.flush(&entries).await
    }

    async fn remove_multi(&self, keys: &[String]) -> BackendResult<()> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        for key in keys {
            entries.remove(key);
        }
        if entries.len() == before {
            return Ok(());
        }
        self.flush(&entries).await
    }
}
