//! Per-script value storage, kept apart from the script records so page
//! contexts can read values without loading whole records.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::StoreResult;
use crate::script::ScriptId;
use crate::storage::{Area, Storage};

/// Batched access to `value:<id>` blobs. Each blob is a JSON object of the
/// script's stored values.
#[derive(Clone)]
pub struct ValueStore {
    storage: Storage,
}

impl ValueStore {
    pub(crate) fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stored values of the given scripts; scripts without values are omitted
    pub async fn get_many(&self, ids: &[ScriptId]) -> StoreResult<HashMap<ScriptId, Value>> {
        let data = self.storage.get_multi(Area::Value, ids).await?;
        Ok(data
            .into_iter()
            .filter_map(|(id, value)| Some((id.parse().ok()?, value)))
            .collect())
    }

    /// Values of one script, an empty object when none are stored
    pub async fn get(&self, id: ScriptId) -> StoreResult<Value> {
        Ok(self
            .storage
            .get_one(Area::Value, id)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Replace the value blobs of several scripts in one write
    pub async fn set_many(&self, values: HashMap<ScriptId, Value>) -> StoreResult<()> {
        debug!("Writing values of {} scripts", values.len());
        self.storage.dump(Area::Value, values.into_iter().collect()).await?;
        Ok(())
    }

    pub async fn remove_many(&self, ids: &[ScriptId]) -> StoreResult<()> {
        self.storage.remove_multi(Area::Value, ids).await?;
        Ok(())
    }

    /// Set one key of a script's values, or delete it with `None`.
    ///
    /// Read-modify-write: concurrent updates to the same script may race.
    pub async fn update(&self, id: ScriptId, key: &str, value: Option<Value>) -> StoreResult<Value> {
        let mut values = match self.get(id).await? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        match value {
            Some(value) => {
                values.insert(key.to_string(), value);
            }
            None => {
                values.remove(key);
            }
        }
        let values = Value::Object(values);
        self.storage.set(Area::Value, id, values.clone()).await?;
        Ok(values)
    }
}
