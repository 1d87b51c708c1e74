//! Key families on top of the raw backend.
//!
//! Every blob family lives under its own key prefix: `script:<id>`,
//! `code:<id>`, `value:<id>`, `cache:<url>`, `require:<url>` and `mod:<url>`
//! (fetch metadata used to avoid downloading unchanged dependencies).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{BackendResult, KeyValueBackend};
use crate::fetch::{FetchError, FetchOptions, RemoteFetcher, Validator};
use crate::path_map::is_data_uri;

/// A key family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Area {
    Script,
    Code,
    Value,
    Cache,
    Require,
    Mod,
}

impl Area {
    /// Blob families reconciled by a consistency pass
    pub const BLOBS: [Area; 4] = [Area::Value, Area::Cache, Area::Require, Area::Code];

    pub fn prefix(&self) -> &'static str {
        match self {
            Area::Script => "script:",
            Area::Code => "code:",
            Area::Value => "value:",
            Area::Cache => "cache:",
            Area::Require => "require:",
            Area::Mod => "mod:",
        }
    }

    pub fn name(&self) -> &'static str {
        self.prefix().trim_end_matches(':')
    }

    pub fn key(&self, id: impl Display) -> String {
        format!("{}{}", self.prefix(), id)
    }

    /// The id part of `key` when it belongs to this family
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix())
    }

    /// Only remote dependency families can be repaired by refetching
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Area::Cache | Area::Require)
    }
}

/// Fetch metadata stored under `mod:<url>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub fetched_at: i64,
}

/// Decode a `data:` URI into text
pub fn decode_data_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    if header.ends_with(";base64") {
        let bytes = STANDARD.decode(data.trim()).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        urlencoding::decode(data).ok().map(|s| s.into_owned())
    }
}

/// Turn a stored `cache:` blob (`<type>,<base64>`) into a data URI
pub fn cache_data_uri(blob: &str) -> Option<String> {
    let (content_type, data) = blob.split_once(',')?;
    Some(format!("data:{};base64,{}", content_type, data))
}

fn encode_blob(area: Area, url: &str, body: &[u8], content_type: Option<&str>) -> Value {
    match area {
        Area::Cache => {
            let content_type = content_type
                .map(|t| t.split(';').next().unwrap_or(t).trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| {
                    mime_guess::from_path(url.split(['?', '#']).next().unwrap_or(url))
                        .first_or_octet_stream()
                        .to_string()
                });
            Value::String(format!("{},{}", content_type, STANDARD.encode(body)))
        }
        _ => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

/// Typed access to the key families of one backend
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KeyValueBackend>,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl Storage {
    pub fn new(backend: Arc<dyn KeyValueBackend>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { backend, fetcher }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    pub async fn get_one(&self, area: Area, id: impl Display) -> BackendResult<Option<Value>> {
        let key = area.key(id);
        Ok(self.backend.get_multi(std::slice::from_ref(&key)).await?.remove(&key))
    }

    /// Read several ids of one family; the result is keyed by id
    pub async fn get_multi<T: Display>(
        &self,
        area: Area,
        ids: &[T],
    ) -> BackendResult<HashMap<String, Value>> {
        let keys: Vec<String> = ids.iter().map(|id| area.key(id)).collect();
        let mut data = self.backend.get_multi(&keys).await?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let id = id.to_string();
                data.remove(&area.key(&id)).map(|value| (id, value))
            })
            .collect())
    }

    pub async fn set(&self, area: Area, id: impl Display, value: Value) -> BackendResult<()> {
        self.backend.set_multi(vec![(area.key(id), value)]).await
    }

    /// Write several ids of one family in one batch
    pub async fn dump<T: Display>(&self, area: Area, entries: Vec<(T, Value)>) -> BackendResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.backend
            .set_multi(
                entries
                    .into_iter()
                    .map(|(id, value)| (area.key(id), value))
                    .collect(),
            )
            .await
    }

    pub async fn remove_multi<T: Display>(&self, area: Area, ids: &[T]) -> BackendResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = ids.iter().map(|id| area.key(id)).collect();
        self.backend.remove_multi(&keys).await
    }

    /// Store dependency content supplied by the caller instead of fetching it
    pub async fn store_dependency(&self, area: Area, url: &str, content: String) -> BackendResult<()> {
        self.set(area, url, Value::String(content)).await
    }

    /// Download `url` into `area`.
    ///
    /// When the blob already exists the request is made conditional on the
    /// recorded fetch metadata and a 304 keeps the stored copy.
    pub async fn fetch_into(
        &self,
        area: Area,
        url: &str,
        options: &FetchOptions,
        validator: Option<Validator>,
    ) -> Result<(), FetchError> {
        if is_data_uri(url) {
            return Ok(());
        }
        let blob_key = area.key(url);
        let mod_key = Area::Mod.key(url);
        let stored = self
            .backend
            .get_multi(&[blob_key.clone(), mod_key.clone()])
            .await
            .map_err(|e| FetchError::network(url, e.to_string()))?;

        let mut options = options.clone();
        let previous = stored
            .get(&mod_key)
            .and_then(|v| serde_json::from_value::<FetchMeta>(v.clone()).ok());
        if let (true, Some(previous)) = (stored.contains_key(&blob_key), previous.as_ref()) {
            if let Some(etag) = &previous.etag {
                options = options.header("If-None-Match", etag.clone());
            }
            if let Some(modified) = &previous.last_modified {
                options = options.header("If-Modified-Since", modified.clone());
            }
        }

        let response = self.fetcher.fetch(url, &options).await?;
        let mut meta = FetchMeta {
            etag: response.etag.clone(),
            last_modified: response.last_modified.clone(),
            fetched_at: Utc::now().timestamp_millis(),
        };

        let mut batch = Vec::with_capacity(2);
        if response.not_modified() {
            debug!("{} not modified", url);
            if let Some(previous) = previous {
                meta.etag = meta.etag.or(previous.etag);
                meta.last_modified = meta.last_modified.or(previous.last_modified);
            }
        } else {
            if let Some(validate) = validator {
                validate(url, &response.body, response.content_type.as_deref())?;
            }
            batch.push((
                blob_key,
                encode_blob(area, url, &response.body, response.content_type.as_deref()),
            ));
        }
        let meta = serde_json::to_value(meta).map_err(|e| FetchError::network(url, e.to_string()))?;
        batch.push((mod_key, meta));
        self.backend
            .set_multi(batch)
            .await
            .map_err(|e| FetchError::network(url, e.to_string()))
    }
}
