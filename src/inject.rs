//! Injection environment builder.
//!
//! For a page URL this selects the matching scripts, splits them into an
//! eager bucket (`document-start`/`document-body`) and a deferred bucket,
//! and loads each bucket's code, dependencies and values in one batched
//! read. The eager bucket is returned directly; the deferred one resolves on
//! its own task.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::collaborators::Notification;
use crate::error::{StoreError, StoreResult};
use crate::path_map::{is_data_uri, refresh_path_map};
use crate::script::{RunAt, Script, ScriptId};
use crate::storage::{Area, decode_data_uri};
use crate::store::ScriptStore;

lazy_static! {
    /// Grants that give a script access to its stored values
    static ref VALUE_GRANT_RE: Regex =
        Regex::new(r"^GM[_.](listValues|([gs]et|delete)Value)$").unwrap();
}

const MISSING_TITLE: &str = "Missing resources";
const MISSING_TEXT: &str = "Reinstall these scripts to restore them:";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedScript {
    pub script: Script,
    pub run_at: RunAt,
}

/// Scripts of one run-timing bucket and the storage keys they need
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvBucket {
    pub ids: Vec<ScriptId>,
    pub require_keys: Vec<String>,
    pub cache_keys: Vec<String>,
    /// Scripts granted access to their values
    pub value_ids: Vec<ScriptId>,
    /// Dependency key -> scripts needing it
    pub deps_map: HashMap<String, Vec<ScriptId>>,
    pub scripts: Vec<InjectedScript>,
}

impl EnvBucket {
    fn add(&mut self, script: Script, run_at: RunAt) {
        let id = script.id();
        self.ids.push(id);
        if script.meta.grant.iter().any(|g| VALUE_GRANT_RE.is_match(g)) {
            self.value_ids.push(id);
        }
        for url in &script.meta.require {
            let key = script.resolve(url).to_string();
            Self::need(&mut self.require_keys, &mut self.deps_map, key, id);
        }
        for url in script.meta.resources.values() {
            let key = script.resolve(url).to_string();
            Self::need(&mut self.cache_keys, &mut self.deps_map, key, id);
        }
        self.scripts.push(InjectedScript { script, run_at });
    }

    fn need(
        keys: &mut Vec<String>,
        deps_map: &mut HashMap<String, Vec<ScriptId>>,
        key: String,
        id: ScriptId,
    ) {
        if !keys.contains(&key) {
            keys.push(key.clone());
        }
        let owners = deps_map.entry(key).or_default();
        if !owners.contains(&id) {
            owners.push(id);
        }
    }

    /// Backend keys to read; data URIs are resolved locally
    fn storage_keys(&self) -> Vec<String> {
        let ids = self
            .ids
            .iter()
            .map(|id| Area::Code.key(id))
            .chain(self.value_ids.iter().map(|id| Area::Value.key(id)));
        let urls = self
            .require_keys
            .iter()
            .map(|url| (Area::Require, url))
            .chain(self.cache_keys.iter().map(|url| (Area::Cache, url)))
            .filter(|(_, url)| !is_data_uri(url))
            .map(|(area, url)| area.key(url));
        ids.chain(urls).collect()
    }
}

/// A bucket with everything it needs to run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvData {
    #[serde(flatten)]
    pub bucket: EnvBucket,
    pub code: HashMap<ScriptId, String>,
    pub require: HashMap<String, String>,
    /// `cache:` blobs (`<type>,<base64>`) or inline data URIs
    pub cache: HashMap<String, String>,
    pub values: HashMap<ScriptId, Value>,
    /// Scripts whose code or dependencies are missing from storage
    pub missing_ids: Vec<ScriptId>,
}

/// Result of a batched read: the loaded data and the storage keys it lacked
struct Loaded {
    code: HashMap<ScriptId, String>,
    require: HashMap<String, String>,
    cache: HashMap<String, String>,
    values: HashMap<ScriptId, Value>,
    missing: Vec<(Area, String)>,
}

impl Loaded {
    fn from_data(bucket: &EnvBucket, mut data: HashMap<String, Value>) -> Self {
        let mut loaded = Loaded {
            code: HashMap::new(),
            require: HashMap::new(),
            cache: HashMap::new(),
            values: HashMap::new(),
            missing: Vec::new(),
        };
        let mut text = |area: Area, key: &str| -> Option<String> {
            data.remove(&area.key(key))
                .and_then(|v| v.as_str().map(str::to_string))
        };

        for id in &bucket.ids {
            match text(Area::Code, &id.to_string()) {
                Some(code) => {
                    loaded.code.insert(*id, code);
                }
                None => loaded.missing.push((Area::Code, id.to_string())),
            }
        }
        for url in &bucket.require_keys {
            let content = if is_data_uri(url) {
                Some(decode_data_uri(url).unwrap_or_else(|| {
                    warn!("Undecodable data URI in @require");
                    String::new()
                }))
            } else {
                text(Area::Require, url)
            };
            match content {
                Some(content) => {
                    loaded.require.insert(url.clone(), content);
                }
                None => loaded.missing.push((Area::Require, url.clone())),
            }
        }
        for url in &bucket.cache_keys {
            let content = if is_data_uri(url) {
                Some(url.clone())
            } else {
                text(Area::Cache, url)
            };
            match content {
                Some(content) => {
                    loaded.cache.insert(url.clone(), content);
                }
                None => loaded.missing.push((Area::Cache, url.clone())),
            }
        }
        for id in &bucket.value_ids {
            let values = data.remove(&Area::Value.key(id)).unwrap_or_else(|| json!({}));
            loaded.values.insert(*id, values);
        }
        loaded
    }

    /// Scripts affected by the missing keys, in ascending order
    fn missing_ids(&self, bucket: &EnvBucket) -> Vec<ScriptId> {
        let mut ids: Vec<ScriptId> = self
            .missing
            .iter()
            .flat_map(|(area, key)| match area {
                Area::Code => key.parse::<ScriptId>().ok().into_iter().collect::<Vec<_>>(),
                _ => bucket.deps_map.get(key).cloned().unwrap_or_default(),
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn into_env(self, bucket: EnvBucket, missing_ids: Vec<ScriptId>) -> EnvData {
        EnvData {
            bucket,
            code: self.code,
            require: self.require,
            cache: self.cache,
            values: self.values,
            missing_ids,
        }
    }
}

/// Resolution of the deferred bucket, running independently of the caller
#[derive(Debug)]
pub struct PendingEnv {
    handle: JoinHandle<StoreResult<EnvData>>,
}

impl PendingEnv {
    /// True once the bucket is loaded and `wait` returns immediately
    pub fn is_ready(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> StoreResult<EnvData> {
        self.handle
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Everything to inject into one page
#[derive(Debug)]
pub struct InjectionEnv {
    /// The eager bucket, fully loaded
    pub start: EnvData,
    /// Matching scripts that are disabled
    pub disabled_ids: Vec<ScriptId>,
    /// The deferred bucket, when any script landed in it
    pub deferred: Option<PendingEnv>,
}

/// Byte sizes of the parts of a script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSizes {
    pub id: ScriptId,
    pub code: usize,
    /// The serialized record
    pub record: usize,
    pub values: usize,
    pub require: usize,
    pub resource: usize,
}

/// Split scripts into eager and deferred buckets. In `combined` mode every
/// script, enabled or not, goes to the first bucket.
fn partition(scripts: Vec<Script>, combined: bool) -> (EnvBucket, EnvBucket, Vec<ScriptId>) {
    let mut eager = EnvBucket::default();
    let mut deferred = EnvBucket::default();
    let mut disabled = Vec::new();
    for mut script in scripts {
        if !combined && !script.config.enabled {
            disabled.push(script.id());
            continue;
        }
        if script.custom.path_map.is_none() {
            refresh_path_map(&mut script, None);
        }
        let run_at = script.run_at();
        if combined || run_at.is_eager() {
            eager.add(script, run_at);
        } else {
            deferred.add(script, run_at);
        }
    }
    (eager, deferred, disabled)
}

fn blob_len<'a>(
    script: &Script,
    blobs: &HashMap<String, String>,
    urls: impl Iterator<Item = &'a String>,
) -> usize {
    urls.filter_map(|url| blobs.get(script.resolve(url)))
        .map(String::len)
        .sum()
}

impl ScriptStore {
    /// Scripts to inject into `url`; `is_top` is false for sub-frames
    pub async fn scripts_for_url(&self, url: &str, is_top: bool) -> StoreResult<InjectionEnv> {
        let matcher = &self.inner.matcher;
        let matched: Vec<Script> = if matcher.is_blacklisted(url) {
            debug!("{} is blacklisted", url);
            Vec::new()
        } else {
            self.index()?
                .iter()
                .filter(|s| !s.config.removed && (is_top || !s.noframes()) && matcher.matches(url, s))
                .cloned()
                .collect()
        };

        let (eager, deferred, disabled_ids) = partition(matched, false);
        let deferred = (!deferred.ids.is_empty()).then(|| {
            let store = self.clone();
            PendingEnv {
                handle: tokio::spawn(async move { store.load_env(deferred, true).await }),
            }
        });
        let start = self.load_env(eager, true).await?;
        Ok(InjectionEnv {
            start,
            disabled_ids,
            deferred,
        })
    }

    /// Sizes of the given scripts, or of all of them
    pub async fn sizes(&self, ids: Option<&[ScriptId]>) -> StoreResult<Vec<ScriptSizes>> {
        let scripts: Vec<Script> = {
            let index = self.index()?;
            match ids {
                Some(ids) => ids.iter().filter_map(|id| index.get(*id).cloned()).collect(),
                None => index.iter().cloned().collect(),
            }
        };
        let (bucket, _, _) = partition(scripts, true);
        let env = self.load_env(bucket, false).await?;

        let json_len = |json: serde_json::Result<String>| json.map_or(0, |s| s.len().saturating_sub(2));
        let empty = json!({});
        Ok(env
            .bucket
            .scripts
            .iter()
            .map(|injected| {
                let script = &injected.script;
                let id = script.id();
                ScriptSizes {
                    id,
                    code: env.code.get(&id).map_or(0, String::len),
                    record: json_len(serde_json::to_string(script)),
                    values: json_len(serde_json::to_string(env.values.get(&id).unwrap_or(&empty))),
                    require: blob_len(script, &env.require, script.meta.require.iter()),
                    resource: blob_len(script, &env.cache, script.meta.resources.values()),
                }
            })
            .collect())
    }

    /// Read a bucket in one batch. With `repair`, missing keys trigger one
    /// vacuum and one more read.
    async fn load_env(&self, bucket: EnvBucket, repair: bool) -> StoreResult<EnvData> {
        let keys = bucket.storage_keys();
        let mut loaded = Loaded::from_data(&bucket, self.storage().backend().get_multi(&keys).await?);
        if !repair || loaded.missing.is_empty() {
            let missing_ids = loaded.missing_ids(&bucket);
            return Ok(loaded.into_env(bucket, missing_ids));
        }

        let fresh = self.fresh_missing(&loaded.missing)?;
        if !fresh.is_empty() {
            warn!("Storage is missing {}, vacuuming", fresh.join(", "));
            if self.vacuum().await.fixes > 0 {
                loaded = Loaded::from_data(&bucket, self.storage().backend().get_multi(&keys).await?);
            }
        }

        let missing_ids = loaded.missing_ids(&bucket);
        let abandoned = self.fresh_missing(&loaded.missing)?;
        if !abandoned.is_empty() {
            self.inner.abandoned_keys.lock()?.extend(abandoned);
            let names = {
                let index = self.index()?;
                missing_ids
                    .iter()
                    .map(|id| {
                        let name = index.get(*id).map_or_else(|| format!("#{}", id), Script::display_name);
                        format!("#{}: {}", id, name)
                    })
                    .collect::<Vec<_>>()
            };
            let text = format!("{}\n{}", MISSING_TEXT, names.join("\n"));
            error!("{} {}", MISSING_TITLE, text);
            self.raise(Notification {
                title: MISSING_TITLE.to_string(),
                text,
                script_ids: missing_ids.clone(),
            });
        }
        Ok(loaded.into_env(bucket, missing_ids))
    }

    /// Missing keys not already given up on
    fn fresh_missing(&self, missing: &[(Area, String)]) -> StoreResult<Vec<String>> {
        let abandoned = self.inner.abandoned_keys.lock()?;
        Ok(missing
            .iter()
            .map(|(area, key)| area.key(key))
            .filter(|key| !abandoned.contains(key))
            .collect())
    }
}
