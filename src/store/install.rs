use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{PendingDeps, ScriptStore, now_ms};
use crate::collaborators::ScriptEvent;
use crate::error::{StoreError, StoreResult};
use crate::fetch::{FetchError, FetchOptions, Validator, validate_image};
use crate::path_map::{DependencyKeys, build_path_map, is_data_uri, is_remote};
use crate::script::{ConfigPatch, CustomPatch, PropsPatch, Script, ScriptId, name_uri};
use crate::storage::Area;

const MSG_INSTALLED: &str = "Script installed.";
const MSG_UPDATED: &str = "Script updated.";
const MSG_FETCH_FAILED: &str = "Error fetching resource";

/// Install or update payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptSource {
    pub code: String,
    /// Update this record instead of looking it up by name and namespace
    pub id: Option<ScriptId>,
    /// Refuse to replace an existing script with the same identity
    pub is_new: bool,
    /// URL the script was installed from; base for relative dependencies
    pub url: Option<String>,
    /// Page the install was started from
    pub from: Option<String>,
    pub position: Option<u64>,
    /// Message reported on update; `None` uses the default
    pub message: Option<String>,
    pub config: ConfigPatch,
    pub custom: CustomPatch,
    pub props: PropsPatch,
    /// Dependency content supplied by the caller, keyed by resolved URL
    pub require: HashMap<String, String>,
    pub cache: HashMap<String, String>,
    /// Do not record dependency fetch failures on the script
    pub ignore_deps_errors: bool,
    /// Abort the install when a dependency cannot be fetched
    pub require_deps: bool,
}

impl ScriptSource {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }
}

/// Result of a successful install
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub script: Script,
    pub is_new: bool,
    pub message: String,
    /// Dependency fetch failures joined by newlines
    pub error: Option<String>,
}

struct Dependency {
    area: Area,
    url: String,
    validator: Option<Validator>,
}

/// Dependency keys an install is writing before its record is indexed.
/// Dropping the claim releases them.
struct DependencyClaim {
    store: ScriptStore,
    keys: Vec<(Area, String)>,
}

fn release(pending: &mut PendingDeps, keys: &[(Area, String)]) {
    for key in keys {
        if let Some(count) = pending.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                pending.remove(key);
            }
        }
    }
}

impl Drop for DependencyClaim {
    fn drop(&mut self) {
        let keys = std::mem::take(&mut self.keys);
        if keys.is_empty() {
            return;
        }
        if let Ok(mut pending) = self.store.inner.pending_deps.try_lock() {
            release(&mut pending, &keys);
            return;
        }
        // A deletion is choosing keys; release once it is done
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut pending = store.inner.pending_deps.lock().await;
            release(&mut pending, &keys);
        });
    }
}

impl ScriptStore {
    /// Record `src` as a new script or merge it into the existing one with
    /// the same id or name and namespace.
    ///
    /// Dependencies are fetched before the record is committed. Their keys
    /// are claimed first, so neither a consistency pass nor a purge deletes
    /// them as unreferenced in between. The uniqueness checks are repeated
    /// when committing, so a concurrent install of the same identity cannot
    /// slip in either.
    pub async fn install(&self, src: ScriptSource) -> StoreResult<InstallOutcome> {
        let mut meta = self.inner.parser.parse(&src.code)?;
        if meta.name.is_empty() {
            return Err(StoreError::invalid_script("no name"));
        }
        meta.dedup_grants();

        let base = {
            let index = self.index()?;
            let existing = src
                .id
                .and_then(|id| index.get(id))
                .or_else(|| index.find_uri(&name_uri(&meta, None)));
            if let Some(existing) = existing {
                if src.is_new {
                    return Err(StoreError::NamespaceConflict {
                        uri: existing.props.uri.clone(),
                    });
                }
            }
            src.url
                .clone()
                .filter(|u| !u.is_empty())
                .or_else(|| existing.and_then(|s| s.custom.last_install_url.clone()))
        };

        let path_map = build_path_map(&meta, base.as_deref());
        let mut draft = Script {
            meta: meta.clone(),
            ..Default::default()
        };
        draft.custom.path_map = Some(path_map.clone());
        let _claim = self.claim_dependencies(&draft).await;
        let errors = self.load_dependencies(&draft, &src).await?;
        if !errors.is_empty() && src.require_deps {
            return Err(StoreError::Fetch(errors[0].clone()));
        }
        let error = (!errors.is_empty() && !src.ignore_deps_errors).then(|| {
            errors
                .iter()
                .map(FetchError::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        });

        let (script, is_new) = {
            let mut index = self.index()?;
            let existing_id = src
                .id
                .filter(|id| index.get(*id).is_some())
                .or_else(|| index.find_uri(&name_uri(&meta, None)).map(Script::id));
            let existing = existing_id.and_then(|id| index.get(id)).cloned();
            let (mut script, is_new) = match existing {
                Some(existing) if src.is_new => {
                    return Err(StoreError::NamespaceConflict {
                        uri: existing.props.uri,
                    });
                }
                Some(existing) => (existing, false),
                None => {
                    let mut script = Script::default();
                    script.props.id = index.allocate_id();
                    script.props.position = index.allocate_position(src.position);
                    script.props.uuid = uuid::Uuid::new_v4();
                    (script, true)
                }
            };

            let uri = name_uri(&meta, Some(script.id()));
            if index.uri_owner_other_than(&uri, script.id()).is_some() {
                return Err(StoreError::NamespaceConflict { uri });
            }

            let now = now_ms();
            script.config.apply(&src.config);
            script.config.removed = false;
            script.custom.apply(&src.custom);
            script.props.last_modified = now;
            script.props.last_updated = now;
            script.props.apply(&src.props);
            if let Some(position) = src.position.filter(|p| *p > 0) {
                script.props.position = position;
            }
            script.props.uri = uri;
            if meta.homepage_url.is_none()
                && script.custom.homepage_url.is_none()
                && is_remote(src.from.as_deref())
            {
                script.custom.homepage_url = src.from.clone();
            }
            if is_remote(src.url.as_deref()) {
                script.custom.last_install_url = src.url.clone();
            }
            script.meta = meta;
            script.custom.path_map = Some(path_map);
            script.error = error.clone();
            index.upsert(script.clone());
            (script, is_new)
        };

        self.dump_scripts(&[script.id()]).await?;
        self.storage()
            .set(Area::Code, script.id(), Value::String(src.code))
            .await?;
        self.inner.abandoned_keys.lock()?.clear();

        let message = if is_new {
            MSG_INSTALLED.to_string()
        } else {
            src.message.unwrap_or_else(|| MSG_UPDATED.to_string())
        };
        info!(
            "{} #{} {}",
            if is_new { "Installed" } else { "Updated" },
            script.id(),
            script.display_name()
        );
        self.emit(ScriptEvent::Updated {
            id: script.id(),
            script: Box::new(script.clone()),
            message: message.clone(),
            is_new,
        });
        if let Some(error) = &error {
            self.emit(ScriptEvent::Error {
                id: script.id(),
                error: error.clone(),
                message: MSG_FETCH_FAILED.to_string(),
            });
        }
        self.request_sync();

        Ok(InstallOutcome {
            script,
            is_new,
            message,
            error,
        })
    }

    async fn claim_dependencies(&self, script: &Script) -> DependencyClaim {
        let keys: Vec<(Area, String)> = DependencyKeys::of(script)
            .blobs()
            .map(|(area, url)| (area, url.to_string()))
            .collect();
        let mut pending = self.inner.pending_deps.lock().await;
        for key in &keys {
            *pending.entry(key.clone()).or_default() += 1;
        }
        DependencyClaim {
            store: self.clone(),
            keys,
        }
    }

    /// Store preloaded dependencies and fetch the rest concurrently.
    /// Returns the failed fetches; backend failures abort.
    async fn load_dependencies(&self, script: &Script, src: &ScriptSource) -> StoreResult<Vec<FetchError>> {
        let meta = &script.meta;
        let mut deps: Vec<Dependency> = meta
            .require
            .iter()
            .map(|url| Dependency {
                area: Area::Require,
                url: script.resolve(url).to_string(),
                validator: None,
            })
            .chain(meta.resources.values().map(|url| Dependency {
                area: Area::Cache,
                url: script.resolve(url).to_string(),
                validator: None,
            }))
            .collect();
        if let Some(icon) = meta.icon.as_deref().filter(|i| is_remote(Some(i))) {
            deps.push(Dependency {
                area: Area::Cache,
                url: script.resolve(icon).to_string(),
                validator: Some(validate_image),
            });
        }

        let mut pending = Vec::new();
        for dep in deps {
            if dep.url.is_empty() || is_data_uri(&dep.url) {
                continue;
            }
            let preloaded = match dep.area {
                Area::Require => src.require.get(&dep.url),
                _ => src.cache.get(&dep.url),
            };
            match preloaded {
                Some(content) if dep.validator.is_none() => {
                    debug!("Using supplied content for {}", dep.url);
                    self.storage()
                        .store_dependency(dep.area, &dep.url, content.clone())
                        .await?;
                }
                _ => pending.push(dep),
            }
        }

        let options = FetchOptions {
            timeout_ms: Some(self.config().fetch.timeout_ms),
            ..Default::default()
        };
        let storage = self.storage();
        let results = join_all(pending.iter().map(|dep| {
            storage.fetch_into(dep.area, &dep.url, &options, dep.validator)
        }))
        .await;
        let errors: Vec<FetchError> = results.into_iter().filter_map(Result::err).collect();
        for error in &errors {
            warn!("Dependency of {} failed: {}", meta.name, error);
        }
        Ok(errors)
    }

    /// Refetch the dependencies of an installed script, keeping stored copies
    /// that are still current
    pub async fn refresh_dependencies(&self, id: ScriptId) -> StoreResult<Option<String>> {
        let script = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        let errors = self.load_dependencies(&script, &ScriptSource::default()).await?;
        let error = (!errors.is_empty()).then(|| {
            errors
                .iter()
                .map(FetchError::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        });
        let updated = {
            let mut index = self.index()?;
            let Some(current) = index.get_mut(id) else {
                return Ok(error);
            };
            let changed = current.error != error;
            current.error = error.clone();
            changed
        };
        if updated {
            self.dump_scripts(&[id]).await?;
            if let Some(error) = &error {
                self.emit(ScriptEvent::Error {
                    id,
                    error: error.clone(),
                    message: MSG_FETCH_FAILED.to_string(),
                });
            }
        }
        Ok(error)
    }
}
