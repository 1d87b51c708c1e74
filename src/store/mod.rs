//! The script store: system of record for installed scripts.
//!
//! One `ScriptIndex` behind a single lock holds every record. Each mutation
//! takes the lock for a synchronous check-and-commit step, releases it, and
//! only then persists the result, so no index invariant ever depends on a
//! suspended task.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

use crate::backend::KeyValueBackend;
use crate::collaborators::{
    LogNotifier, NoSync, Notification, Notifier, PatternMatcher, ScriptEvent, SyncTrigger,
    UrlMatcher,
};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::fetch::RemoteFetcher;
use crate::meta::{MetaParser, UserscriptParser};
use crate::path_map::{DependencyKeys, is_remote};
use crate::script::{Script, ScriptId, ScriptInfoPatch, ScriptMeta, name_uri};
use crate::storage::{Area, Storage, cache_data_uri};
use crate::vacuum::VacuumSlot;
use crate::values::ValueStore;

pub mod index;
pub mod install;

pub use index::{Rejection, ScriptIndex};
pub use install::{InstallOutcome, ScriptSource};

/// Dependency blobs claimed by installs whose record is not committed yet,
/// with the number of installs holding each
pub(crate) type PendingDeps = HashMap<(Area, String), usize>;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Ways of addressing a script
#[derive(Debug, Clone, Copy)]
pub enum ScriptQuery<'a> {
    Id(ScriptId),
    Uri(&'a str),
    /// The script whose name and namespace match this metadata
    Meta(&'a ScriptMeta),
}

/// A script with its source, for export
#[derive(Debug, Clone, Serialize)]
pub struct ExportItem {
    pub script: Script,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportData {
    pub items: Vec<ExportItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<HashMap<ScriptId, Value>>,
}

pub(crate) struct StoreInner {
    pub(crate) index: Mutex<ScriptIndex>,
    pub(crate) storage: Storage,
    pub(crate) parser: Arc<dyn MetaParser>,
    pub(crate) matcher: Arc<dyn UrlMatcher>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) sync: Arc<dyn SyncTrigger>,
    pub(crate) events: broadcast::Sender<ScriptEvent>,
    pub(crate) vacuum: VacuumSlot,
    /// Keys still missing after an automatic repair; not repaired again
    /// until the next install
    pub(crate) abandoned_keys: Mutex<HashSet<String>>,
    /// Held while blobs are chosen for deletion and deleted
    pub(crate) pending_deps: AsyncMutex<PendingDeps>,
    /// Held while a record is read back from the index and written
    pub(crate) record_writes: AsyncMutex<()>,
    pub(crate) config: Config,
}

/// Handle to the script store. Clones share the same store.
#[derive(Clone)]
pub struct ScriptStore {
    pub(crate) inner: Arc<StoreInner>,
}

/// Assembles a [`ScriptStore`] from its backend and collaborators
pub struct StoreBuilder {
    backend: Arc<dyn KeyValueBackend>,
    fetcher: Arc<dyn RemoteFetcher>,
    parser: Arc<dyn MetaParser>,
    matcher: Arc<dyn UrlMatcher>,
    notifier: Arc<dyn Notifier>,
    sync: Arc<dyn SyncTrigger>,
    config: Config,
}

impl StoreBuilder {
    pub fn new(backend: Arc<dyn KeyValueBackend>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self {
            backend,
            fetcher,
            parser: Arc::new(UserscriptParser),
            matcher: Arc::new(PatternMatcher::new()),
            notifier: Arc::new(LogNotifier),
            sync: Arc::new(NoSync),
            config: Config::default(),
        }
    }

    pub fn parser(mut self, parser: Arc<dyn MetaParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn UrlMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sync(mut self, sync: Arc<dyn SyncTrigger>) -> Self {
        self.sync = sync;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Rebuild the index from storage, clean up, and return the ready store
    pub async fn open(self) -> StoreResult<ScriptStore> {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let store = ScriptStore {
            inner: Arc::new(StoreInner {
                index: Mutex::new(ScriptIndex::new()),
                storage: Storage::new(self.backend, self.fetcher),
                parser: self.parser,
                matcher: self.matcher,
                notifier: self.notifier,
                sync: self.sync,
                events,
                vacuum: VacuumSlot::default(),
                abandoned_keys: Mutex::new(HashSet::new()),
                pending_deps: AsyncMutex::new(PendingDeps::new()),
                record_writes: AsyncMutex::new(()),
                config: self.config,
            }),
        };

        let data = store.inner.storage.backend().get_all().await?;
        store.reconstruct(&data).await?;
        let report = store.vacuum_snapshot(data).await;
        debug!("Startup vacuum applied {} fixes", report.fixes);
        store.sort().await?;
        Ok(store)
    }
}

impl ScriptStore {
    pub fn builder(backend: Arc<dyn KeyValueBackend>, fetcher: Arc<dyn RemoteFetcher>) -> StoreBuilder {
        StoreBuilder::new(backend, fetcher)
    }

    pub(crate) fn index(&self) -> StoreResult<MutexGuard<'_, ScriptIndex>> {
        Ok(self.inner.index.lock()?)
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Receive a change notification for every mutation
    pub fn subscribe(&self) -> broadcast::Receiver<ScriptEvent> {
        self.inner.events.subscribe()
    }

    pub fn values(&self) -> ValueStore {
        ValueStore::new(self.inner.storage.clone())
    }

    /// Accept every well-formed, non-duplicate record of a storage snapshot.
    ///
    /// Records are visited in ascending id order (ties by raw key) so the
    /// record that survives a duplicate does not depend on backend order.
    async fn reconstruct(&self, data: &BTreeMap<String, Value>) -> StoreResult<()> {
        let mut records: Vec<(ScriptId, &str, &Value)> = data
            .iter()
            .filter_map(|(key, value)| {
                let raw = Area::Script.strip(key)?;
                match raw.parse::<ScriptId>() {
                    Ok(id) if id > 0 => Some((id, key.as_str(), value)),
                    _ => {
                        warn!("Discarding script record with invalid key {}", key);
                        None
                    }
                }
            })
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let mut index = ScriptIndex::new();
        for (id, key, value) in records {
            let mut script: Script = match serde_json::from_value(value.clone()) {
                Ok(script) => script,
                Err(e) => {
                    warn!("Discarding unreadable script record {}: {}", key, e);
                    continue;
                }
            };
            script.props.id = id;
            script.props.uri = name_uri(&script.meta, Some(id));
            script.meta.dedup_grants();
            match index.accept(script) {
                Ok(()) => {}
                Err(Rejection::DuplicateId(id)) => {
                    warn!("Discarding {}: id {} is already in use", key, id);
                }
                Err(Rejection::DuplicateUri { uri, owner }) => {
                    warn!(
                        "Discarding {}: namespace {} is already used by #{}",
                        key, uri, owner
                    );
                }
            }
        }

        let in_use: HashSet<String> = index
            .iter()
            .flat_map(|script| {
                DependencyKeys::of(script)
                    .iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        let unused_mods: Vec<&str> = data
            .keys()
            .filter_map(|key| Area::Mod.strip(key))
            .filter(|url| !in_use.contains(*url))
            .collect();
        self.storage().remove_multi(Area::Mod, &unused_mods).await?;

        info!(
            "Loaded {} scripts, dropped {} unused fetch records",
            index.len(),
            unused_mods.len()
        );
        *self.index()? = index;
        Ok(())
    }

    pub fn get(&self, id: ScriptId) -> StoreResult<Option<Script>> {
        Ok(self.index()?.get(id).cloned())
    }

    pub fn find(&self, query: ScriptQuery<'_>) -> StoreResult<Option<Script>> {
        let index = self.index()?;
        let found = match query {
            ScriptQuery::Id(id) => index.get(id),
            ScriptQuery::Uri(uri) => index.find_uri(uri),
            ScriptQuery::Meta(meta) => index.find_uri(&name_uri(meta, None)),
        };
        Ok(found.cloned())
    }

    /// All records in display order
    pub fn list(&self, exclude_removed: bool) -> StoreResult<Vec<Script>> {
        Ok(self
            .index()?
            .iter()
            .filter(|s| !exclude_removed || !s.config.removed)
            .cloned()
            .collect())
    }

    /// Version of a script that is installed and not removed
    pub fn script_version(&self, query: ScriptQuery<'_>) -> StoreResult<Option<String>> {
        Ok(self
            .find(query)?
            .filter(|s| !s.config.removed)
            .and_then(|s| s.meta.version))
    }

    pub async fn script_code(&self, id: ScriptId) -> StoreResult<Option<String>> {
        Ok(self
            .storage()
            .get_one(Area::Code, id)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    fn selection(&self, ids: Option<&[ScriptId]>) -> StoreResult<Vec<Script>> {
        let index = self.index()?;
        Ok(match ids {
            Some(ids) => ids.iter().filter_map(|id| index.get(*id).cloned()).collect(),
            None => index.iter().filter(|s| !s.config.removed).cloned().collect(),
        })
    }

    /// Records with their source code and, optionally, their values
    pub async fn export(&self, ids: Option<&[ScriptId]>, with_values: bool) -> StoreResult<ExportData> {
        let scripts = self.selection(ids)?;
        let ids: Vec<ScriptId> = scripts.iter().map(Script::id).collect();
        let mut code = self.storage().get_multi(Area::Code, &ids).await?;
        let values = if with_values {
            Some(self.values().get_many(&ids).await?)
        } else {
            None
        };
        let items = scripts
            .into_iter()
            .map(|script| {
                let code = code
                    .remove(&script.id().to_string())
                    .and_then(|v| v.as_str().map(str::to_string));
                ExportItem { script, code }
            })
            .collect();
        Ok(ExportData { items, values })
    }

    /// Data URIs of the cached remote icons of the given scripts, keyed by URL
    pub async fn icon_cache(&self, ids: Option<&[ScriptId]>) -> StoreResult<HashMap<String, String>> {
        let urls: Vec<String> = self
            .selection(ids)?
            .iter()
            .filter_map(|s| {
                let icon = s.meta.icon.as_deref().filter(|i| is_remote(Some(i)))?;
                Some(s.resolve(icon).to_string())
            })
            .collect();
        let blobs = self.storage().get_multi(Area::Cache, &urls).await?;
        Ok(blobs
            .into_iter()
            .filter_map(|(url, blob)| Some((url, cache_data_uri(blob.as_str()?)?)))
            .collect())
    }

    /// Write the current index copy of each record. Writes are serialized and
    /// read the index only once they own the backend, so a slow write can
    /// never replace a newer one. Records no longer indexed are skipped.
    pub(crate) async fn dump_scripts(&self, ids: &[ScriptId]) -> StoreResult<()> {
        let _writing = self.inner.record_writes.lock().await;
        let scripts: Vec<Script> = {
            let index = self.index()?;
            ids.iter().filter_map(|id| index.get(*id).cloned()).collect()
        };
        if scripts.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(scripts.len());
        for script in &scripts {
            let value = serde_json::to_value(script).map_err(|e| StoreError::Backend(e.into()))?;
            entries.push((script.id(), value));
        }
        self.storage().dump(Area::Script, entries).await?;
        Ok(())
    }

    pub(crate) fn emit(&self, event: ScriptEvent) {
        // No subscriber is not an error
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn request_sync(&self) {
        let sync = Arc::clone(&self.inner.sync);
        tokio::spawn(async move { sync.notify_sync().await });
    }

    pub(crate) fn raise(&self, notification: Notification) {
        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move { notifier.notify(notification).await });
    }

    /// Shallow-merge into `props`, `config` and `custom`
    pub async fn update_info(&self, id: ScriptId, patch: ScriptInfoPatch) -> StoreResult<Script> {
        let script = {
            let mut index = self.index()?;
            let script = index.get_mut(id).ok_or(StoreError::NotFound(id))?;
            script.apply(&patch);
            if patch.props.last_modified.is_none() {
                script.props.last_modified = now_ms();
            }
            script.clone()
        };
        self.dump_scripts(&[id]).await?;
        self.emit(ScriptEvent::Updated {
            id,
            script: Box::new(script.clone()),
            message: String::new(),
            is_new: false,
        });
        self.request_sync();
        Ok(script)
    }

    /// Soft-delete a script, or bring a soft-deleted one back
    pub async fn mark_removed(&self, id: ScriptId, removed: bool) -> StoreResult<Script> {
        let script = {
            let mut index = self.index()?;
            let script = index.get_mut(id).ok_or(StoreError::NotFound(id))?;
            script.config.removed = removed;
            script.props.last_modified = now_ms();
            script.clone()
        };
        self.dump_scripts(&[id]).await?;
        self.emit(ScriptEvent::Removed { id, removed });
        self.request_sync();
        Ok(script)
    }

    /// Soft-delete a script. Returns false when no such script exists.
    pub async fn remove(&self, id: ScriptId) -> StoreResult<bool> {
        match self.mark_removed(id, true).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a script and its code and values right away
    pub async fn purge(&self, id: ScriptId) -> StoreResult<bool> {
        let Some(removed) = self.index()?.remove(id) else {
            return Ok(false);
        };
        self.delete_blobs(std::slice::from_ref(&removed)).await?;
        self.emit(ScriptEvent::Purged { ids: vec![id] });
        self.request_sync();
        Ok(true)
    }

    /// Delete the keys of purged scripts, including dependencies no
    /// remaining script or pending install needs. Call after the scripts
    /// left the index.
    async fn delete_blobs(&self, purged: &[Script]) -> StoreResult<()> {
        let pending = self.inner.pending_deps.lock().await;
        let _writing = self.inner.record_writes.lock().await;
        let mut in_use: HashSet<String> = self
            .index()?
            .iter()
            .flat_map(|script| {
                DependencyKeys::of(script)
                    .iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        in_use.extend(pending.keys().map(|(_, url)| url.clone()));

        let mut keys = Vec::new();
        for script in purged {
            let id = script.id();
            keys.extend([Area::Script, Area::Code, Area::Value].map(|area| area.key(id)));
            let deps = DependencyKeys::of(script);
            for (area, url) in deps.blobs().filter(|(_, url)| !in_use.contains(*url)) {
                keys.push(area.key(url));
                keys.push(Area::Mod.key(url));
            }
        }
        self.storage().backend().remove_multi(&keys).await?;
        Ok(())
    }

    /// Move a script `offset` slots and renumber; returns how many records
    /// were rewritten.
    pub async fn move_script(&self, id: ScriptId, offset: i64) -> StoreResult<usize> {
        let changed = {
            let mut index = self.index()?;
            if !index.move_by(id, offset) {
                return Err(StoreError::NotFound(id));
            }
            index.normalize_positions()
        };
        self.persist_positions(changed).await
    }

    /// Re-sort by stored position and renumber densely
    pub async fn sort(&self) -> StoreResult<usize> {
        let changed = {
            let mut index = self.index()?;
            index.sort_by_position();
            index.normalize_positions()
        };
        self.persist_positions(changed).await
    }

    async fn persist_positions(&self, changed: Vec<Script>) -> StoreResult<usize> {
        if !changed.is_empty() {
            let ids: Vec<ScriptId> = changed.iter().map(Script::id).collect();
            self.dump_scripts(&ids).await?;
            self.request_sync();
        }
        self.emit(ScriptEvent::Reordered);
        Ok(changed.len())
    }

    /// Purge soft-deleted scripts past the grace period, or all of them when
    /// `force` is set. Returns the number purged.
    pub async fn check_remove(&self, force: bool) -> StoreResult<usize> {
        let grace_ms = i64::try_from(self.config().removal_grace().as_millis()).unwrap_or(i64::MAX);
        let purged = self.index()?.take_expired(now_ms(), grace_ms, force);
        if purged.is_empty() {
            return Ok(0);
        }
        let ids: Vec<ScriptId> = purged.iter().map(Script::id).collect();
        self.delete_blobs(&purged).await?;
        info!("Purged {} removed scripts", ids.len());
        self.emit(ScriptEvent::Purged { ids: ids.clone() });
        self.request_sync();
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fetch::{FetchError, FetchOptions, FetchResponse};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoFetch;

    #[async_trait]
    impl RemoteFetcher for NoFetch {
        async fn fetch(&self, url: &str, _: &FetchOptions) -> Result<FetchResponse, FetchError> {
            Err(FetchError::status(url, 404))
        }
    }

    fn record(name: &str, position: u64) -> Value {
        json!({
            "props": { "position": position },
            "config": { "enabled": 1 },
            "meta": { "name": name, "namespace": "ns", "grant": ["GM_getValue", "GM_getValue"] },
        })
    }

    async fn open(backend: Arc<MemoryBackend>) -> ScriptStore {
        ScriptStore::builder(backend, Arc::new(NoFetch))
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_startup_first_seen_wins() {
        let backend = Arc::new(MemoryBackend::with_entries([
            ("script:2", record("dup", 1)),
            ("script:10", record("dup", 2)),
            ("script:3", record("other", 3)),
            ("code:2", json!("a")),
            ("code:3", json!("b")),
            ("code:10", json!("c")),
        ]));
        let store = open(backend.clone()).await;

        let ids: Vec<ScriptId> = store.list(false).unwrap().iter().map(Script::id).collect();
        assert_eq!(ids, vec![2, 3]);
        // the rejected record is reported, not overwritten
        assert!(backend.contains("script:10").await);
        // its code has no live owner and is vacuumed
        assert!(!backend.contains("code:10").await);

        let script = store.get(2).unwrap().unwrap();
        assert_eq!(script.meta.grant, vec!["GM_getValue".to_string()]);
        assert_eq!(script.props.uri, "ns:dup:");
    }

    #[tokio::test]
    async fn test_startup_seeds_counters_and_sorts() {
        let backend = Arc::new(MemoryBackend::with_entries([
            ("script:4", record("a", 9)),
            ("script:7", record("b", 2)),
            ("script:bogus", record("c", 1)),
        ]));
        let store = open(backend).await;

        let scripts = store.list(false).unwrap();
        assert_eq!(scripts.iter().map(Script::id).collect::<Vec<_>>(), vec![7, 4]);
        assert_eq!(
            scripts.iter().map(|s| s.props.position).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.index().unwrap().last_id(), 7);
    }

    #[tokio::test]
    async fn test_startup_drops_unreferenced_fetch_records() {
        let backend = Arc::new(MemoryBackend::with_entries([
            (
                "script:1",
                json!({ "meta": { "name": "a", "require": ["https://cdn.test/a.js"] } }),
            ),
            ("code:1", json!("code")),
            ("require:https://cdn.test/a.js", json!("lib")),
            ("mod:https://cdn.test/a.js", json!({ "fetchedAt": 1 })),
            ("mod:https://cdn.test/old.js", json!({ "fetchedAt": 1 })),
        ]));
        open(backend.clone()).await;
        assert!(backend.contains("mod:https://cdn.test/a.js").await);
        assert!(!backend.contains("mod:https://cdn.test/old.js").await);
    }

    #[tokio::test]
    async fn test_update_info_unknown_id() {
        let store = open(Arc::new(MemoryBackend::new())).await;
        let err = store
            .update_info(42, ScriptInfoPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
        assert!(!store.remove(42).await.unwrap());
        assert!(!store.purge(42).await.unwrap());
    }
}
