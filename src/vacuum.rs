//! Consistency engine.
//!
//! A pass reconciles every blob family with the records that reference it:
//! unreferenced blobs are deleted and referenced remote dependencies that
//! are missing get one refetch. Only one pass runs at a time; concurrent
//! callers share the running pass and its report.

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::fetch::FetchOptions;
use crate::path_map::{DependencyKeys, is_data_uri, needs_refresh, refresh_path_map};
use crate::script::ScriptId;
use crate::storage::Area;
use crate::store::ScriptStore;

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VacuumReport {
    /// Orphans deleted plus missing blobs refetched or attempted
    pub fixes: usize,
    /// One message per failed refetch, prefixed with the script's name
    pub errors: Vec<String>,
}

impl VacuumReport {
    fn failed(message: String) -> Self {
        Self {
            fixes: 0,
            errors: vec![message],
        }
    }
}

type SharedReport = Shared<BoxFuture<'static, VacuumReport>>;

/// Holds the pass currently in flight
#[derive(Default)]
pub(crate) struct VacuumSlot {
    running: Mutex<Option<SharedReport>>,
}

impl VacuumSlot {
    fn clear(&self) {
        match self.running.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Stored, with the number of references seen so far
    Stored(usize),
    /// Referenced by this script but not stored
    Missing(ScriptId),
}

/// Reference table of one pass, rebuilt from a snapshot every time
#[derive(Debug, Default)]
struct RefTable {
    keys: BTreeMap<(Area, String), KeyState>,
}

impl RefTable {
    fn from_snapshot(data: &BTreeMap<String, Value>) -> Self {
        let keys = data
            .keys()
            .filter_map(|key| {
                Area::BLOBS.iter().find_map(|area| {
                    area.strip(key)
                        .map(|id| ((*area, id.to_string()), KeyState::Stored(0)))
                })
            })
            .collect();
        Self { keys }
    }

    fn touch(&mut self, area: Area, key: String, owner: ScriptId) {
        self.keys
            .entry((area, key))
            .and_modify(|state| {
                if let KeyState::Stored(refs) = state {
                    *refs += 1;
                }
            })
            .or_insert(KeyState::Missing(owner));
    }

    /// Keep a stored key alive without asking for it when it is missing
    fn hold(&mut self, area: Area, key: &str) {
        if let Some(KeyState::Stored(refs)) = self.keys.get_mut(&(area, key.to_string())) {
            *refs += 1;
        }
    }

    fn orphans(&self) -> impl Iterator<Item = &(Area, String)> {
        self.keys
            .iter()
            .filter(|(_, state)| **state == KeyState::Stored(0))
            .map(|(key, _)| key)
    }

    /// Missing blobs a refetch can restore, with the script that wants them
    fn missing(&self) -> impl Iterator<Item = (&(Area, String), ScriptId)> {
        self.keys.iter().filter_map(|(key, state)| match state {
            KeyState::Missing(owner) if key.0.is_fetchable() => Some((key, *owner)),
            _ => None,
        })
    }
}

impl ScriptStore {
    /// Run a consistency pass, or wait for the one already running
    pub async fn vacuum(&self) -> VacuumReport {
        self.start_vacuum(None).await
    }

    /// Startup pass over the snapshot the index was built from
    pub(crate) async fn vacuum_snapshot(&self, data: BTreeMap<String, Value>) -> VacuumReport {
        self.start_vacuum(Some(data)).await
    }

    /// The pass runs on its own task so it completes even when every
    /// caller stops waiting.
    fn start_vacuum(&self, data: Option<BTreeMap<String, Value>>) -> SharedReport {
        let mut slot = match self.inner.vacuum.running.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(running) = slot.as_ref() {
            debug!("Joining the running vacuum pass");
            return running.clone();
        }

        let store = self.clone();
        let handle = tokio::spawn(async move {
            let report = store.run_vacuum(data).await;
            store.inner.vacuum.clear();
            report
        });
        let shared = async move {
            handle
                .await
                .unwrap_or_else(|e| VacuumReport::failed(format!("Vacuum task failed: {}", e)))
        }
        .boxed()
        .shared();
        *slot = Some(shared.clone());
        shared
    }

    async fn run_vacuum(&self, data: Option<BTreeMap<String, Value>>) -> VacuumReport {
        let data = match data {
            Some(data) => data,
            None => match self.storage().backend().get_all().await {
                Ok(data) => data,
                Err(e) => return VacuumReport::failed(e.to_string()),
            },
        };

        // Installs cannot claim keys until the deletions below are done
        let pending = self.inner.pending_deps.lock().await;
        let mut table = RefTable::from_snapshot(&data);
        for (area, key) in pending.keys() {
            table.hold(*area, key);
        }
        let mut names: HashMap<ScriptId, String> = HashMap::new();
        {
            let mut index = match self.index() {
                Ok(index) => index,
                Err(e) => return VacuumReport::failed(e.to_string()),
            };
            for script in index.iter_mut() {
                if needs_refresh(script) {
                    refresh_path_map(script, None);
                }
                let id = script.id();
                table.touch(Area::Code, id.to_string(), id);
                table.touch(Area::Value, id.to_string(), id);
                let deps = DependencyKeys::of(script);
                for url in deps.require.into_iter().filter(|u| !is_data_uri(u)) {
                    table.touch(Area::Require, url, id);
                }
                for url in deps.cache.into_iter().filter(|u| !is_data_uri(u)) {
                    table.touch(Area::Cache, url, id);
                }
                names.insert(id, script.display_name());
            }
        }

        let mut to_remove: Vec<String> = Vec::new();
        for (area, key) in table.orphans() {
            to_remove.push(area.key(key));
            if area.is_fetchable() {
                to_remove.push(Area::Mod.key(key));
            }
        }
        let orphans = table.orphans().count();
        let missing: Vec<(Area, String, ScriptId)> = table
            .missing()
            .map(|((area, key), owner)| (*area, key.clone(), owner))
            .collect();
        to_remove.extend(missing.iter().map(|(_, key, _)| Area::Mod.key(key)));

        let mut report = VacuumReport {
            fixes: orphans + missing.len(),
            errors: Vec::new(),
        };
        if report.fixes == 0 {
            debug!("Vacuum found nothing to fix");
            return report;
        }

        // Fetch metadata goes first so refetches are unconditional
        if let Err(e) = self.storage().backend().remove_multi(&to_remove).await {
            warn!("Vacuum could not delete {} keys: {}", to_remove.len(), e);
            report.errors.push(e.to_string());
            return report;
        }
        drop(pending);

        let options = FetchOptions {
            timeout_ms: Some(self.config().fetch.timeout_ms),
            ..Default::default()
        };
        let storage = self.storage();
        let results = join_all(
            missing
                .iter()
                .map(|(area, url, _)| storage.fetch_into(*area, url, &options, None)),
        )
        .await;
        for ((_, _, owner), result) in missing.iter().zip(results) {
            if let Err(e) = result {
                let name = names
                    .get(owner)
                    .cloned()
                    .unwrap_or_else(|| format!("#{}", owner));
                let message = format!("{}: {}", name, e);
                warn!("Vacuum refetch failed: {}", message);
                report.errors.push(message);
            }
        }

        info!(
            "Vacuum applied {} fixes ({} orphans, {} refetches), {} errors",
            report.fixes,
            orphans,
            missing.len(),
            report.errors.len()
        );
        report
    }
}
