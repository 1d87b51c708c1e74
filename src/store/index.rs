use indexmap::IndexMap;
use std::collections::HashMap;

use crate::script::{Script, ScriptId};

/// Why a record was refused by the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    DuplicateId(ScriptId),
    DuplicateUri { uri: String, owner: ScriptId },
}

/// Ordered in-memory index of every record held by the store.
///
/// All methods are synchronous: a caller holding the index lock runs a whole
/// check-then-commit sequence without suspending.
#[derive(Debug, Default)]
pub struct ScriptIndex {
    scripts: IndexMap<ScriptId, Script>,
    uris: HashMap<String, ScriptId>,
    last_id: ScriptId,
    last_position: u64,
}

impl ScriptIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn get(&self, id: ScriptId) -> Option<&Script> {
        self.scripts.get(&id)
    }

    pub fn get_mut(&mut self, id: ScriptId) -> Option<&mut Script> {
        self.scripts.get_mut(&id)
    }

    pub fn find_uri(&self, uri: &str) -> Option<&Script> {
        self.uris.get(uri).and_then(|id| self.scripts.get(id))
    }

    /// Records in display order
    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        self.scripts.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Script> {
        self.scripts.values_mut()
    }

    pub fn last_id(&self) -> ScriptId {
        self.last_id
    }

    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    /// Add a record read from storage, refusing duplicates of an accepted one
    pub fn accept(&mut self, script: Script) -> Result<(), Rejection> {
        let id = script.props.id;
        if id == 0 || self.scripts.contains_key(&id) {
            return Err(Rejection::DuplicateId(id));
        }
        if let Some(&owner) = self.uris.get(&script.props.uri) {
            return Err(Rejection::DuplicateUri {
                uri: script.props.uri.clone(),
                owner,
            });
        }
        self.last_id = self.last_id.max(id);
        self.last_position = self.last_position.max(script.props.position);
        self.uris.insert(script.props.uri.clone(), id);
        self.scripts.insert(id, script);
        Ok(())
    }

    pub fn allocate_id(&mut self) -> ScriptId {
        self.last_id += 1;
        self.last_id
    }

    /// Position for a new record: the requested one or the next free slot
    pub fn allocate_position(&mut self, requested: Option<u64>) -> u64 {
        match requested.filter(|p| *p > 0) {
            Some(position) => {
                self.last_position = self.last_position.max(position);
                position
            }
            None => {
                self.last_position += 1;
                self.last_position
            }
        }
    }

    /// Id of a record other than `id` that already owns `uri`
    pub fn uri_owner_other_than(&self, uri: &str, id: ScriptId) -> Option<ScriptId> {
        self.uris.get(uri).copied().filter(|owner| *owner != id)
    }

    /// Insert a new record or replace the record with the same id in place.
    /// The caller has already checked `uri` uniqueness.
    pub fn upsert(&mut self, script: Script) {
        let id = script.props.id;
        if let Some(old) = self.scripts.get(&id) {
            if old.props.uri != script.props.uri {
                self.uris.remove(&old.props.uri);
            }
        }
        self.uris.insert(script.props.uri.clone(), id);
        self.scripts.insert(id, script);
    }

    pub fn remove(&mut self, id: ScriptId) -> Option<Script> {
        let script = self.scripts.shift_remove(&id)?;
        if self.uris.get(&script.props.uri) == Some(&id) {
            self.uris.remove(&script.props.uri);
        }
        Some(script)
    }

    /// Move a record `offset` slots away, clamped to the ends of the list
    pub fn move_by(&mut self, id: ScriptId, offset: i64) -> bool {
        let Some(from) = self.scripts.get_index_of(&id) else {
            return false;
        };
        let last = self.scripts.len() as i64 - 1;
        let to = (from as i64 + offset).clamp(0, last.max(0)) as usize;
        self.scripts.move_index(from, to);
        true
    }

    /// Stable sort by stored position
    pub fn sort_by_position(&mut self) {
        self.scripts
            .sort_by(|_, a, _, b| a.props.position.cmp(&b.props.position));
    }

    /// Renumber positions to `1..=N` in list order and return the records
    /// whose position changed.
    pub fn normalize_positions(&mut self) -> Vec<Script> {
        let mut changed = Vec::new();
        for (index, script) in self.scripts.values_mut().enumerate() {
            let position = index as u64 + 1;
            if script.props.position != position {
                script.props.position = position;
                changed.push(script.clone());
            }
        }
        self.last_position = self.scripts.len() as u64;
        changed
    }

    /// Remove soft-deleted records whose grace period ended before `now_ms`,
    /// or all of them when `force` is set.
    pub fn take_expired(&mut self, now_ms: i64, grace_ms: i64, force: bool) -> Vec<Script> {
        let expired: Vec<ScriptId> = self
            .scripts
            .values()
            .filter(|s| s.config.removed && (force || now_ms - s.props.last_modified > grace_ms))
            .map(|s| s.props.id)
            .collect();
        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
