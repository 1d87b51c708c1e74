//! Script record model
//!
//! A record is split into four parts that are merged independently:
//! `props` (bookkeeping owned by the store), `config` (user flags),
//! `custom` (user overrides of metadata) and `meta` (the parsed metadata block).

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::path_map::PathMap;

/// Process-lifetime unique script identifier
pub type ScriptId = u64;

/// When a script runs relative to document loading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunAt {
    #[serde(rename = "document-start")]
    Start,
    #[serde(rename = "document-body")]
    Body,
    #[default]
    #[serde(rename = "document-end")]
    End,
    #[serde(rename = "document-idle")]
    Idle,
}

impl RunAt {
    /// Parse a declared run-timing such as `document-start`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "document-start" => Some(RunAt::Start),
            "document-body" => Some(RunAt::Body),
            "document-end" => Some(RunAt::End),
            "document-idle" => Some(RunAt::Idle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunAt::Start => "document-start",
            RunAt::Body => "document-body",
            RunAt::End => "document-end",
            RunAt::Idle => "document-idle",
        }
    }

    /// Scripts with eager timing must not wait for deferred resources
    pub fn is_eager(&self) -> bool {
        matches!(self, RunAt::Start | RunAt::Body)
    }
}

/// Injection context requested by a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectInto {
    Auto,
    Page,
    Content,
}

impl InjectInto {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "auto" => Some(InjectInto::Auto),
            "page" => Some(InjectInto::Page),
            "content" => Some(InjectInto::Content),
            _ => None,
        }
    }
}

/// Bookkeeping fields assigned by the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptProps {
    pub id: ScriptId,
    pub uri: String,
    pub position: u64,
    pub uuid: Uuid,
    pub last_modified: i64,
    pub last_updated: i64,
}

/// User flags. Older records store them as `0`/`1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptConfig {
    #[serde(deserialize_with = "flag")]
    pub enabled: bool,
    #[serde(deserialize_with = "flag")]
    pub removed: bool,
    #[serde(deserialize_with = "flag")]
    pub should_update: bool,
    /// `None` inherits the global default
    #[serde(deserialize_with = "optional_flag")]
    pub notify_updates: Option<bool>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            removed: false,
            should_update: true,
            notify_updates: None,
        }
    }
}

/// User overrides of the metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptCustom {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "homepageURL", skip_serializing_if = "Option::is_none")]
    pub homepage_url: Option<String>,
    #[serde(rename = "downloadURL", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(rename = "updateURL", skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
    #[serde(rename = "lastInstallURL", skip_serializing_if = "Option::is_none")]
    pub last_install_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_into: Option<InjectInto>,
    /// `None` falls back to the script's own `@noframes`
    #[serde(deserialize_with = "optional_flag", skip_serializing_if = "Option::is_none")]
    pub noframes: Option<bool>,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_match: Vec<String>,
    pub orig_match: bool,
    pub orig_include: bool,
    pub orig_exclude: bool,
    pub orig_exclude_match: bool,
    /// `None` means not computed yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_map: Option<PathMap>,
}

impl Default for ScriptCustom {
    fn default() -> Self {
        Self {
            name: None,
            homepage_url: None,
            download_url: None,
            update_url: None,
            last_install_url: None,
            run_at: None,
            inject_into: None,
            noframes: None,
            matches: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_match: Vec::new(),
            orig_match: true,
            orig_include: true,
            orig_exclude: true,
            orig_exclude_match: true,
            path_map: None,
        }
    }
}

/// Parsed `==UserScript==` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptMeta {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_match: Vec<String>,
    pub grant: Vec<String>,
    pub require: Vec<String>,
    pub resources: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_into: Option<InjectInto>,
    pub noframes: bool,
    #[serde(rename = "homepageURL", skip_serializing_if = "Option::is_none")]
    pub homepage_url: Option<String>,
    #[serde(rename = "downloadURL", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(rename = "updateURL", skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
    #[serde(rename = "supportURL", skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
}

impl ScriptMeta {
    /// Drop repeated `@grant` entries, keeping the first occurrence
    pub fn dedup_grants(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.grant.retain(|grant| seen.insert(grant.clone()));
    }
}

/// One installed userscript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub props: ScriptProps,
    pub config: ScriptConfig,
    pub custom: ScriptCustom,
    pub meta: ScriptMeta,
    /// Last dependency fetch failure, kept until the next successful install
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Script {
    pub fn id(&self) -> ScriptId {
        self.props.id
    }

    /// Name shown to users in notifications and error messages
    pub fn display_name(&self) -> String {
        if let Some(name) = self.custom.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if !self.meta.name.is_empty() {
            return self.meta.name.clone();
        }
        format!("#{}", self.props.id)
    }

    /// Effective run-timing. A non-empty custom override wins over the
    /// metadata even when it is unrecognised; anything unrecognised means
    /// `document-end`.
    pub fn run_at(&self) -> RunAt {
        self.custom
            .run_at
            .as_deref()
            .filter(|r| !r.is_empty())
            .or(self.meta.run_at.as_deref())
            .and_then(RunAt::parse)
            .unwrap_or_default()
    }

    pub fn noframes(&self) -> bool {
        self.custom.noframes.unwrap_or(self.meta.noframes)
    }

    pub fn inject_into(&self) -> Option<InjectInto> {
        self.custom.inject_into.or(self.meta.inject_into)
    }

    /// Resolved key of a dependency reference, falling back to the literal
    pub fn resolve<'a>(&'a self, reference: &'a str) -> &'a str {
        self.custom
            .path_map
            .as_ref()
            .and_then(|map| map.get(reference))
            .map(String::as_str)
            .unwrap_or(reference)
    }
}

/// Derive the uniqueness key of a script from its name and namespace.
///
/// A script with neither gets its id appended so it never collides.
pub fn name_uri(meta: &ScriptMeta, id: Option<ScriptId>) -> String {
    let mut uri = format!(
        "{}:{}:",
        urlencoding::encode(&meta.namespace),
        urlencoding::encode(&meta.name)
    );
    if meta.namespace.is_empty() && meta.name.is_empty() {
        if let Some(id) = id {
            uri.push_str(&id.to_string());
        }
    }
    uri
}

/// Partial update of `props`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropsPatch {
    pub position: Option<u64>,
    pub uuid: Option<Uuid>,
    pub last_modified: Option<i64>,
    pub last_updated: Option<i64>,
}

/// Partial update of `config`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub removed: Option<bool>,
    pub should_update: Option<bool>,
    #[serde(deserialize_with = "double_option")]
    pub notify_updates: Option<Option<bool>>,
}

/// Partial update of `custom`; an outer `None` leaves the field alone
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomPatch {
    #[serde(deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(rename = "homepageURL", deserialize_with = "double_option")]
    pub homepage_url: Option<Option<String>>,
    #[serde(rename = "downloadURL", deserialize_with = "double_option")]
    pub download_url: Option<Option<String>>,
    #[serde(rename = "updateURL", deserialize_with = "double_option")]
    pub update_url: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub run_at: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub inject_into: Option<Option<InjectInto>>,
    #[serde(deserialize_with = "double_option")]
    pub noframes: Option<Option<bool>>,
    #[serde(rename = "match")]
    pub matches: Option<Vec<String>>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub exclude_match: Option<Vec<String>>,
    pub orig_match: Option<bool>,
    pub orig_include: Option<bool>,
    pub orig_exclude: Option<bool>,
    pub orig_exclude_match: Option<bool>,
}

/// Shallow update of a record's `props`, `config` and `custom`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptInfoPatch {
    pub props: PropsPatch,
    pub config: ConfigPatch,
    pub custom: CustomPatch,
}

impl ScriptProps {
    pub fn apply(&mut self, patch: &PropsPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(uuid) = patch.uuid {
            self.uuid = uuid;
        }
        if let Some(ts) = patch.last_modified {
            self.last_modified = ts;
        }
        if let Some(ts) = patch.last_updated {
            self.last_updated = ts;
        }
    }
}

impl ScriptConfig {
    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(removed) = patch.removed {
            self.removed = removed;
        }
        if let Some(should_update) = patch.should_update {
            self.should_update = should_update;
        }
        if let Some(notify) = patch.notify_updates {
            self.notify_updates = notify;
        }
    }
}

fn replace<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

impl ScriptCustom {
    pub fn apply(&mut self, patch: &CustomPatch) {
        replace(&mut self.name, &patch.name);
        replace(&mut self.homepage_url, &patch.homepage_url);
        replace(&mut self.download_url, &patch.download_url);
        replace(&mut self.update_url, &patch.update_url);
        replace(&mut self.run_at, &patch.run_at);
        replace(&mut self.inject_into, &patch.inject_into);
        replace(&mut self.noframes, &patch.noframes);
        replace(&mut self.matches, &patch.matches);
        replace(&mut self.include, &patch.include);
        replace(&mut self.exclude, &patch.exclude);
        replace(&mut self.exclude_match, &patch.exclude_match);
        replace(&mut self.orig_match, &patch.orig_match);
        replace(&mut self.orig_include, &patch.orig_include);
        replace(&mut self.orig_exclude, &patch.orig_exclude);
        replace(&mut self.orig_exclude_match, &patch.orig_exclude_match);
    }
}

impl Script {
    pub fn apply(&mut self, patch: &ScriptInfoPatch) {
        self.props.apply(&patch.props);
        self.config.apply(&patch.config);
        self.custom.apply(&patch.custom);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Number(i64),
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Bool(b) => b,
            Flag::Number(n) => n != 0,
        }
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<Flag>::deserialize(deserializer)?.is_some_and(bool::from))
}

fn optional_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<Flag>::deserialize(deserializer)?.map(bool::from))
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`)
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
