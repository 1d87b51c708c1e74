//! Resolution of dependency references against an install URL.
//!
//! `@require`, `@resource` and `@icon` may be relative to the page the script
//! was installed from. The resolved form is the storage key of the blob; only
//! references whose resolved form differs are recorded in the path map.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::script::{Script, ScriptMeta};
use crate::storage::Area;

/// Sparse override table: literal reference -> resolved absolute URL
pub type PathMap = BTreeMap<String, String>;

lazy_static! {
    static ref LOCAL_URL_RE: Regex =
        Regex::new(r"^(file:|data:|https?://(localhost|127\.0\.0\.1)([:/]|$))").unwrap();
}

/// True for references that live on a remote host and can be fetched
pub fn is_remote(url: Option<&str>) -> bool {
    match url {
        Some(url) => !url.is_empty() && !LOCAL_URL_RE.is_match(url),
        None => false,
    }
}

pub fn is_data_uri(reference: &str) -> bool {
    reference.starts_with("data:")
}

/// Resolve `reference` against `base`; unparsable input is returned unchanged
pub fn full_url(reference: &str, base: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(String::from)
        .unwrap_or_else(|_| reference.to_string())
}

/// Every dependency reference a metadata block declares, icon last
fn references(meta: &ScriptMeta) -> impl Iterator<Item = &str> {
    meta.require
        .iter()
        .chain(meta.resources.values())
        .map(String::as_str)
        .chain(meta.icon.as_deref())
}

/// Build the path map of a metadata block.
///
/// Without a base URL nothing can be resolved and the map is empty.
pub fn build_path_map(meta: &ScriptMeta, base: Option<&str>) -> PathMap {
    let Some(base) = base.filter(|b| !b.is_empty()) else {
        return PathMap::new();
    };
    references(meta)
        .filter(|key| !key.is_empty())
        .filter_map(|key| {
            let resolved = full_url(key, base);
            (resolved != key).then(|| (key.to_string(), resolved))
        })
        .collect()
}

/// Recompute and store the path map of a script, preferring `base` over the
/// script's last install URL.
pub fn refresh_path_map<'a>(script: &'a mut Script, base: Option<&str>) -> &'a PathMap {
    let base = base
        .map(str::to_string)
        .or_else(|| script.custom.last_install_url.clone());
    let map = build_path_map(&script.meta, base.as_deref());
    script.custom.path_map.insert(map)
}

/// An empty map is indistinguishable from one never computed, so garbage
/// collection recomputes both before trusting them.
pub fn needs_refresh(script: &Script) -> bool {
    script.custom.path_map.as_ref().is_none_or(|map| map.is_empty())
}

/// Resolved storage keys a script depends on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyKeys {
    /// `require:` keys
    pub require: Vec<String>,
    /// `cache:` keys: resources, then the icon when it is remote
    pub cache: Vec<String>,
}

impl DependencyKeys {
    pub fn of(script: &Script) -> Self {
        let meta = &script.meta;
        let require = meta
            .require
            .iter()
            .map(|url| script.resolve(url).to_string())
            .collect();
        let mut cache: Vec<String> = meta
            .resources
            .values()
            .map(|url| script.resolve(url).to_string())
            .collect();
        if let Some(icon) = meta.icon.as_deref().filter(|icon| is_remote(Some(icon))) {
            cache.push(script.resolve(icon).to_string());
        }
        Self { require, cache }
    }

    /// All keys, for remembering which fetch metadata is still in use
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.require.iter().chain(self.cache.iter()).map(String::as_str)
    }

    /// Stored remote keys with their family; data URIs are skipped
    pub fn blobs(&self) -> impl Iterator<Item = (Area, &str)> {
        self.require
            .iter()
            .map(|url| (Area::Require, url.as_str()))
            .chain(self.cache.iter().map(|url| (Area::Cache, url.as_str())))
            .filter(|(_, url)| !url.is_empty() && !is_data_uri(url))
    }
}
