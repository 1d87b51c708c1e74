//! Metadata block parsing.
//!
//! The store only depends on [`MetaParser`]; [`UserscriptParser`] reads the
//! conventional `// ==UserScript==` comment block.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{StoreError, StoreResult};
use crate::script::{InjectInto, ScriptMeta};

/// Turns script source into its metadata record
pub trait MetaParser: Send + Sync {
    fn parse(&self, code: &str) -> StoreResult<ScriptMeta>;
}

lazy_static! {
    static ref BLOCK_RE: Regex = Regex::new(
        r"(?s)(?:^|\n)\s*//\s*==UserScript==\s*\n(.*?)\n\s*//\s*==/UserScript==",
    )
    .unwrap();
    static ref ENTRY_RE: Regex = Regex::new(r"^\s*//\s*@([\w:.-]+)(?:\s+(.*?))?\s*$").unwrap();
}

/// Parser for `==UserScript==` blocks
#[derive(Debug, Clone, Copy, Default)]
pub struct UserscriptParser;

impl MetaParser for UserscriptParser {
    fn parse(&self, code: &str) -> StoreResult<ScriptMeta> {
        let block = BLOCK_RE
            .captures(code)
            .and_then(|c| c.get(1))
            .ok_or_else(|| StoreError::invalid_script("missing ==UserScript== block"))?;

        let mut meta = ScriptMeta::default();
        for line in block.as_str().lines() {
            let Some(entry) = ENTRY_RE.captures(line) else {
                continue;
            };
            let key = &entry[1];
            let value = entry.get(2).map_or("", |m| m.as_str()).to_string();
            apply_entry(&mut meta, key, value);
        }
        Ok(meta)
    }
}

fn set_once(slot: &mut Option<String>, value: String) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value);
    }
}

fn apply_entry(meta: &mut ScriptMeta, key: &str, value: String) {
    match key {
        "name" if meta.name.is_empty() => meta.name = value,
        "namespace" if meta.namespace.is_empty() => meta.namespace = value,
        "version" => set_once(&mut meta.version, value),
        "description" => set_once(&mut meta.description, value),
        "match" => meta.matches.push(value),
        "include" => meta.include.push(value),
        "exclude" => meta.exclude.push(value),
        "exclude-match" => meta.exclude_match.push(value),
        "grant" => meta.grant.push(value),
        "require" => meta.require.push(value),
        "resource" => {
            if let Some((name, url)) = value.split_once(char::is_whitespace) {
                meta.resources
                    .entry(name.to_string())
                    .or_insert_with(|| url.trim().to_string());
            }
        }
        "icon" | "iconURL" | "defaulticon" => set_once(&mut meta.icon, value),
        "run-at" => set_once(&mut meta.run_at, value),
        "inject-into" => {
            if meta.inject_into.is_none() {
                meta.inject_into = InjectInto::parse(&value);
            }
        }
        "noframes" => meta.noframes = true,
        "homepage" | "homepageURL" | "website" | "source" => set_once(&mut meta.homepage_url, value),
        "downloadURL" => set_once(&mut meta.download_url, value),
        "updateURL" => set_once(&mut meta.update_url, value),
        "supportURL" => set_once(&mut meta.support_url, value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "// ==UserScript==
// @name        Demo
// @name:fr     Démo
// @namespace   https://example.test
// @version     1.2
// @match       https://*.example.test/*
// @grant       GM_getValue
// @grant       GM_setValue
// @require     lib/a.js
// @resource    css   style.css
// @icon        icon.png
// @run-at      document-start
// @noframes
// ==/UserScript==
console.log('hi');
";

    #[test]
    fn test_parse_block() {
        let meta = UserscriptParser.parse(SOURCE).unwrap();
        assert_eq!(meta.name, "Demo");
        assert_eq!(meta.namespace, "https://example.test");
        assert_eq!(meta.version.as_deref(), Some("1.2"));
        assert_eq!(meta.matches, vec!["https://*.example.test/*"]);
        assert_eq!(meta.grant.len(), 2);
        assert_eq!(meta.require, vec!["lib/a.js"]);
        assert_eq!(meta.resources["css"], "style.css");
        assert_eq!(meta.icon.as_deref(), Some("icon.png"));
        assert_eq!(meta.run_at.as_deref(), Some("document-start"));
        assert!(meta.noframes);
    }

    #[test]
    fn test_missing_block_is_invalid() {
        let err = UserscriptParser.parse("console.log(1)").unwrap_err();
        assert!(matches!(err, StoreError::InvalidScript(_)));
    }

    #[test]
    fn test_nameless_block_parses() {
        let meta = UserscriptParser
            .parse("// ==UserScript==\n// @version 1\n// ==/UserScript==\n")
            .unwrap();
        assert!(meta.name.is_empty());
    }
}
