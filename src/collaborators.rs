//! Interfaces of the components surrounding the store, with simple defaults.

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::script::{Script, ScriptId};

/// Decides which scripts apply to a page
pub trait UrlMatcher: Send + Sync {
    fn matches(&self, url: &str, script: &Script) -> bool;

    /// Pages on which nothing is injected
    fn is_blacklisted(&self, _url: &str) -> bool {
        false
    }
}

/// User-facing notification raised by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub text: String,
    /// Scripts to open when the notification is clicked
    pub script_ids: Vec<ScriptId>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Asks the remote sync subsystem to reconcile soon
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn notify_sync(&self);
}

/// Change notification emitted after every mutation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScriptEvent {
    Updated {
        id: ScriptId,
        script: Box<Script>,
        message: String,
        is_new: bool,
    },
    /// A dependency could not be fetched during install or update
    Error {
        id: ScriptId,
        error: String,
        message: String,
    },
    Removed {
        id: ScriptId,
        removed: bool,
    },
    Purged {
        ids: Vec<ScriptId>,
    },
    Reordered,
}

/// Notifier writing to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        info!("{}: {}", notification.title, notification.text);
    }
}

/// Sync trigger for deployments without remote sync
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSync;

#[async_trait]
impl SyncTrigger for NoSync {
    async fn notify_sync(&self) {
        debug!("Sync requested, no sync service configured");
    }
}

enum Pattern {
    Glob(GlobMatcher),
    Regex(Regex),
}

impl Pattern {
    fn compile(pattern: &str) -> Option<Self> {
        if pattern == "<all_urls>" || pattern == "*" {
            return Glob::new("*").ok().map(|g| Pattern::Glob(g.compile_matcher()));
        }
        if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            return match Regex::new(&pattern[1..pattern.len() - 1]) {
                Ok(re) => Some(Pattern::Regex(re)),
                Err(e) => {
                    warn!("Ignoring invalid pattern {}: {}", pattern, e);
                    None
                }
            };
        }
        match Glob::new(pattern) {
            Ok(glob) => Some(Pattern::Glob(glob.compile_matcher())),
            Err(e) => {
                warn!("Ignoring invalid pattern {}: {}", pattern, e);
                None
            }
        }
    }

    fn is_match(&self, url: &str) -> bool {
        match self {
            Pattern::Glob(glob) => glob.is_match(url),
            Pattern::Regex(re) => re.is_match(url),
        }
    }
}

fn any_match<'a>(url: &str, patterns: impl IntoIterator<Item = &'a String>) -> bool {
    patterns
        .into_iter()
        .filter_map(|p| Pattern::compile(p))
        .any(|p| p.is_match(url))
}

fn effective<'a>(orig: bool, meta: &'a [String], custom: &'a [String]) -> Vec<&'a String> {
    let meta: &[String] = if orig { meta } else { &[] };
    meta.iter().chain(custom.iter()).collect()
}

/// Glob based matcher over `@match`/`@include`/`@exclude` lists with the
/// user's overrides applied. `/regex/` include patterns are supported.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    blacklist: Vec<String>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blacklist(blacklist: Vec<String>) -> Self {
        Self { blacklist }
    }
}

impl UrlMatcher for PatternMatcher {
    fn matches(&self, url: &str, script: &Script) -> bool {
        let (meta, custom) = (&script.meta, &script.custom);
        let matches = effective(custom.orig_match, &meta.matches, &custom.matches);
        let include = effective(custom.orig_include, &meta.include, &custom.include);
        let exclude_match =
            effective(custom.orig_exclude_match, &meta.exclude_match, &custom.exclude_match);
        let exclude = effective(custom.orig_exclude, &meta.exclude, &custom.exclude);

        let included = any_match(url, matches) || any_match(url, include);
        included && !any_match(url, exclude_match) && !any_match(url, exclude)
    }

    fn is_blacklisted(&self, url: &str) -> bool {
        any_match(url, &self.blacklist)
    }
}
