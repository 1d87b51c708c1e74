use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Seven days, the retention window of soft-deleted scripts
pub const DEFAULT_REMOVAL_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for the script store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a soft-deleted script is kept before it is purged
    pub removal_grace_secs: u64,
    /// Capacity of the change notification channel
    pub event_capacity: usize,
    /// Backing file used by the command-line front-end
    pub data_file: PathBuf,
    pub fetch: FetchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub max_blob_bytes: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            removal_grace_secs: DEFAULT_REMOVAL_GRACE_SECS,
            event_capacity: 256,
            data_file: PathBuf::from("scriptdb.json"),
            fetch: FetchConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_blob_bytes: 10 * 1024 * 1024,
            user_agent: format!("scriptdb/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Layer defaults, the optional TOML file and `SCRIPTDB_` environment
    /// variables (nested keys separated by `__`).
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("SCRIPTDB_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), figment::Error> {
        if self.event_capacity == 0 {
            return Err(figment::Error::from("event_capacity must be at least 1".to_string()));
        }
        if self.fetch.timeout_ms == 0 {
            return Err(figment::Error::from("fetch.timeout_ms must be at least 1".to_string()));
        }
        if self.fetch.max_blob_bytes == 0 {
            return Err(figment::Error::from(
                "fetch.max_blob_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_secs(self.removal_grace_secs)
    }
}
