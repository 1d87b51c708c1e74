//! Local data engine of a userscript manager.
//!
//! [`ScriptStore`] owns the installed scripts and their dependent blobs on
//! top of a [`KeyValueBackend`]. It installs and updates scripts, builds the
//! per-page injection environment, and keeps the stored blobs consistent
//! with the records that reference them.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub mod backend;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inject;
pub mod meta;
pub mod path_map;
pub mod script;
pub mod storage;
pub mod store;
pub mod vacuum;
pub mod values;

pub use backend::{BackendError, JsonFileBackend, KeyValueBackend, MemoryBackend};
pub use collaborators::{Notification, Notifier, ScriptEvent, SyncTrigger, UrlMatcher};
pub use config::{Config, LogConfig};
pub use error::{ErrorCode, StoreError, StoreResult};
pub use fetch::{FetchError, HttpFetcher, RemoteFetcher};
pub use inject::{EnvData, InjectionEnv, ScriptSizes};
pub use meta::{MetaParser, UserscriptParser};
pub use script::{Script, ScriptId, ScriptInfoPatch};
pub use store::{InstallOutcome, ScriptQuery, ScriptSource, ScriptStore, StoreBuilder};
pub use vacuum::VacuumReport;
pub use values::ValueStore;

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(config: &LogConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
    };
    tracing_subscriber::registry().with(layer).with(filter).try_init()
}
