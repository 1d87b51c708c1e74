//! Key-value persistence backend.
//!
//! The store only needs batched reads, writes and removals plus a full
//! snapshot for startup reconstruction and consistency passes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::JsonFileBackend;
pub use memory::MemoryBackend;

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Backend lock failed: {0}")]
    Lock(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Namespaced key-value storage
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Read the given keys; absent keys are omitted from the result
    async fn get_multi(&self, keys: &[String]) -> BackendResult<HashMap<String, Value>>;

    /// Snapshot of every stored entry, in key order
    async fn get_all(&self) -> BackendResult<BTreeMap<String, Value>>;

    /// Write all entries in one batch
    async fn set_multi(&self, entries: Vec<(String, Value)>) -> BackendResult<()>;

    /// Remove the given keys; unknown keys are ignored
    async fn remove_multi(&self, keys: &[String]) -> BackendResult<()>;
}
