//! Artifact storage: versioned blobs addressed by `/`-separated keys.
//!
//! Three backends share the [`ArtifactStore`] contract. Every write is
//! atomic per key: readers see either the previous blob or the new one,
//! never a partial write. `put_if_absent` is the primitive the model
//! registry builds its never-overwrite guarantee on.

pub mod fs;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

pub trait ArtifactStore: Send + Sync + fmt::Debug {
    /// Write or replace the blob at `key`.
    fn put(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Write the blob only if `key` is unused. Returns `false` (and leaves
    /// the stored blob untouched) when it already exists.
    fn put_if_absent(&self, key: &str, blob: &[u8]) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn contains(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, in ascending order.
    fn list_versions(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reject keys that could escape the store root or collide with temp files.
pub fn validate_key(key: &str) -> Result<()> {
    let bad = |reason: &str| {
        Err(PipelineError::artifact_io(
            key,
            io::Error::new(io::ErrorKind::InvalidInput, reason.to_string()),
        ))
    };
    if key.is_empty() {
        return bad("empty key");
    }
    if key.starts_with('/') || key.contains('\\') {
        return bad("keys must be relative and `/`-separated");
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return bad("empty path segment");
        }
        if segment.starts_with('.') {
            return bad("path segments may not start with `.`");
        }
    }
    Ok(())
}

pub(crate) fn not_found(key: &str) -> PipelineError {
    PipelineError::artifact_io(
        key,
        io::Error::new(io::ErrorKind::NotFound, "no artifact at this key"),
    )
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Fs,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory for `fs`, database file for `sqlite`, unused for `memory`.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(p), _) => p.clone(),
            (None, StoreBackend::Sqlite) => PathBuf::from("driftwatch.db"),
            (None, _) => PathBuf::from("driftwatch-store"),
        }
    }
}

/// Open the configured backend.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn ArtifactStore>> {
    let path = config.resolved_path();
    let store: Arc<dyn ArtifactStore> = match config.backend {
        StoreBackend::Fs => Arc::new(FsStore::open(&path)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&path)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    info!(backend = ?config.backend, path = %path.display(), "artifact store opened");
    Ok(store)
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share.

    use super::*;

    pub fn exercise(store: &dyn ArtifactStore) {
        store.put("models/v000002/model.json", b"two").unwrap();
        store.put("models/v000001/model.json", b"one").unwrap();
        store.put("reports/v000001/metrics.json", b"{}").unwrap();

        assert_eq!(store.get("models/v000001/model.json").unwrap(), b"one");
        store.put("models/v000001/model.json", b"uno").unwrap();
        assert_eq!(store.get("models/v000001/model.json").unwrap(), b"uno");

        assert!(store.put_if_absent("models/v000003/manifest.json", b"a").unwrap());
        assert!(!store.put_if_absent("models/v000003/manifest.json", b"b").unwrap());
        assert_eq!(store.get("models/v000003/manifest.json").unwrap(), b"a");

        assert!(store.contains("models/v000002/model.json").unwrap());
        assert!(!store.contains("models/v000009/model.json").unwrap());
        assert!(matches!(
            store.get("models/v000009/model.json"),
            Err(PipelineError::ArtifactIo { .. })
        ));

        assert_eq!(
            store.list_versions("models/").unwrap(),
            vec![
                "models/v000001/model.json",
                "models/v000002/model.json",
                "models/v000003/manifest.json",
            ]
        );
        assert_eq!(store.list_versions("").unwrap().len(), 4);

        for bad in ["", "/abs", "a//b", "../up", "a/./b", "a\\b", "a/.hidden"] {
            assert!(store.put(bad, b"x").is_err(), "accepted {bad:?}");
        }
    }
}
