use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{not_found, validate_key, ArtifactStore};
use crate::error::{PipelineError, Result};

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(key: &str) -> PipelineError {
    PipelineError::artifact_io(key, "memory store lock poisoned")
}

impl ArtifactStore for MemoryStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| poisoned(key))?;
        blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, key: &str, blob: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| poisoned(key))?;
        if blobs.contains_key(key) {
            return Ok(false);
        }
        blobs.insert(key.to_string(), blob.to_vec());
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let blobs = self.blobs.read().map_err(|_| poisoned(key))?;
        blobs.get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn contains(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let blobs = self.blobs.read().map_err(|_| poisoned(key))?;
        Ok(blobs.contains_key(key))
    }

    fn list_versions(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| poisoned(prefix))?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract() {
        super::super::contract::exercise(&MemoryStore::new());
    }
}
