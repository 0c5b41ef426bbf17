//! Directory-tree store. Each key maps to a file under the root.
//!
//! Writes land in a hidden temp file next to the target first. `put`
//! renames it over the target; `put_if_absent` hard-links it, which fails
//! atomically when the target already exists.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use super::{not_found, validate_key, ArtifactStore};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| PipelineError::artifact_io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, s| p.join(s)))
    }

    /// Write `blob` to a fresh temp file beside `target`.
    fn stage(&self, key: &str, target: &Path, blob: &[u8]) -> Result<PathBuf> {
        let io_err = |e: io::Error| PipelineError::artifact_io(key, e);
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_err)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        let written = file.write_all(blob).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        Ok(tmp)
    }
}

impl ArtifactStore for FsStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        let target = self.path_for(key)?;
        let tmp = self.stage(key, &target, blob)?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(PipelineError::artifact_io(key, e));
        }
        debug!(key, bytes = blob.len(), "artifact written");
        Ok(())
    }

    fn put_if_absent(&self, key: &str, blob: &[u8]) -> Result<bool> {
        let target = self.path_for(key)?;
        let tmp = self.stage(key, &target, blob)?;
        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!(key, bytes = blob.len(), "artifact created");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PipelineError::artifact_io(key, e)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                not_found(key)
            } else {
                PipelineError::artifact_io(key, e)
            }
        })
    }

    fn contains(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipelineError::artifact_io(key, e)),
        }
    }

    fn list_versions(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| PipelineError::artifact_io(prefix, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let segments: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            // Temp files and anything else hidden are not artifacts.
            if segments.iter().any(|s| s.starts_with('.')) {
                continue;
            }
            let key = segments.join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
