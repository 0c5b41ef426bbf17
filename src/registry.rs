//! Versioned model publication on top of an [`ArtifactStore`].
//!
//! Layout per version:
//!
//! ```text
//! models/v000042/claim.json        reserved by the publishing run
//! models/v000042/model.json        ModelArtifact
//! models/v000042/calibration.json  CalibrationStats
//! models/v000042/manifest.json     written last; the version is visible once it exists
//! ```
//!
//! A version is claimed with `put_if_absent` before anything else is
//! written, so two runs can never interleave their blobs under one version
//! and nothing is ever overwritten.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::model::{ModelArtifact, ModelVersion, ScoreDirection};
use crate::storage::ArtifactStore;
use crate::train::CalibrationStats;

const MODELS_PREFIX: &str = "models/";
const CLAIM: &str = "claim.json";
const MODEL: &str = "model.json";
const CALIBRATION: &str = "calibration.json";
const MANIFEST: &str = "manifest.json";

/// Attempts at claiming a fresh version before giving up.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Summary of a published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: ModelVersion,
    pub run_id: Uuid,
    pub model_kind: String,
    pub features: Vec<String>,
    pub training_rows: usize,
    pub threshold: f64,
    pub direction: ScoreDirection,
    pub trained_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claim {
    run_id: Uuid,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    store: Arc<dyn ArtifactStore>,
}

pub fn key(version: ModelVersion, file: &str) -> String {
    format!("{}{}/{}", MODELS_PREFIX, version, file)
}

fn version_of(key: &str) -> Option<(ModelVersion, &str)> {
    let rest = key.strip_prefix(MODELS_PREFIX)?;
    let (dir, file) = rest.split_once('/')?;
    let version = dir.parse().ok()?;
    Some((version, file))
}

pub(crate) fn to_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| PipelineError::artifact_io(key, e))
}

pub(crate) fn from_json<T: DeserializeOwned>(key: &str, blob: &[u8]) -> Result<T> {
    serde_json::from_slice(blob).map_err(|e| PipelineError::artifact_io(key, e))
}

fn already_published(version: ModelVersion) -> PipelineError {
    PipelineError::artifact_io(
        key(version, CLAIM),
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("model version {} already exists", version),
        ),
    )
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Published versions in ascending order.
    pub fn list_versions(&self) -> Result<Vec<ModelVersion>> {
        let mut versions: Vec<ModelVersion> = self
            .store
            .list_versions(MODELS_PREFIX)?
            .iter()
            .filter_map(|k| version_of(k))
            .filter(|(_, file)| *file == MANIFEST)
            .map(|(v, _)| v)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    pub fn latest(&self) -> Result<ModelVersion> {
        self.list_versions()?
            .last()
            .copied()
            .ok_or(PipelineError::NoPublishedModel)
    }

    /// One past the highest version ever claimed, published or not.
    pub fn next_version(&self) -> Result<ModelVersion> {
        let highest = self
            .store
            .list_versions(MODELS_PREFIX)?
            .iter()
            .filter_map(|k| version_of(k))
            .map(|(v, _)| v)
            .max();
        Ok(highest.map_or(ModelVersion::FIRST, ModelVersion::next))
    }

    pub fn manifest(&self, version: ModelVersion) -> Result<Manifest> {
        let key = key(version, MANIFEST);
        if !self.store.contains(&key)? {
            return Err(PipelineError::VersionNotFound(version));
        }
        from_json(&key, &self.store.get(&key)?)
    }

    pub fn manifests(&self) -> Result<Vec<Manifest>> {
        self.list_versions()?
            .into_iter()
            .map(|v| self.manifest(v))
            .collect()
    }

    /// Publish under the artifact's own version. Fails if that version has
    /// already been claimed.
    pub fn publish(&self, artifact: &ModelArtifact, calibration: &CalibrationStats) -> Result<()> {
        check_binding(artifact, calibration)?;
        if !self.claim(artifact.version, artifact.run_id)? {
            return Err(already_published(artifact.version));
        }
        self.write_claimed(artifact, calibration)
    }

    /// Claim the next free version, restamp the artifact and calibration
    /// with it, and publish. Returns the version used.
    pub fn publish_next(
        &self,
        artifact: &mut ModelArtifact,
        calibration: &mut CalibrationStats,
    ) -> Result<ModelVersion> {
        check_binding(artifact, calibration)?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let version = self.next_version()?;
            if self.claim(version, artifact.run_id)? {
                if artifact.version != version {
                    debug!(from = %artifact.version, to = %version, "restamping artifact version");
                }
                artifact.version = version;
                calibration.model_version = version;
                self.write_claimed(artifact, calibration)?;
                return Ok(version);
            }
            warn!(%version, "version claimed concurrently, retrying");
        }
        Err(PipelineError::artifact_io(
            MODELS_PREFIX,
            io::Error::new(
                io::ErrorKind::WouldBlock,
                "could not claim a model version",
            ),
        ))
    }

    fn claim(&self, version: ModelVersion, run_id: Uuid) -> Result<bool> {
        let key = key(version, CLAIM);
        let blob = to_json(
            &key,
            &Claim {
                run_id,
                claimed_at: Utc::now(),
            },
        )?;
        self.store.put_if_absent(&key, &blob)
    }

    fn write_claimed(&self, artifact: &ModelArtifact, calibration: &CalibrationStats) -> Result<()> {
        let version = artifact.version;

        let model_key = key(version, MODEL);
        self.store.put(&model_key, &to_json(&model_key, artifact)?)?;

        let cal_key = key(version, CALIBRATION);
        self.store.put(&cal_key, &to_json(&cal_key, calibration)?)?;

        let manifest = Manifest {
            version,
            run_id: artifact.run_id,
            model_kind: artifact.model.kind().to_string(),
            features: artifact.schema.names().to_vec(),
            training_rows: artifact.training_rows,
            threshold: calibration.threshold,
            direction: calibration.direction,
            trained_at: artifact.created_at,
            published_at: Utc::now(),
        };
        let manifest_key = key(version, MANIFEST);
        if !self
            .store
            .put_if_absent(&manifest_key, &to_json(&manifest_key, &manifest)?)?
        {
            return Err(already_published(version));
        }

        info!(%version, run_id = %artifact.run_id, "model published");
        Ok(())
    }

    /// Load a published artifact and its calibration.
    pub fn load(&self, version: ModelVersion) -> Result<(ModelArtifact, CalibrationStats)> {
        let manifest = self.manifest(version)?;

        let model_key = key(version, MODEL);
        let artifact: ModelArtifact = from_json(&model_key, &self.store.get(&model_key)?)?;
        let cal_key = key(version, CALIBRATION);
        let calibration: CalibrationStats = from_json(&cal_key, &self.store.get(&cal_key)?)?;

        if artifact.version != version || artifact.run_id != manifest.run_id {
            return Err(PipelineError::artifact_io(
                model_key,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "stored artifact ({} run {}) does not match manifest ({} run {})",
                        artifact.version, artifact.run_id, version, manifest.run_id
                    ),
                ),
            ));
        }
        check_binding(&artifact, &calibration)?;
        debug!(%version, "model loaded");
        Ok((artifact, calibration))
    }
}

fn check_binding(artifact: &ModelArtifact, calibration: &CalibrationStats) -> Result<()> {
    if artifact.version != calibration.model_version {
        return Err(PipelineError::CalibrationMismatch {
            model: artifact.version,
            calibration: calibration.model_version,
        });
    }
    Ok(())
}
