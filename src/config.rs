//! TOML configuration for the pipeline.
//!
//! Layered lookup: an explicit path, then the `DRIFTWATCH_CONFIG`
//! environment variable, then `./driftwatch.toml`, then compiled-in
//! defaults. Every section is optional.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::evaluate::EvaluationConfig;
use crate::features::FeatureConfig;
use crate::score::DriftConfig;
use crate::storage::StoreConfig;
use crate::train::Hyperparameters;

pub const CONFIG_ENV: &str = "DRIFTWATCH_CONFIG";
pub const LOCAL_CONFIG: &str = "driftwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub features: FeatureConfig,
    pub training: Hyperparameters,
    pub store: StoreConfig,
    pub evaluation: EvaluationConfig,
    pub drift: DriftConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the other
    /// sources fall through with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check every section before any work starts. An empty `[features]`
    /// section is allowed for runs that only touch prepared feature tables.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.features.fields.is_empty() {
            self.features.validate()?;
        }
        self.training.validate()?;
        self.evaluation.validate()?;
        if !(self.drift.mean_shift_threshold > 0.0 && self.drift.mean_shift_threshold.is_finite())
        {
            return Err(PipelineError::Config(
                "drift.mean_shift_threshold must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`),
    /// used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
