//! Input drift between a scoring batch and the training distribution.
//!
//! Each feature's batch mean is compared to the training baseline in units
//! of training standard deviations. Drift is informational: it is logged and
//! reported alongside scores but never blocks scoring.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::features::FeatureVector;
use crate::model::{FeatureStats, ModelArtifact, ModelVersion};

/// Below this the training std is treated as zero.
const MIN_BASELINE_STD: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub enabled: bool,
    /// Smallest batch worth assessing.
    pub min_batch: usize,
    /// |mean shift| in training std units above which a feature is flagged.
    pub mean_shift_threshold: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_batch: 30,
            mean_shift_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub name: String,
    pub training_mean: f64,
    pub batch_mean: f64,
    /// `(batch_mean - training_mean) / training_std`; 0 for constant
    /// training features that did not move, infinite if they did.
    pub mean_shift: f64,
    /// `batch_std / training_std`, absent when the training std is zero.
    pub std_ratio: Option<f64>,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub model_version: ModelVersion,
    pub batch_size: usize,
    pub features: Vec<FeatureDrift>,
}

impl DriftReport {
    pub fn flagged(&self) -> impl Iterator<Item = &FeatureDrift> {
        self.features.iter().filter(|f| f.flagged)
    }

    pub fn has_drift(&self) -> bool {
        self.features.iter().any(|f| f.flagged)
    }
}

/// Compare a batch against the artifact's training statistics. Returns
/// `None` when drift checks are disabled or the batch is too small. The
/// vectors must already match the artifact schema.
pub fn assess(
    vectors: &[FeatureVector],
    artifact: &ModelArtifact,
    config: &DriftConfig,
) -> Option<DriftReport> {
    if !config.enabled || vectors.is_empty() || vectors.len() < config.min_batch {
        return None;
    }

    let features = artifact
        .feature_stats
        .iter()
        .enumerate()
        .map(|(idx, baseline)| {
            let batch = FeatureStats::from_values(
                &baseline.name,
                vectors.iter().map(|v| v.values()[idx]),
            );
            compare(baseline, &batch, config.mean_shift_threshold)
        })
        .collect();

    let report = DriftReport {
        model_version: artifact.version,
        batch_size: vectors.len(),
        features,
    };
    for f in report.flagged() {
        warn!(
            version = %artifact.version,
            feature = %f.name,
            mean_shift = f.mean_shift,
            "input drift detected"
        );
    }
    Some(report)
}

fn compare(baseline: &FeatureStats, batch: &FeatureStats, threshold: f64) -> FeatureDrift {
    let delta = batch.mean - baseline.mean;
    let (mean_shift, std_ratio) = if baseline.std_dev > MIN_BASELINE_STD {
        (delta / baseline.std_dev, Some(batch.std_dev / baseline.std_dev))
    } else if delta.abs() > MIN_BASELINE_STD {
        (f64::INFINITY.copysign(delta), None)
    } else {
        (0.0, None)
    };
    FeatureDrift {
        name: baseline.name.clone(),
        training_mean: baseline.mean,
        batch_mean: batch.mean,
        mean_shift,
        std_ratio,
        flagged: mean_shift.abs() > threshold,
    }
}
