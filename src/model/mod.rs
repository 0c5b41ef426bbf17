//! Anomaly models and the immutable artifact that carries a fitted one.
//!
//! Every model family implements [`AnomalyModel`]: fit on a feature table,
//! score one vector, declare which direction of the score is anomalous.
//! [`ModelParams`] is the serializable union stored inside a
//! [`ModelArtifact`]; the concrete family is selected by [`ModelSpec`].

pub mod forest;
pub mod gaussian;
pub mod knn;
pub mod scaler;

pub use forest::{ForestParams, IsolationForest};
pub use gaussian::{GaussianModel, GaussianParams};
pub use knn::{KnnModel, KnnParams};
pub use scaler::{FeatureStats, Scaler};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::features::{FeatureConfig, FeatureSchema, FeatureTable};
use crate::train::Hyperparameters;

/// Monotonically increasing model version. Displayed as `v000042`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ModelVersion(pub u64);

impl ModelVersion {
    pub const FIRST: ModelVersion = ModelVersion(1);

    pub fn next(self) -> Self {
        ModelVersion(self.0 + 1)
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:06}", self.0)
    }
}

impl FromStr for ModelVersion {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(ModelVersion)
            .map_err(|_| PipelineError::Config(format!("`{}` is not a model version", s)))
    }
}

/// Which side of the threshold is anomalous. Stored with the calibration
/// because model families disagree on sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    HigherIsAnomalous,
    LowerIsAnomalous,
}

impl ScoreDirection {
    /// Strictly beyond the threshold in the anomalous direction.
    pub fn crosses(self, score: f64, threshold: f64) -> bool {
        match self {
            ScoreDirection::HigherIsAnomalous => score > threshold,
            ScoreDirection::LowerIsAnomalous => score < threshold,
        }
    }

    /// Signed distance past the threshold; positive means anomalous side.
    pub fn margin(self, score: f64, threshold: f64) -> f64 {
        match self {
            ScoreDirection::HigherIsAnomalous => score - threshold,
            ScoreDirection::LowerIsAnomalous => threshold - score,
        }
    }

    /// Map a score so that larger always means more anomalous.
    pub fn orient(self, score: f64) -> f64 {
        match self {
            ScoreDirection::HigherIsAnomalous => score,
            ScoreDirection::LowerIsAnomalous => -score,
        }
    }
}

/// Capability shared by every model family.
pub trait AnomalyModel: Sized {
    type Params;

    fn fit(table: &FeatureTable, params: &Self::Params, rng: &mut StdRng) -> Result<Self>;

    fn score(&self, values: &[f64]) -> f64;

    fn direction(&self) -> ScoreDirection;

    /// Scores for the rows the model was fitted on. Families whose score
    /// depends on the training rows themselves override this.
    fn in_sample_scores(&self, table: &FeatureTable) -> Vec<f64> {
        table.rows().iter().map(|r| self.score(r.values())).collect()
    }
}

/// Model family selection plus its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Gaussian(GaussianParams),
    Knn(KnnParams),
    IsolationForest(ForestParams),
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec::Gaussian(GaussianParams::default())
    }
}

impl ModelSpec {
    pub fn validate(&self) -> Result<()> {
        match self {
            ModelSpec::Gaussian(p) => p.validate(),
            ModelSpec::Knn(p) => p.validate(),
            ModelSpec::IsolationForest(p) => p.validate(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelSpec::Gaussian(_) => "gaussian",
            ModelSpec::Knn(_) => "knn",
            ModelSpec::IsolationForest(_) => "isolation_forest",
        }
    }
}

/// Fitted parameters of whichever family was trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    Gaussian(GaussianModel),
    Knn(KnnModel),
    IsolationForest(IsolationForest),
}

impl ModelParams {
    pub fn fit(spec: &ModelSpec, table: &FeatureTable, rng: &mut StdRng) -> Result<Self> {
        Ok(match spec {
            ModelSpec::Gaussian(p) => ModelParams::Gaussian(GaussianModel::fit(table, p, rng)?),
            ModelSpec::Knn(p) => ModelParams::Knn(KnnModel::fit(table, p, rng)?),
            ModelSpec::IsolationForest(p) => {
                ModelParams::IsolationForest(IsolationForest::fit(table, p, rng)?)
            }
        })
    }

    pub fn score(&self, values: &[f64]) -> f64 {
        match self {
            ModelParams::Gaussian(m) => m.score(values),
            ModelParams::Knn(m) => m.score(values),
            ModelParams::IsolationForest(m) => m.score(values),
        }
    }

    pub fn direction(&self) -> ScoreDirection {
        match self {
            ModelParams::Gaussian(m) => m.direction(),
            ModelParams::Knn(m) => m.direction(),
            ModelParams::IsolationForest(m) => m.direction(),
        }
    }

    pub fn in_sample_scores(&self, table: &FeatureTable) -> Vec<f64> {
        match self {
            ModelParams::Gaussian(m) => m.in_sample_scores(table),
            ModelParams::Knn(m) => m.in_sample_scores(table),
            ModelParams::IsolationForest(m) => m.in_sample_scores(table),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelParams::Gaussian(_) => "gaussian",
            ModelParams::Knn(_) => "knn",
            ModelParams::IsolationForest(_) => "isolation_forest",
        }
    }
}

/// Immutable, versioned result of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: ModelVersion,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Exact schema the model was trained against.
    pub schema: FeatureSchema,
    pub hyperparameters: Hyperparameters,
    pub model: ModelParams,
    /// Per-feature training distribution, the baseline for drift checks.
    pub feature_stats: Vec<FeatureStats>,
    /// Frozen extractor configuration when trained from raw records.
    pub extractor: Option<FeatureConfig>,
    pub training_rows: usize,
}

impl ModelArtifact {
    pub fn score(&self, values: &[f64]) -> f64 {
        self.model.score(values)
    }

    pub fn direction(&self) -> ScoreDirection {
        self.model.direction()
    }
}
