//! Diagonal Gaussian density. The score is the log-likelihood of a vector
//! under independent per-feature normals, so lower means more anomalous.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{AnomalyModel, FeatureStats, ScoreDirection};
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianParams {
    /// Floor for per-feature standard deviations.
    pub min_std: f64,
}

impl Default for GaussianParams {
    fn default() -> Self {
        Self { min_std: 1e-6 }
    }
}

impl GaussianParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_std > 0.0 && self.min_std.is_finite()) {
            return Err(PipelineError::Config(
                "gaussian.min_std must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianModel {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// Sum of the per-feature normalizing constants.
    pub log_norm: f64,
}

impl AnomalyModel for GaussianModel {
    type Params = GaussianParams;

    fn fit(table: &FeatureTable, params: &GaussianParams, _rng: &mut StdRng) -> Result<Self> {
        let stats = FeatureStats::from_table(table);
        let means: Vec<f64> = stats.iter().map(|s| s.mean).collect();
        let stds: Vec<f64> = stats.iter().map(|s| s.std_dev.max(params.min_std)).collect();
        let log_norm = stds.iter().map(|s| -s.ln() - 0.5 * LN_2PI).sum();
        Ok(Self {
            means,
            stds,
            log_norm,
        })
    }

    fn score(&self, values: &[f64]) -> f64 {
        let sq: f64 = values
            .iter()
            .zip(self.means.iter().zip(self.stds.iter()))
            .map(|(v, (m, s))| ((v - m) / s).powi(2))
            .sum();
        self.log_norm - 0.5 * sq
    }

    fn direction(&self) -> ScoreDirection {
        ScoreDirection::LowerIsAnomalous
    }
}
