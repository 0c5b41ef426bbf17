//! Distance-based detector: mean Euclidean distance to the `k` nearest
//! reference rows in standardized feature space. Higher is more anomalous.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{AnomalyModel, FeatureStats, Scaler, ScoreDirection};
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnParams {
    pub k: usize,
    /// Cap on stored reference rows; larger training sets are subsampled.
    pub max_reference_rows: Option<usize>,
    pub min_std: f64,
}

impl Default for KnnParams {
    fn default() -> Self {
        Self {
            k: 5,
            max_reference_rows: Some(2048),
            min_std: 1e-6,
        }
    }
}

impl KnnParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(PipelineError::Config("knn.k must be at least 1".to_string()));
        }
        if matches!(self.max_reference_rows, Some(m) if m <= self.k) {
            return Err(PipelineError::Config(
                "knn.max_reference_rows must exceed k".to_string(),
            ));
        }
        if !(self.min_std > 0.0 && self.min_std.is_finite()) {
            return Err(PipelineError::Config(
                "knn.min_std must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnModel {
    pub k: usize,
    pub scaler: Scaler,
    /// Standardized reference rows.
    pub reference: Vec<Vec<f64>>,
}

impl KnnModel {
    fn distances(&self, z: &[f64]) -> Vec<f64> {
        self.reference
            .iter()
            .map(|r| {
                r.iter()
                    .zip(z.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect()
    }

    fn mean_of_k_smallest(&self, mut distances: Vec<f64>) -> f64 {
        let k = self.k.min(distances.len());
        if k == 0 {
            return 0.0;
        }
        distances.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
        distances[..k].iter().sum::<f64>() / k as f64
    }
}

impl AnomalyModel for KnnModel {
    type Params = KnnParams;

    fn fit(table: &FeatureTable, params: &KnnParams, rng: &mut StdRng) -> Result<Self> {
        let n = table.len();
        if params.k >= n {
            return Err(PipelineError::insufficient(format!(
                "knn needs more than k = {} rows, have {}",
                params.k, n
            )));
        }
        let scaler = Scaler::fit(&FeatureStats::from_table(table), params.min_std);

        let mut picked: Vec<usize> = match params.max_reference_rows {
            Some(cap) if cap < n => rand::seq::index::sample(rng, n, cap).into_vec(),
            _ => (0..n).collect(),
        };
        picked.sort_unstable();

        let reference = picked
            .into_iter()
            .map(|i| scaler.transform(table.rows()[i].values()))
            .collect();

        Ok(Self {
            k: params.k,
            scaler,
            reference,
        })
    }

    fn score(&self, values: &[f64]) -> f64 {
        let z = self.scaler.transform(values);
        self.mean_of_k_smallest(self.distances(&z))
    }

    fn direction(&self) -> ScoreDirection {
        ScoreDirection::HigherIsAnomalous
    }

    /// Leave-one-out: a training row does not count itself as a neighbour.
    fn in_sample_scores(&self, table: &FeatureTable) -> Vec<f64> {
        table
            .rows()
            .iter()
            .map(|row| {
                let z = self.scaler.transform(row.values());
                let mut distances = self.distances(&z);
                if let Some(pos) = distances.iter().position(|d| *d == 0.0) {
                    distances.swap_remove(pos);
                }
                self.mean_of_k_smallest(distances)
            })
            .collect()
    }
}
