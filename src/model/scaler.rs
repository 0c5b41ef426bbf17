use serde::{Deserialize, Serialize};

use crate::features::FeatureTable;

/// Distribution summary of one feature over the training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub name: String,
    pub mean: f64,
    /// Sample standard deviation (n - 1).
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl FeatureStats {
    pub fn from_values(name: &str, values: impl Iterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.collect();
        let count = values.len();
        if count == 0 {
            return Self {
                name: name.to_string(),
                mean: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = if count > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self {
            name: name.to_string(),
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
        }
    }

    pub fn from_table(table: &FeatureTable) -> Vec<FeatureStats> {
        table
            .schema()
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| FeatureStats::from_values(name, table.column(i)))
            .collect()
    }

    pub fn is_constant(&self) -> bool {
        self.std_dev == 0.0
    }
}

/// Per-feature standardization with a floor on the divisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Scaler {
    pub fn fit(stats: &[FeatureStats], min_std: f64) -> Self {
        Self {
            means: stats.iter().map(|s| s.mean).collect(),
            stds: stats.iter().map(|s| s.std_dev.max(min_std)).collect(),
        }
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.means.iter().zip(self.stds.iter()))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}
