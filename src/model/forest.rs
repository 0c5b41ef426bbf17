//! Isolation forest: an ensemble of random partition trees. Anomalies sit
//! on short paths; the score `2^(-E[h(x)] / c(n))` is close to 1 for them
//! and well below 0.5 for dense inliers. Higher is more anomalous.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{AnomalyModel, ScoreDirection};
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub trees: usize,
    /// Rows drawn (without replacement) for each tree.
    pub sample_size: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<()> {
        if self.trees == 0 {
            return Err(PipelineError::Config(
                "isolation_forest.trees must be at least 1".to_string(),
            ));
        }
        if self.sample_size < 2 {
            return Err(PipelineError::Config(
                "isolation_forest.sample_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// One tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(
        table: &FeatureTable,
        rows: Vec<usize>,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.split(table, rows, 0, height_limit, rng);
        tree
    }

    fn split(
        &mut self,
        table: &FeatureTable,
        rows: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= height_limit || rows.len() <= 1 {
            return id;
        }

        let value = |row: usize, feature: usize| table.rows()[row].values()[feature];
        let splittable: Vec<(usize, f64, f64)> = (0..table.schema().len())
            .filter_map(|feature| {
                let (lo, hi) = rows.iter().fold(
                    (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), &r| {
                        let v = value(r, feature);
                        (lo.min(v), hi.max(v))
                    },
                );
                (hi > lo).then_some((feature, lo, hi))
            })
            .collect();
        if splittable.is_empty() {
            return id;
        }

        let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
        // Convex combination stays finite even when `hi - lo` would overflow.
        let u: f64 = rng.gen();
        let threshold = lo * (1.0 - u) + hi * u;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| value(r, feature) < threshold);

        let left = self.split(table, left_rows, depth + 1, height_limit, rng);
        let right = self.split(table, right_rows, depth + 1, height_limit, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, values: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if values[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    /// Effective rows per tree (the normalizer `n` in `c(n)`).
    pub sample_size: usize,
    pub trees: Vec<IsolationTree>,
}

impl AnomalyModel for IsolationForest {
    type Params = ForestParams;

    fn fit(table: &FeatureTable, params: &ForestParams, rng: &mut StdRng) -> Result<Self> {
        let n = table.len();
        if n < 2 {
            return Err(PipelineError::insufficient(format!(
                "isolation forest needs at least 2 rows, have {}",
                n
            )));
        }
        let sample_size = params.sample_size.min(n);
        let height_limit = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..params.trees)
            .map(|_| {
                let rows = rand::seq::index::sample(rng, n, sample_size).into_vec();
                IsolationTree::grow(table, rows, height_limit, rng)
            })
            .collect();

        Ok(Self { sample_size, trees })
    }

    fn score(&self, values: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let mean_path = self
            .trees
            .iter()
            .map(|t| t.path_length(values))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / average_path_length(self.sample_size))
    }

    fn direction(&self) -> ScoreDirection {
        ScoreDirection::HigherIsAnomalous
    }
}

/// Average path length of an unsuccessful BST search over `n` items, `c(n)`.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cluster_with_outlier() -> FeatureTable {
        let mut rows: Vec<Vec<f64>> = (0..64)
            .map(|i| vec![(i % 8) as f64 * 0.1, (i / 8) as f64 * 0.1])
            .collect();
        rows.push(vec![25.0, -25.0]);
        FeatureTable::from_rows(vec!["a".into(), "b".into()], rows).unwrap()
    }

    #[test]
    fn test_c_factor() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.244).abs() < 0.01);
    }

    #[test]
    fn test_isolated_point_scores_highest() {
        let table = cluster_with_outlier();
        let mut rng = StdRng::seed_from_u64(11);
        let forest = IsolationForest::fit(&table, &ForestParams::default(), &mut rng).unwrap();
        let scores = forest.in_sample_scores(&table);
        let outlier = scores[64];
        assert!(scores[..64].iter().all(|s| *s < outlier));
        assert!(outlier > 0.6);
    }

    #[test]
    fn test_same_seed_same_forest() {
        let table = cluster_with_outlier();
        let params = ForestParams {
            trees: 10,
            sample_size: 32,
        };
        let a = IsolationForest::fit(&table, &params, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = IsolationForest::fit(&table, &params, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sample_size, 32);
    }

    #[test]
    fn test_extreme_magnitudes_do_not_overflow_split() {
        let mut rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        rows.push(vec![1e308]);
        rows.push(vec![-1e308]);
        let table = FeatureTable::from_rows(vec!["a".into()], rows).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let forest = IsolationForest::fit(&table, &ForestParams::default(), &mut rng).unwrap();
        let scores = forest.in_sample_scores(&table);
        assert!(scores.iter().all(|s| s.is_finite()));
        assert!(forest.trees.iter().all(|t| t.nodes.iter().all(|n| match n {
            Node::Split { threshold, .. } => threshold.is_finite(),
            Node::Leaf { .. } => true,
        })));
    }
}
