//! Offline evaluation of a trained model.
//!
//! With ground-truth labels the metrics are supervised (confusion matrix at
//! the calibrated threshold, ROC and precision/recall curves). Without them
//! only score diagnostics are available, and the result says so explicitly.

pub mod render;
mod svg;

pub use render::{render, RenderFailure, RenderReport};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::features::LabeledFeatureTable;
use crate::model::{ModelArtifact, ModelVersion, ScoreDirection};
use crate::score::score;
use crate::train::CalibrationStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub histogram_bins: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { histogram_bins: 20 }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.histogram_bins == 0 {
            return Err(PipelineError::Config(
                "evaluation.histogram_bins must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Equal-width bins over `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub lower: f64,
    pub upper: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn from_scores(scores: &[f64], bins: usize) -> Self {
        let bins = bins.max(1);
        let finite: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        let (lower, upper) = finite
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
                (lo.min(s), hi.max(s))
            });
        if finite.is_empty() {
            return Self {
                lower: 0.0,
                upper: 0.0,
                counts: vec![0; bins],
            };
        }
        let mut counts = vec![0; bins];
        let width = (upper - lower) / bins as f64;
        for s in finite {
            let idx = if width > 0.0 {
                (((s - lower) / width) as usize).min(bins - 1)
            } else {
                0
            };
            counts[idx] += 1;
        }
        Self {
            lower,
            upper,
            counts,
        }
    }

    pub fn bin_width(&self) -> f64 {
        (self.upper - self.lower) / self.counts.len() as f64
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Where the calibrated threshold falls within the evaluated scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPosition {
    pub threshold: f64,
    pub direction: ScoreDirection,
    /// Percentage of scores at or below the threshold.
    pub percentile: f64,
    pub flagged: usize,
    pub flagged_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDiagnostics {
    pub count: usize,
    pub histogram: Histogram,
    pub threshold: ThresholdPosition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confusion {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl Confusion {
    /// 0 when nothing was flagged.
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// 0 when there are no positives.
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedMetrics {
    pub confusion: Confusion,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// (false positive rate, true positive rate); absent for single-class
    /// labels.
    pub roc: Option<Vec<CurvePoint>>,
    pub auc: Option<f64>,
    /// (recall, precision); absent for single-class labels.
    pub pr: Option<Vec<CurvePoint>>,
    pub average_precision: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metrics {
    Supervised {
        model_version: ModelVersion,
        diagnostics: ScoreDiagnostics,
        supervised: SupervisedMetrics,
    },
    Unsupervised {
        model_version: ModelVersion,
        diagnostics: ScoreDiagnostics,
    },
}

impl Metrics {
    pub fn model_version(&self) -> ModelVersion {
        match self {
            Metrics::Supervised { model_version, .. }
            | Metrics::Unsupervised { model_version, .. } => *model_version,
        }
    }

    pub fn diagnostics(&self) -> &ScoreDiagnostics {
        match self {
            Metrics::Supervised { diagnostics, .. } | Metrics::Unsupervised { diagnostics, .. } => {
                diagnostics
            }
        }
    }

    pub fn supervised(&self) -> Option<&SupervisedMetrics> {
        match self {
            Metrics::Supervised { supervised, .. } => Some(supervised),
            Metrics::Unsupervised { .. } => None,
        }
    }
}

/// Score `data` with the model and summarize how well the calibrated
/// threshold separates it.
pub fn evaluate(
    artifact: &ModelArtifact,
    calibration: &CalibrationStats,
    data: &LabeledFeatureTable,
    config: &EvaluationConfig,
) -> Result<Metrics> {
    config.validate()?;
    let results = score(data.table.rows(), artifact, calibration)?;
    let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    let flagged: Vec<bool> = results.iter().map(|r| r.is_anomalous()).collect();

    let diagnostics = diagnostics(&scores, &flagged, calibration, config.histogram_bins);

    let metrics = match data.labels() {
        Some(labels) => {
            let oriented: Vec<f64> = scores
                .iter()
                .map(|s| calibration.direction.orient(*s))
                .collect();
            Metrics::Supervised {
                model_version: artifact.version,
                diagnostics,
                supervised: supervised(&oriented, &flagged, labels),
            }
        }
        None => Metrics::Unsupervised {
            model_version: artifact.version,
            diagnostics,
        },
    };

    match &metrics {
        Metrics::Supervised { supervised, .. } => info!(
            version = %artifact.version,
            rows = scores.len(),
            precision = supervised.precision,
            recall = supervised.recall,
            auc = ?supervised.auc,
            "evaluated model against labels"
        ),
        Metrics::Unsupervised { diagnostics, .. } => info!(
            version = %artifact.version,
            rows = scores.len(),
            flagged = diagnostics.threshold.flagged,
            "evaluated model without labels"
        ),
    }
    Ok(metrics)
}

fn diagnostics(
    scores: &[f64],
    flagged: &[bool],
    calibration: &CalibrationStats,
    bins: usize,
) -> ScoreDiagnostics {
    let count = scores.len();
    let at_or_below = scores.iter().filter(|s| **s <= calibration.threshold).count();
    let flagged_count = flagged.iter().filter(|f| **f).count();
    ScoreDiagnostics {
        count,
        histogram: Histogram::from_scores(scores, bins),
        threshold: ThresholdPosition {
            threshold: calibration.threshold,
            direction: calibration.direction,
            percentile: 100.0 * ratio(at_or_below, count),
            flagged: flagged_count,
            flagged_fraction: ratio(flagged_count, count),
        },
    }
}

fn supervised(oriented: &[f64], flagged: &[bool], labels: &[bool]) -> SupervisedMetrics {
    let mut confusion = Confusion::default();
    for (&predicted, &actual) in flagged.iter().zip(labels) {
        match (predicted, actual) {
            (true, true) => confusion.true_positives += 1,
            (true, false) => confusion.false_positives += 1,
            (false, false) => confusion.true_negatives += 1,
            (false, true) => confusion.false_negatives += 1,
        }
    }

    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    let (roc, pr) = if positives > 0 && negatives > 0 {
        let (roc, pr) = curves(oriented, labels, positives, negatives);
        (Some(roc), Some(pr))
    } else {
        (None, None)
    };

    SupervisedMetrics {
        precision: confusion.precision(),
        recall: confusion.recall(),
        f1: confusion.f1(),
        confusion,
        auc: roc.as_deref().map(trapezoid),
        average_precision: pr.as_deref().map(average_precision),
        roc,
        pr,
    }
}

/// Sweep the threshold from the most to the least anomalous score. Tied
/// scores move together so the curves do not depend on input order.
fn curves(
    oriented: &[f64],
    labels: &[bool],
    positives: usize,
    negatives: usize,
) -> (Vec<CurvePoint>, Vec<CurvePoint>) {
    let mut order: Vec<usize> = (0..oriented.len()).collect();
    order.sort_by(|&a, &b| oriented[b].total_cmp(&oriented[a]));

    let mut roc = vec![CurvePoint { x: 0.0, y: 0.0 }];
    let mut pr = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut i = 0;
    while i < order.len() {
        let current = oriented[order[i]];
        while i < order.len() && oriented[order[i]].total_cmp(&current).is_eq() {
            if labels[order[i]] {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        roc.push(CurvePoint {
            x: ratio(fp, negatives),
            y: ratio(tp, positives),
        });
        pr.push(CurvePoint {
            x: ratio(tp, positives),
            y: ratio(tp, tp + fp),
        });
    }
    (roc, pr)
}

fn trapezoid(points: &[CurvePoint]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].x - w[0].x) * (w[1].y + w[0].y) / 2.0)
        .sum()
}

/// Step-wise area: sum of precision weighted by each recall increment.
fn average_precision(points: &[CurvePoint]) -> f64 {
    let mut previous_recall = 0.0;
    let mut ap = 0.0;
    for p in points {
        ap += (p.x - previous_recall) * p.y;
        previous_recall = p.x;
    }
    ap
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureTable;
    use crate::model::{KnnParams, ModelSpec};
    use crate::train::{train, Hyperparameters};

    fn setup() -> (ModelArtifact, CalibrationStats) {
        let rows = (0..60).map(|i| vec![(i % 12) as f64 * 0.5]).collect();
        let table = FeatureTable::from_rows(vec!["x".into()], rows).unwrap();
        let hp = Hyperparameters {
            model: ModelSpec::Knn(KnnParams {
                k: 3,
                ..KnnParams::default()
            }),
            ..Hyperparameters::default()
        };
        train(&table, &hp, ModelVersion(4)).unwrap()
    }

    fn labeled(values: &[f64], labels: Option<Vec<bool>>) -> LabeledFeatureTable {
        let table =
            FeatureTable::from_rows(vec!["x".into()], values.iter().map(|v| vec![*v]).collect())
                .unwrap();
        LabeledFeatureTable::new(table, labels).unwrap()
    }

    #[test]
    fn test_confusion_ratios() {
        let c = Confusion {
            true_positives: 3,
            false_positives: 1,
            true_negatives: 10,
            false_negatives: 3,
        };
        assert_eq!(c.precision(), 0.75);
        assert_eq!(c.recall(), 0.5);
        assert!((c.f1() - 0.6).abs() < 1e-12);
        assert_eq!(Confusion::default().precision(), 0.0);
    }

    #[test]
    fn test_perfect_separation() {
        let (artifact, cal) = setup();
        let data = labeled(
            &[1.0, 2.0, 3.0, 2.5, 50.0, 80.0],
            Some(vec![false, false, false, false, true, true]),
        );
        let metrics = evaluate(&artifact, &cal, &data, &EvaluationConfig::default()).unwrap();
        let sup = metrics.supervised().unwrap();
        assert_eq!(sup.auc, Some(1.0));
        assert_eq!(sup.average_precision, Some(1.0));
        assert_eq!(sup.confusion.true_positives, 2);
        assert_eq!(sup.confusion.false_negatives, 0);
        let roc = sup.roc.as_ref().unwrap();
        assert_eq!(roc.first(), Some(&CurvePoint { x: 0.0, y: 0.0 }));
        assert_eq!(roc.last(), Some(&CurvePoint { x: 1.0, y: 1.0 }));
        assert_eq!(metrics.model_version(), ModelVersion(4));
    }

    #[test]
    fn test_single_class_has_no_curves() {
        let (artifact, cal) = setup();
        let data = labeled(&[1.0, 2.0, 3.0], Some(vec![false, false, false]));
        let metrics = evaluate(&artifact, &cal, &data, &EvaluationConfig::default()).unwrap();
        let sup = metrics.supervised().unwrap();
        assert!(sup.roc.is_none());
        assert!(sup.auc.is_none());
        assert!(sup.average_precision.is_none());
    }

    #[test]
    fn test_unlabeled_is_explicit() {
        let (artifact, cal) = setup();
        let data = labeled(&[1.0, 2.0, 3.0, 90.0], None);
        let metrics = evaluate(&artifact, &cal, &data, &EvaluationConfig { histogram_bins: 4 })
            .unwrap();
        assert!(matches!(metrics, Metrics::Unsupervised { .. }));
        let diag = metrics.diagnostics();
        assert_eq!(diag.count, 4);
        assert_eq!(diag.histogram.counts.len(), 4);
        assert_eq!(diag.histogram.total(), 4);
        assert!(diag.threshold.flagged >= 1);
    }

    #[test]
    fn test_tied_scores_share_a_point() {
        let labels = [true, false, true, false];
        let (roc, pr) = curves(&[1.0, 1.0, 0.5, 0.0], &labels, 2, 2);
        assert_eq!(roc.len(), 4);
        assert_eq!(roc[1], CurvePoint { x: 0.5, y: 0.5 });
        assert_eq!(pr.len(), 3);
        assert!((trapezoid(&roc) - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_histogram_constant_scores() {
        let h = Histogram::from_scores(&[2.0, 2.0, 2.0], 5);
        assert_eq!(h.counts, vec![3, 0, 0, 0, 0]);
        let empty = Histogram::from_scores(&[], 3);
        assert_eq!(empty.total(), 0);
    }
}
