//! Threshold selection from a calibration score distribution.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::{ModelVersion, ScoreDirection};
use crate::score::{Severity, Verdict};

/// Quantile levels recorded in every calibration summary.
pub const QUANTILE_LEVELS: [f64; 7] = [0.01, 0.05, 0.25, 0.5, 0.75, 0.95, 0.99];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Flag the most anomalous `fraction` of calibration scores.
    TopFraction { fraction: f64 },
    /// `mean + k * std` (or `mean - k * std` when lower is anomalous).
    MeanStd { k: f64 },
    Fixed { threshold: f64 },
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::TopFraction { fraction: 0.05 }
    }
}

impl ThresholdPolicy {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ThresholdPolicy::TopFraction { fraction } if !(fraction > 0.0 && fraction < 1.0) => {
                Err(PipelineError::Config(format!(
                    "top_fraction must be in (0, 1), got {}",
                    fraction
                )))
            }
            ThresholdPolicy::MeanStd { k } if !(k >= 0.0 && k.is_finite()) => Err(
                PipelineError::Config(format!("mean_std k must be finite and >= 0, got {}", k)),
            ),
            ThresholdPolicy::Fixed { threshold } if !threshold.is_finite() => Err(
                PipelineError::Config("fixed threshold must be finite".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Where the calibration scores came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    TrainingSet,
    Holdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    pub level: f64,
    pub value: f64,
}

/// Score distribution summary and decision threshold, bound to one model
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub model_version: ModelVersion,
    pub source: CalibrationSource,
    pub sample_count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub quantiles: Vec<Quantile>,
    pub policy: ThresholdPolicy,
    pub direction: ScoreDirection,
    pub threshold: f64,
    /// Share of calibration scores on the anomalous side of the threshold.
    pub flagged_fraction: f64,
}

impl CalibrationStats {
    pub fn calibrate(
        model_version: ModelVersion,
        scores: &[f64],
        direction: ScoreDirection,
        policy: &ThresholdPolicy,
        source: CalibrationSource,
    ) -> Result<Self> {
        let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.len() < 2 {
            return Err(PipelineError::insufficient(format!(
                "calibration needs at least 2 finite scores, have {}",
                sorted.len()
            )));
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let std_dev =
            (sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt();

        let threshold = match (*policy, direction) {
            (ThresholdPolicy::TopFraction { fraction }, ScoreDirection::HigherIsAnomalous) => {
                quantile(&sorted, 1.0 - fraction)
            }
            (ThresholdPolicy::TopFraction { fraction }, ScoreDirection::LowerIsAnomalous) => {
                quantile(&sorted, fraction)
            }
            (ThresholdPolicy::MeanStd { k }, ScoreDirection::HigherIsAnomalous) => mean + k * std_dev,
            (ThresholdPolicy::MeanStd { k }, ScoreDirection::LowerIsAnomalous) => mean - k * std_dev,
            (ThresholdPolicy::Fixed { threshold }, _) => threshold,
        };

        let flagged = sorted
            .iter()
            .filter(|s| direction.crosses(**s, threshold))
            .count();

        Ok(Self {
            model_version,
            source,
            sample_count: count,
            mean,
            std_dev,
            min: sorted[0],
            max: sorted[count - 1],
            quantiles: QUANTILE_LEVELS
                .iter()
                .map(|&level| Quantile {
                    level,
                    value: quantile(&sorted, level),
                })
                .collect(),
            policy: *policy,
            direction,
            threshold,
            flagged_fraction: flagged as f64 / count as f64,
        })
    }

    pub fn is_anomalous(&self, score: f64) -> bool {
        self.direction.crosses(score, self.threshold)
    }

    pub fn verdict(&self, score: f64) -> Verdict {
        if self.is_anomalous(score) {
            Verdict::Anomalous
        } else {
            Verdict::Normal
        }
    }

    /// Signed distance past the threshold (positive = anomalous side).
    pub fn margin(&self, score: f64) -> f64 {
        self.direction.margin(score, self.threshold)
    }

    /// Grade of an anomalous score by its margin in calibration standard
    /// deviations.
    pub fn severity(&self, score: f64) -> Option<Severity> {
        if !self.is_anomalous(score) {
            return None;
        }
        let spread = if self.std_dev > 0.0 { self.std_dev } else { 1.0 };
        let sigmas = self.margin(score) / spread;
        Some(if sigmas >= 3.0 {
            Severity::Critical
        } else if sigmas >= 1.0 {
            Severity::Warning
        } else {
            Severity::Info
        })
    }
}

/// Linearly interpolated quantile of an ascending slice.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> Vec<f64> {
        (1..=100).map(|i| i as f64).collect()
    }

    #[test]
    fn test_quantile_interpolates() {
        let s = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&s, 0.0), 1.0);
        assert_eq!(quantile(&s, 1.0), 4.0);
        assert_eq!(quantile(&s, 0.5), 2.5);
    }

    #[test]
    fn test_top_fraction_higher() {
        let cal = CalibrationStats::calibrate(
            ModelVersion(1),
            &scores(),
            ScoreDirection::HigherIsAnomalous,
            &ThresholdPolicy::TopFraction { fraction: 0.05 },
            CalibrationSource::TrainingSet,
        )
        .unwrap();
        assert!((cal.threshold - 95.05).abs() < 1e-9);
        assert_eq!(cal.flagged_fraction, 0.05);
        assert!(cal.is_anomalous(96.0));
        assert!(!cal.is_anomalous(95.0));
    }

    #[test]
    fn test_top_fraction_lower() {
        let cal = CalibrationStats::calibrate(
            ModelVersion(1),
            &scores(),
            ScoreDirection::LowerIsAnomalous,
            &ThresholdPolicy::TopFraction { fraction: 0.05 },
            CalibrationSource::TrainingSet,
        )
        .unwrap();
        assert_eq!(cal.flagged_fraction, 0.05);
        assert!(cal.is_anomalous(5.0));
        assert!(!cal.is_anomalous(6.0));
    }

    #[test]
    fn test_mean_std_policy() {
        let cal = CalibrationStats::calibrate(
            ModelVersion(3),
            &[1.0, 3.0],
            ScoreDirection::LowerIsAnomalous,
            &ThresholdPolicy::MeanStd { k: 1.0 },
            CalibrationSource::Holdout,
        )
        .unwrap();
        // mean 2, sample std sqrt(2)
        assert!((cal.threshold - (2.0 - 2f64.sqrt())).abs() < 1e-12);
        assert_eq!(cal.source, CalibrationSource::Holdout);
    }

    #[test]
    fn test_verdict_matches_direction() {
        let cal = CalibrationStats::calibrate(
            ModelVersion(1),
            &scores(),
            ScoreDirection::HigherIsAnomalous,
            &ThresholdPolicy::Fixed { threshold: 50.0 },
            CalibrationSource::TrainingSet,
        )
        .unwrap();
        for s in scores() {
            let expected = s > 50.0;
            assert_eq!(cal.verdict(s) == Verdict::Anomalous, expected);
            assert_eq!(cal.severity(s).is_some(), expected);
        }
    }

    #[test]
    fn test_severity_grades() {
        let cal = CalibrationStats::calibrate(
            ModelVersion(1),
            &[0.0, 2.0],
            ScoreDirection::HigherIsAnomalous,
            &ThresholdPolicy::Fixed { threshold: 2.0 },
            CalibrationSource::TrainingSet,
        )
        .unwrap();
        let sd = cal.std_dev;
        assert_eq!(cal.severity(2.0 + 0.5 * sd), Some(Severity::Info));
        assert_eq!(cal.severity(2.0 + 2.0 * sd), Some(Severity::Warning));
        assert_eq!(cal.severity(2.0 + 4.0 * sd), Some(Severity::Critical));
    }

    #[test]
    fn test_needs_two_scores() {
        let err = CalibrationStats::calibrate(
            ModelVersion(1),
            &[1.0, f64::NAN],
            ScoreDirection::HigherIsAnomalous,
            &ThresholdPolicy::default(),
            CalibrationSource::TrainingSet,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { .. }));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ThresholdPolicy::TopFraction { fraction: 0.0 }.validate().is_err());
        assert!(ThresholdPolicy::TopFraction { fraction: 1.5 }.validate().is_err());
        assert!(ThresholdPolicy::MeanStd { k: -1.0 }.validate().is_err());
        assert!(ThresholdPolicy::Fixed { threshold: f64::NAN }.validate().is_err());
        assert!(ThresholdPolicy::default().validate().is_ok());
    }
}
