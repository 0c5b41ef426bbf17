//! Model training and threshold calibration.

pub mod calibrate;

pub use calibrate::{CalibrationSource, CalibrationStats, Quantile, ThresholdPolicy};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::features::{FeatureConfig, FeatureTable};
use crate::model::{FeatureStats, ModelArtifact, ModelParams, ModelSpec, ModelVersion};

/// Smallest table any model can be fitted on; dispersion needs two rows.
pub const MIN_TRAINING_ROWS: usize = 2;

/// Everything that determines a training run. Recorded verbatim in the
/// artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub model: ModelSpec,
    pub seed: u64,
    pub threshold: ThresholdPolicy,
    /// Share of rows held out for calibration; 0 calibrates on the
    /// training set itself.
    pub validation_fraction: f64,
    pub min_rows: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            model: ModelSpec::default(),
            seed: 42,
            threshold: ThresholdPolicy::default(),
            validation_fraction: 0.0,
            min_rows: MIN_TRAINING_ROWS,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.threshold.validate()?;
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(PipelineError::Config(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }

    pub fn required_rows(&self) -> usize {
        self.min_rows.max(MIN_TRAINING_ROWS)
    }
}

/// Fit a model on `table` and calibrate its threshold.
///
/// Deterministic for a fixed `hyperparameters.seed`. The returned artifact
/// and calibration are both bound to `version`; nothing is persisted here.
pub fn train(
    table: &FeatureTable,
    hyperparameters: &Hyperparameters,
    version: ModelVersion,
) -> Result<(ModelArtifact, CalibrationStats)> {
    train_with_extractor(table, hyperparameters, version, None)
}

pub(crate) fn train_with_extractor(
    table: &FeatureTable,
    hyperparameters: &Hyperparameters,
    version: ModelVersion,
    extractor: Option<FeatureConfig>,
) -> Result<(ModelArtifact, CalibrationStats)> {
    hyperparameters.validate()?;

    let needed = hyperparameters.required_rows();
    if table.len() < needed {
        return Err(PipelineError::insufficient(format!(
            "need at least {} rows, have {}",
            needed,
            table.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(hyperparameters.seed);

    let (fit_table, holdout) = if hyperparameters.validation_fraction > 0.0 {
        let n = table.len();
        let holdout_rows = (n as f64 * hyperparameters.validation_fraction).round() as usize;
        if holdout_rows < MIN_TRAINING_ROWS || n - holdout_rows < needed {
            return Err(PipelineError::insufficient(format!(
                "{} rows cannot be split into a holdout of {} and at least {} training rows",
                n, holdout_rows, needed
            )));
        }
        let taken = rand::seq::index::sample(&mut rng, n, holdout_rows).into_vec();
        let (fit, held) = table.partition(&taken);
        (fit, Some(held))
    } else {
        (table.clone(), None)
    };

    let feature_stats = FeatureStats::from_table(&fit_table);
    if feature_stats.iter().all(FeatureStats::is_constant) {
        return Err(PipelineError::insufficient(
            "every feature has zero variance in the training rows",
        ));
    }

    info!(
        %version,
        model = hyperparameters.model.kind(),
        rows = fit_table.len(),
        features = table.schema().len(),
        "training model"
    );
    let model = ModelParams::fit(&hyperparameters.model, &fit_table, &mut rng)?;

    let (scores, source) = match &holdout {
        Some(held) => (
            held.rows().iter().map(|r| model.score(r.values())).collect::<Vec<_>>(),
            CalibrationSource::Holdout,
        ),
        None => (
            model.in_sample_scores(&fit_table),
            CalibrationSource::TrainingSet,
        ),
    };
    let calibration = CalibrationStats::calibrate(
        version,
        &scores,
        model.direction(),
        &hyperparameters.threshold,
        source,
    )?;
    debug!(
        %version,
        threshold = calibration.threshold,
        flagged_fraction = calibration.flagged_fraction,
        source = ?calibration.source,
        "calibrated threshold"
    );

    let artifact = ModelArtifact {
        version,
        run_id: Uuid::new_v4(),
        created_at: Utc::now(),
        schema: table.schema().as_ref().clone(),
        hyperparameters: hyperparameters.clone(),
        model,
        feature_stats,
        extractor,
        training_rows: fit_table.len(),
    };

    info!(
        %version,
        run_id = %artifact.run_id,
        threshold = calibration.threshold,
        "training complete"
    );
    Ok((artifact, calibration))
}
