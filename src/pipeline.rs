//! The surface a serving layer or the CLI drives: train, score, build
//! datasets, evaluate, list versions.
//!
//! There is no process-wide "current model". Each call names a version or
//! asks the registry for the latest one at that moment.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::evaluate::{self, render, Metrics, RenderReport};
use crate::features::csv::{read_raw_path, read_table, write_table};
use crate::features::{
    extract, extract_labeled, FeatureConfig, FeatureTable, FeatureVector, LabeledFeatureTable,
    RawRecord,
};
use crate::model::{ModelArtifact, ModelVersion};
use crate::registry::{from_json, to_json, ModelRegistry};
use crate::score::{drift, DriftReport, ScoreResult, Scorer};
use crate::storage::{self, validate_key, ArtifactStore};
use crate::train::{self, CalibrationStats};

pub enum TrainingData {
    Raw(Vec<RawRecord>),
    Features(FeatureTable),
}

pub enum ScoringData {
    Raw(Vec<RawRecord>),
    Features(Vec<FeatureVector>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBatch {
    pub model_version: ModelVersion,
    pub results: Vec<ScoreResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
}

impl ScoreBatch {
    pub fn anomalies(&self) -> impl Iterator<Item = &ScoreResult> {
        self.results.iter().filter(|r| r.is_anomalous())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub rows: usize,
    pub features: Vec<String>,
    pub labeled: bool,
    pub features_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub metrics: Metrics,
    pub report: RenderReport,
}

pub fn dataset_key(name: &str, file: &str) -> String {
    format!("datasets/{}/{}", name, file)
}

pub fn report_prefix(version: ModelVersion) -> String {
    format!("reports/{}", version)
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registry: ModelRegistry,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn ArtifactStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            registry: ModelRegistry::new(store),
        })
    }

    /// Open the store named by the configuration.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = storage::open(&config.store)?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn store(&self) -> &dyn ArtifactStore {
        self.registry.store().as_ref()
    }

    pub fn versions(&self) -> Result<Vec<ModelVersion>> {
        self.registry.list_versions()
    }

    fn resolve(&self, version: Option<ModelVersion>) -> Result<ModelVersion> {
        match version {
            Some(v) => Ok(v),
            None => self.registry.latest(),
        }
    }

    /// Train and publish a model. Returns once the artifact is durably
    /// published; a cancelled run publishes nothing.
    pub fn train(&self, data: TrainingData, cancel: &CancellationToken) -> Result<ModelVersion> {
        let hyperparameters = &self.config.training;
        hyperparameters.validate()?;

        let (table, extractor) = match data {
            TrainingData::Features(table) => (table, None),
            TrainingData::Raw(records) => {
                let frozen = self.config.features.freeze(&records)?;
                let table = extract(&records, &frozen)?;
                (table, Some(frozen))
            }
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let provisional = self.registry.next_version()?;
        let (mut artifact, mut calibration) =
            train::train_with_extractor(&table, hyperparameters, provisional, extractor)?;

        if cancel.is_cancelled() {
            info!(run_id = %artifact.run_id, "training cancelled before publishing");
            return Err(PipelineError::Cancelled);
        }
        let version = self
            .registry
            .publish_next(&mut artifact, &mut calibration)?;
        Ok(version)
    }

    /// Load a published model for repeated scoring.
    pub fn scorer(&self, version: Option<ModelVersion>) -> Result<Scorer> {
        let version = self.resolve(version)?;
        let (artifact, calibration) = self.registry.load(version)?;
        Scorer::new(artifact, calibration)
    }

    /// Score against `version`, or the latest published version.
    pub fn score(&self, data: ScoringData, version: Option<ModelVersion>) -> Result<ScoreBatch> {
        let scorer = self.scorer(version)?;
        self.score_with(&scorer, data)
    }

    /// Score with an already loaded model.
    pub fn score_with(&self, scorer: &Scorer, data: ScoringData) -> Result<ScoreBatch> {
        let vectors = match data {
            ScoringData::Features(vectors) => vectors,
            ScoringData::Raw(records) => {
                let extractor = serving_extractor(scorer.artifact())?;
                extract(&records, extractor)?.into_rows()
            }
        };

        let results = scorer.score(&vectors)?;
        let drift = drift::assess(&vectors, scorer.artifact(), &self.config.drift);
        if let Some(report) = &drift {
            if report.has_drift() {
                warn!(
                    version = %scorer.version(),
                    features = report.flagged().count(),
                    "scoring batch drifted from training distribution"
                );
            }
        }
        Ok(ScoreBatch {
            model_version: scorer.version(),
            results,
            drift,
        })
    }

    /// Extract raw records with the extractor frozen into `version`,
    /// keeping labels when the label column is present.
    pub fn extract_for(
        &self,
        version: Option<ModelVersion>,
        records: &[RawRecord],
    ) -> Result<(ModelVersion, LabeledFeatureTable)> {
        let version = self.resolve(version)?;
        let (artifact, _) = self.registry.load(version)?;
        let extractor = serving_extractor(&artifact)?;
        Ok((version, extract_labeled(records, extractor)?))
    }

    /// Extract a CSV file into a stored feature table.
    pub fn build_dataset(&self, csv_path: &Path, name: &str) -> Result<DatasetSummary> {
        validate_key(name)?;
        if name.contains('/') {
            return Err(PipelineError::Config(format!(
                "dataset name `{}` must be a single path segment",
                name
            )));
        }

        let raw = read_raw_path(csv_path, &self.config.features)?;
        let frozen = self.config.features.freeze(&raw.records)?;
        let labeled = extract_labeled(&raw.records, &frozen)?;

        let features_key = dataset_key(name, "features.csv");
        let mut blob = Vec::new();
        write_table(&labeled.table, &mut blob)?;
        self.store().put(&features_key, &blob)?;

        let extractor_key = dataset_key(name, "extractor.json");
        self.store()
            .put(&extractor_key, &to_json(&extractor_key, &frozen)?)?;

        if let Some(labels) = labeled.labels() {
            let labels_key = dataset_key(name, "labels.json");
            self.store()
                .put(&labels_key, &to_json(&labels_key, &labels)?)?;
        }

        let summary = DatasetSummary {
            name: name.to_string(),
            rows: labeled.table.len(),
            features: labeled.table.schema().names().to_vec(),
            labeled: labeled.labels().is_some(),
            features_key,
        };
        info!(
            dataset = %summary.name,
            rows = summary.rows,
            features = summary.features.len(),
            labeled = summary.labeled,
            "dataset built"
        );
        Ok(summary)
    }

    /// Read a dataset written by [`Pipeline::build_dataset`].
    pub fn load_dataset(&self, name: &str) -> Result<LabeledFeatureTable> {
        let features_key = dataset_key(name, "features.csv");
        let table = read_table(self.store().get(&features_key)?.as_slice())?;

        let labels_key = dataset_key(name, "labels.json");
        let labels: Option<Vec<bool>> = if self.store().contains(&labels_key)? {
            Some(from_json(&labels_key, &self.store().get(&labels_key)?)?)
        } else {
            None
        };
        debug!(dataset = %name, rows = table.len(), "dataset loaded");
        LabeledFeatureTable::new(table, labels)
    }

    /// Compute metrics for `version` (default latest) and write the report
    /// under `reports/<version>/`.
    pub fn evaluate(
        &self,
        version: Option<ModelVersion>,
        data: &LabeledFeatureTable,
    ) -> Result<Evaluation> {
        let version = self.resolve(version)?;
        let (artifact, calibration) = self.registry.load(version)?;
        self.evaluate_loaded(&artifact, &calibration, data)
    }

    fn evaluate_loaded(
        &self,
        artifact: &ModelArtifact,
        calibration: &CalibrationStats,
        data: &LabeledFeatureTable,
    ) -> Result<Evaluation> {
        let metrics = evaluate::evaluate(artifact, calibration, data, &self.config.evaluation)?;
        let report = render(&metrics, self.store(), &report_prefix(artifact.version));
        Ok(Evaluation { metrics, report })
    }
}

/// The frozen extractor configuration raw records must be encoded with to
/// be scored by `artifact`.
pub fn serving_extractor(artifact: &ModelArtifact) -> Result<&FeatureConfig> {
    artifact.extractor.as_ref().ok_or_else(|| {
        PipelineError::Config(format!(
            "model {} was trained on prepared features and has no extractor; score feature vectors instead",
            artifact.version
        ))
    })
}
