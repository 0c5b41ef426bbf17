//! Scoring feature vectors against a published model.

pub mod drift;

pub use drift::{DriftConfig, DriftReport, FeatureDrift};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::features::FeatureVector;
use crate::model::{ModelArtifact, ModelVersion};
use crate::train::CalibrationStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Normal,
    Anomalous,
}

/// Grade of an anomalous verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub row_id: Option<String>,
    pub score: f64,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Signed distance past the threshold; positive is the anomalous side.
    pub margin: f64,
}

impl ScoreResult {
    pub fn is_anomalous(&self) -> bool {
        self.verdict == Verdict::Anomalous
    }
}

/// Score a batch of vectors. Every schema is checked before any score is
/// computed, so a mismatch never yields partial results.
pub fn score(
    vectors: &[FeatureVector],
    artifact: &ModelArtifact,
    calibration: &CalibrationStats,
) -> Result<Vec<ScoreResult>> {
    check_binding(artifact, calibration)?;
    for vector in vectors {
        check_schema(vector, artifact)?;
    }
    let results: Vec<ScoreResult> = vectors
        .iter()
        .map(|v| score_one(v, artifact, calibration))
        .collect();
    debug!(
        version = %artifact.version,
        rows = results.len(),
        anomalous = results.iter().filter(|r| r.is_anomalous()).count(),
        "scored batch"
    );
    Ok(results)
}

fn check_binding(artifact: &ModelArtifact, calibration: &CalibrationStats) -> Result<()> {
    if calibration.model_version != artifact.version {
        return Err(PipelineError::CalibrationMismatch {
            model: artifact.version,
            calibration: calibration.model_version,
        });
    }
    Ok(())
}

fn check_schema(vector: &FeatureVector, artifact: &ModelArtifact) -> Result<()> {
    match artifact.schema.diff(vector.schema()) {
        None => Ok(()),
        Some(detail) => Err(PipelineError::SchemaMismatch {
            version: artifact.version,
            detail,
        }),
    }
}

fn score_one(
    vector: &FeatureVector,
    artifact: &ModelArtifact,
    calibration: &CalibrationStats,
) -> ScoreResult {
    let score = artifact.score(vector.values());
    ScoreResult {
        row_id: vector.row_id().map(str::to_string),
        score,
        verdict: calibration.verdict(score),
        severity: calibration.severity(score),
        margin: calibration.margin(score),
    }
}

/// A loaded model and its calibration, shareable across threads.
#[derive(Debug, Clone)]
pub struct Scorer {
    artifact: Arc<ModelArtifact>,
    calibration: Arc<CalibrationStats>,
}

impl Scorer {
    pub fn new(artifact: ModelArtifact, calibration: CalibrationStats) -> Result<Self> {
        Self::from_shared(Arc::new(artifact), Arc::new(calibration))
    }

    pub fn from_shared(
        artifact: Arc<ModelArtifact>,
        calibration: Arc<CalibrationStats>,
    ) -> Result<Self> {
        check_binding(&artifact, &calibration)?;
        Ok(Self {
            artifact,
            calibration,
        })
    }

    pub fn version(&self) -> ModelVersion {
        self.artifact.version
    }

    pub fn artifact(&self) -> &Arc<ModelArtifact> {
        &self.artifact
    }

    pub fn calibration(&self) -> &Arc<CalibrationStats> {
        &self.calibration
    }

    pub fn score(&self, vectors: &[FeatureVector]) -> Result<Vec<ScoreResult>> {
        score(vectors, &self.artifact, &self.calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureSchema, FeatureTable};
    use crate::train::{train, Hyperparameters};

    fn trained() -> (ModelArtifact, CalibrationStats, FeatureTable) {
        let rows = (0..50)
            .map(|i| vec![(i % 10) as f64, (i % 7) as f64])
            .collect();
        let table = FeatureTable::from_rows(vec!["a".into(), "b".into()], rows).unwrap();
        let (artifact, cal) = train(&table, &Hyperparameters::default(), ModelVersion(1)).unwrap();
        (artifact, cal, table)
    }

    fn vector(names: &[&str], values: Vec<f64>) -> FeatureVector {
        let schema = FeatureSchema::new(names.iter().map(|s| s.to_string()).collect()).unwrap();
        FeatureVector::new(Arc::new(schema), values).unwrap()
    }

    #[test]
    fn test_empty_batch_is_empty() {
        let (artifact, cal, _) = trained();
        assert!(score(&[], &artifact, &cal).unwrap().is_empty());
    }

    #[test]
    fn test_batch_equals_single() {
        let (artifact, cal, table) = trained();
        let v1 = table.rows()[3].clone();
        let v2 = vector(&["a", "b"], vec![40.0, -3.0]);
        let batch = score(&[v1.clone(), v2.clone()], &artifact, &cal).unwrap();
        let one = score(&[v1], &artifact, &cal).unwrap();
        let two = score(&[v2], &artifact, &cal).unwrap();
        assert_eq!(batch, vec![one[0].clone(), two[0].clone()]);
        assert!(batch[1].is_anomalous());
        assert_eq!(batch[1].severity, Some(Severity::Critical));
    }

    #[test]
    fn test_verdict_follows_threshold() {
        let (artifact, cal, table) = trained();
        let results = score(table.rows(), &artifact, &cal).unwrap();
        for r in &results {
            assert_eq!(
                r.is_anomalous(),
                cal.direction.crosses(r.score, cal.threshold)
            );
            assert_eq!(r.severity.is_some(), r.is_anomalous());
        }
    }

    #[test]
    fn test_schema_mismatch_rejects_whole_batch() {
        let (artifact, cal, table) = trained();
        let good = table.rows()[0].clone();
        for bad in [
            vector(&["b", "a"], vec![1.0, 1.0]),
            vector(&["a", "c"], vec![1.0, 1.0]),
            vector(&["a"], vec![1.0]),
        ] {
            let err = score(&[good.clone(), bad], &artifact, &cal).unwrap_err();
            match err {
                PipelineError::SchemaMismatch { version, .. } => {
                    assert_eq!(version, ModelVersion(1))
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_calibration_must_match_version() {
        let (artifact, mut cal, _) = trained();
        cal.model_version = ModelVersion(2);
        assert!(matches!(
            Scorer::new(artifact, cal),
            Err(PipelineError::CalibrationMismatch { .. })
        ));
    }

    #[test]
    fn test_row_ids_carried() {
        let (artifact, cal, _) = trained();
        let v = vector(&["a", "b"], vec![1.0, 1.0]).with_row_id(Some("r-9".into()));
        let scorer = Scorer::new(artifact, cal).unwrap();
        let out = scorer.score(&[v]).unwrap();
        assert_eq!(out[0].row_id.as_deref(), Some("r-9"));
    }

    #[test]
    fn test_scorer_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Scorer>();
    }
}
