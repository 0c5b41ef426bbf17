//! Persist evaluation figures and metrics to an artifact store.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{svg, Metrics};
use crate::error::PipelineError;
use crate::registry::to_json;
use crate::storage::ArtifactStore;

/// A report file that could not be written. Collected rather than raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderReport {
    pub written: Vec<String>,
    pub failures: Vec<RenderFailure>,
}

impl RenderReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, key: String, outcome: Result<(), PipelineError>) {
        match outcome {
            Ok(()) => self.written.push(key),
            Err(e) => {
                warn!(%key, error = %e, "failed to write report file");
                self.failures.push(RenderFailure {
                    key,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Write `metrics.json` and SVG figures under `prefix`. Individual write
/// failures never abort rendering; they are returned in the report.
pub fn render(metrics: &Metrics, store: &dyn ArtifactStore, prefix: &str) -> RenderReport {
    let prefix = prefix.trim_end_matches('/');
    let mut report = RenderReport::default();
    let version = metrics.model_version();

    let mut files: Vec<(String, Result<Vec<u8>, PipelineError>)> = Vec::new();

    let metrics_key = format!("{}/metrics.json", prefix);
    let metrics_blob = to_json(&metrics_key, metrics);
    files.push((metrics_key, metrics_blob));

    let diagnostics = metrics.diagnostics();
    files.push((
        format!("{}/score_histogram.svg", prefix),
        Ok(svg::histogram(
            &diagnostics.histogram,
            diagnostics.threshold.threshold,
            &format!("Score distribution, model {}", version),
        )
        .into_bytes()),
    ));

    if let Some(supervised) = metrics.supervised() {
        if let Some(roc) = &supervised.roc {
            let title = match supervised.auc {
                Some(auc) => format!("ROC, model {} (AUC {:.3})", version, auc),
                None => format!("ROC, model {}", version),
            };
            files.push((
                format!("{}/roc.svg", prefix),
                Ok(svg::curve(roc, &title, "false positive rate", "true positive rate", true)
                    .into_bytes()),
            ));
        }
        if let Some(pr) = &supervised.pr {
            let title = match supervised.average_precision {
                Some(ap) => format!("Precision/recall, model {} (AP {:.3})", version, ap),
                None => format!("Precision/recall, model {}", version),
            };
            files.push((
                format!("{}/precision_recall.svg", prefix),
                Ok(svg::curve(pr, &title, "recall", "precision", false).into_bytes()),
            ));
        }
    }

    for (key, blob) in files {
        let outcome = blob.and_then(|b| store.put(&key, &b));
        report.record(key, outcome);
    }

    info!(
        %version,
        written = report.written.len(),
        failed = report.failures.len(),
        "evaluation report rendered"
    );
    report
}
