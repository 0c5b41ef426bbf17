//! driftwatch -- anomaly detection pipeline for tabular records.
//!
//! Raw records are turned into fixed-schema feature vectors, a model is
//! fitted and calibrated, and the result is published as an immutable,
//! versioned artifact. Scoring always names the model version it used and
//! refuses vectors whose schema differs from the one the model was trained
//! on.

pub mod config;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod score;
pub mod storage;
pub mod train;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use features::{FeatureSchema, FeatureTable, FeatureVector, LabeledFeatureTable, RawRecord};
pub use model::{ModelArtifact, ModelVersion};
pub use pipeline::{Pipeline, ScoreBatch, ScoringData, TrainingData};
pub use score::{ScoreResult, Scorer, Severity, Verdict};
pub use train::{CalibrationStats, Hyperparameters};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Logs go to stderr so stdout stays machine-readable.
pub fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if logging.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}
