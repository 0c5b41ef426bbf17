//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

use crate::model::ModelVersion;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The extractor configuration references data that is not there, or
    /// the data cannot be encoded the way the configuration says.
    #[error("schema error on field `{field}`: {reason}")]
    Schema { field: String, reason: String },

    /// A serving-time feature schema diverges from the trained schema.
    #[error("feature schema does not match model {version}: {detail}")]
    SchemaMismatch { version: ModelVersion, detail: String },

    #[error("insufficient training data: {reason}")]
    InsufficientData { reason: String },

    #[error("artifact store failure on `{key}`: {source}")]
    ArtifactIo {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("calibration is bound to model {calibration}, not {model}")]
    CalibrationMismatch {
        model: ModelVersion,
        calibration: ModelVersion,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("model version {0} is not published")]
    VersionNotFound(ModelVersion),

    #[error("no model has been published yet")]
    NoPublishedModel,

    #[error("training run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn insufficient(reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            reason: reason.into(),
        }
    }

    pub fn artifact_io(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::ArtifactIo {
            key: key.into(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
