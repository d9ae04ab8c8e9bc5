//! Error taxonomy for the early-warning pipeline.
//!
//! Failures fall into two groups:
//! - contained: local to one (region, model) pair, logged and skipped
//! - fatal: broken upstream contracts or programming errors, propagated

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DewsError {
    #[error("insufficient data for {model} in {region}: {rows} usable rows, need at least {required}")]
    InsufficientData {
        region: String,
        model: String,
        rows: usize,
        required: usize,
    },

    #[error("model not fitted: {0}")]
    ModelNotFitted(String),

    #[error("feature mismatch: expected {expected:?}, found {found:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("{model} failed to converge: {reason}")]
    ConvergenceFailure { model: String, reason: String },

    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("unsupported artifact version: {found} (max supported: {max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },

    #[error("artifact checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("ensemble for {0} has no fitted models")]
    EmptyEnsemble(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl DewsError {
    /// Whether the failure stays local to one (region, model) pair.
    ///
    /// Contained failures are logged and the pair is skipped; the batch
    /// continues with the remaining regions and models.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::ConvergenceFailure { .. }
        )
    }

    pub(crate) fn insufficient(
        region: &str,
        model: &str,
        rows: usize,
        required: usize,
    ) -> Self {
        Self::InsufficientData {
            region: region.to_string(),
            model: model.to_string(),
            rows,
            required,
        }
    }

    pub(crate) fn convergence(model: &str, reason: impl Into<String>) -> Self {
        Self::ConvergenceFailure {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DewsError>;
