//! Error types for the factorkd core library.
//!
//! Uses `thiserror` for a single structured error enum covering configuration,
//! checkpointing, metric bookkeeping, scheduling and the training loop itself.

use std::path::{Path, PathBuf};

use crate::training::orchestrator::Phase;

/// Top-level error type for the factorkd core library.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// Invalid option or option combination; raised before training starts.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint format error in {}: {reason}", .path.display())]
    CheckpointFormat { path: PathBuf, reason: String },

    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// A metric was averaged before any sample was recorded.
    #[error("Metric '{metric}' has no samples to average")]
    DivisionUndefined { metric: String },

    #[error("Invalid top-k request: k={k} with {num_classes} classes")]
    InvalidK { k: usize, num_classes: usize },

    #[error("Epoch {epoch} is outside the schedule range 1..={last}")]
    EpochOutOfRange { epoch: usize, last: usize },

    #[error(
        "Training diverged during {stage} at epoch {epoch}, batch {batch}: {term} = {value}"
    )]
    DivergedTraining {
        stage: String,
        epoch: usize,
        batch: usize,
        term: String,
        value: f64,
    },

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    /// Failure reported by the model collaborator.
    #[error("Model error: {0}")]
    Model(String),

    /// Failure reported by the data source collaborator.
    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn checkpoint_format(path: &Path, reason: impl Into<String>) -> Self {
        Self::CheckpointFormat {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn no_samples(metric: impl Into<String>) -> Self {
        Self::DivisionUndefined {
            metric: metric.into(),
        }
    }

    /// Whether a fresh run may be started in place of a failed resume.
    pub fn is_recoverable_by_fresh_start(&self) -> bool {
        matches!(
            self,
            Self::CheckpointFormat { .. } | Self::CheckpointNotFound(_)
        )
    }
}

/// Convenience alias for results using [`TrainError`].
pub type Result<T> = std::result::Result<T, TrainError>;
