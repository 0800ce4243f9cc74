//! Error taxonomy for the aggregation pipeline.
//!
//! Absent tags are not errors (the accumulator skips them); everything
//! here terminates the stage that raised it.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No tag contributed any timesteps; the quarterly average is undefined")]
    NoContributingTags,

    #[error("Dataset {context} has no `{axis}` dimension")]
    MissingAxis { context: String, axis: String },

    #[error("Malformed dataset {context}: {reason}")]
    Malformed { context: String, reason: String },

    #[error("Array store error at {}: {message}", path.display())]
    Store { path: PathBuf, message: String },

    #[error("Remote object store error for {uri}: {message}")]
    Remote { uri: String, message: String },

    #[error("Wrote {local} but the remote copy {remote} failed: {message}")]
    PartialWrite {
        local: String,
        remote: String,
        message: String,
    },

    #[error("Rotation failed: {0}")]
    Rotation(String),

    #[error("Parquet encoding failed: {0}")]
    Parquet(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a malformed-dataset error.
    pub fn malformed(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an array store error.
    pub fn store(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Store {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a remote object store error.
    pub fn remote(uri: impl Into<String>, message: impl ToString) -> Self {
        Self::Remote {
            uri: uri.into(),
            message: message.to_string(),
        }
    }
}

/// Convenience type for `Result<T, PipelineError>`.
pub type PipelineResult<T> = Result<T, PipelineError>;
