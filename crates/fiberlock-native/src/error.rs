//! Processing error types
//!
//! Error types for filter design, demodulation and stream alignment using
//! `thiserror`.

use std::path::PathBuf;

use fiberlock_core::ConfigError;
use thiserror::Error;

/// Errors raised by the processing pipeline.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Filter design produced a pole on or outside the unit circle, or the
    /// requested band does not fit in the available spectrum
    #[error("Unstable filter: {reason}")]
    UnstableFilter {
        /// What went wrong
        reason: String,
    },

    /// A numeric argument is out of range
    #[error("Invalid parameter {parameter}: {reason}")]
    InvalidParameter {
        /// Parameter name
        parameter: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Not enough samples for the requested operation
    #[error("Insufficient data for {operation}: got {got} samples, need {need}")]
    InsufficientData {
        /// Operation that ran short
        operation: &'static str,
        /// Number of samples received
        got: usize,
        /// Number of samples needed
        need: usize,
    },

    /// Trial durations of the two streams do not line up
    #[error("Alignment failed: {reason}")]
    Alignment {
        /// What went wrong
        reason: String,
    },

    /// A required input file does not exist
    #[error("Required file not found: {path}")]
    MissingFile {
        /// Expected location
        path: PathBuf,
    },

    /// A required channel or column is absent from the input
    #[error("Missing channel {name}")]
    MissingChannel {
        /// Channel index or column name
        name: String,
    },

    /// CSV decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProcessingError {
    /// Create an unstable filter error.
    pub fn unstable(reason: impl Into<String>) -> Self {
        Self::UnstableFilter { reason: reason.into() }
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter,
            reason: reason.into(),
        }
    }

    /// Create an alignment error.
    pub fn alignment(reason: impl Into<String>) -> Self {
        Self::Alignment { reason: reason.into() }
    }
}

/// Result type for processing operations.
pub type ProcessingResult<T> = Result<T, ProcessingError>;
