//! Configuration error types
//!
//! Errors raised while loading and validating a session configuration.
//! Numeric processing errors live in `fiberlock-native`.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading or validating a session configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {path}: {reason}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O failure
        reason: String,
    },

    /// The configuration file is not valid TOML or has mistyped fields
    #[error("Failed to parse config file {path}: {reason}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The raw sampling frequency is the one parameter without a default
    #[error("Processing_Parameters.sampling_frequency is required but missing")]
    MissingSamplingFrequency,

    /// A parameter is present but unusable
    #[error("Invalid parameter {parameter}: {reason}")]
    InvalidParameter {
        /// Parameter name as written in the TOML document
        parameter: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Two channel entries point at the same raw photometry channel
    #[error("Raw channel {index} is assigned to both {first} and {second}")]
    DuplicateChannel {
        /// Zero-based raw channel index
        index: usize,
        /// First channel using the index
        first: String,
        /// Second channel using the index
        second: String,
    },
}

impl ConfigError {
    /// Create an invalid parameter error.
    pub fn invalid_parameter(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter,
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
