//! Fiberlock Core - photometry data model and session configuration
//!
//! This crate provides the types shared by the processing crate and the
//! command-line front end. It performs no numeric processing.
//!
//! # Modules
//!
//! - [`types`]: Channel identity, raw and demodulated traces, synced output
//! - [`config`]: Typed TOML session metafile and the validated processing plan
//! - [`error`]: Configuration errors
//!
//! # Example
//!
//! ```rust
//! use fiberlock_core::{SessionConfig, Transform};
//!
//! let config = SessionConfig::from_toml_str(
//!     "[Processing_Parameters]\nsampling_frequency = 6103.515625\n",
//! )
//! .unwrap();
//! let plan = config.validate().unwrap();
//! assert_eq!(plan.transform, Transform::Spectrogram);
//! assert_eq!(plan.no_per_segment, 216);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{ProcessingPlan, SessionConfig, SyncIndices};
pub use error::{ConfigError, ConfigResult};
pub use types::{
    BehaviorColumn, CarrierEstimate, CarrierSource, ChannelConfiguration, ChannelKey, ChannelRole,
    DemodulatedTrace, EmissionColor, Handshake, Hemisphere, RawChannelTrace, SyncedSession,
    SyncedTrace, TraceTable, Transform, DETREND_TRACE, RAW_TRACE, ZSCORE_TRACE,
};
