//! Fiberlock Native - carrier demodulation and behavior alignment
//!
//! This crate provides host-side processing for fiber photometry sessions:
//! - Stability-checked filter design and zero-phase filtering
//! - Carrier estimation and spectrogram or lock-in demodulation
//! - Rolling normalization
//! - Trial alignment of photometry onto an independently clocked behavior
//!   stream
//!
//! # Modules
//!
//! - [`processing`]: Numeric processing stages
//! - [`source`]: Raw data input adapters
//! - [`pipeline`]: Session-level demodulation and sync
//! - [`error`]: Processing errors

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod pipeline;
pub mod processing;
pub mod source;

// Re-export key types
pub use error::{ProcessingError, ProcessingResult};
pub use pipeline::{demodulate_session, load_trace_table, save_json, sync_session};
pub use processing::align::{AlignmentResult, StreamAligner, TrialBoundaries};
pub use processing::behavior::BehaviorData;
pub use processing::demod::{Demodulate, Envelope, LockInDemodulator, SpectrogramDemodulator};
pub use source::{ChannelSource, CsvSource, InMemorySource};
