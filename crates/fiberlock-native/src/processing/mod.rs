//! Signal processing stages
//!
//! This module provides the numeric building blocks of the pipeline:
//! - [`design`]: Elliptic and Butterworth filter design in SOS form
//! - [`filters`]: Second-order-section filtering, zero-phase
//! - [`resample`]: Fourier and polyphase resampling
//! - [`fft`]: Spectra and short-time Fourier transforms
//! - [`carrier`]: Carrier frequency estimation
//! - [`fit`]: Sinusoid fit to a reference snippet
//! - [`demod`]: Spectrogram and lock-in demodulation
//! - [`normalize`]: Rolling z-score and min-max scaling
//! - [`align`]: Trial-duration alignment of two streams
//! - [`behavior`]: Behavior stream loading, landmarks and binning

pub mod align;
pub mod behavior;
pub mod carrier;
pub mod demod;
pub mod design;
pub mod fft;
pub mod filters;
pub mod fit;
pub mod normalize;
pub mod resample;
