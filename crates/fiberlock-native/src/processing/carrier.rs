//! Carrier frequency estimation
//!
//! The carrier of a frequency-multiplexed channel is the largest peak of the
//! magnitude spectrum of its reference (or signal) channel. The estimate is
//! reconciled against the nominal frequency from the session configuration.

use fiberlock_core::{CarrierEstimate, CarrierSource, ChannelKey};
use tracing::{debug, warn};

use super::fft::SpectralAnalyzer;
use crate::error::{ProcessingError, ProcessingResult};

/// Default number of leading samples analysed (2^14)
pub const DEFAULT_ANALYSIS_WINDOW: usize = 1 << 14;

/// Largest disagreement between estimate and nominal carrier that keeps the
/// nominal value
pub const CARRIER_TOLERANCE_HZ: f64 = 5.0;

/// Estimate the carrier frequency of `reference_trace`.
///
/// Uses the first `analysis_window` samples (clipped to the trace length)
/// and returns the centre frequency of the largest non-DC bin, accurate to
/// one bin (`sample_rate / window`).
///
/// # Errors
///
/// [`ProcessingError::InsufficientData`] for traces shorter than 4 samples.
pub fn estimate_carrier(
    reference_trace: &[f64],
    sample_rate: f64,
    analysis_window: usize,
) -> ProcessingResult<f64> {
    let window = analysis_window.min(reference_trace.len());
    if window < 4 {
        return Err(ProcessingError::InsufficientData {
            operation: "carrier estimation",
            got: reference_trace.len(),
            need: 4,
        });
    }

    let mut analyzer = SpectralAnalyzer::new(window, sample_rate);
    let spectrum = analyzer.magnitude(reference_trace, false);

    let peak = spectrum
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(1, |(k, _)| k);

    Ok(analyzer.bin_frequency(peak))
}

/// Decide which carrier frequency is authoritative.
///
/// The nominal value is kept when it lies within
/// [`CARRIER_TOLERANCE_HZ`] of the estimate; otherwise a warning is logged
/// and the estimate wins. Without a nominal value the estimate is used.
pub fn resolve_carrier(
    key: ChannelKey,
    estimated_hz: f64,
    configured_hz: Option<f64>,
) -> CarrierEstimate {
    let (frequency_hz, source) = match configured_hz {
        Some(set) if (set - estimated_hz).abs() <= CARRIER_TOLERANCE_HZ => {
            debug!(channel = %key, set, estimated_hz, "Carrier matches configuration");
            (set, CarrierSource::Configured)
        }
        Some(set) => {
            warn!(
                channel = %key,
                set,
                estimated_hz,
                "Calculated carrier frequency does not match set carrier frequency; using calculated value"
            );
            (estimated_hz, CarrierSource::Estimated)
        }
        None => (estimated_hz, CarrierSource::Estimated),
    };

    CarrierEstimate {
        estimated_hz,
        configured_hz,
        frequency_hz,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiberlock_core::{EmissionColor, Hemisphere};

    const FS: f64 = 6103.515625;

    /// Carrier on a DC offset, buried in uniform LCG noise plus a slow
    /// pseudo-noise wobble
    fn carrier(freq: f64, n: usize) -> Vec<f64> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..n)
            .map(|i| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                let noise = ((state >> 11) as f64 / (1u64 << 53) as f64 - 0.5) * 1.5;
                let wobble = 0.2 * (i as f64 * 0.123).sin();
                0.3 + (2.0 * std::f64::consts::PI * freq * i as f64 / FS).sin() + noise + wobble
            })
            .collect()
    }

    fn key() -> ChannelKey {
        ChannelKey::new(Hemisphere::Right, EmissionColor::Green)
    }

    #[test]
    fn test_estimate_within_one_bin() {
        for freq in [211.0, 500.0, 531.0] {
            let estimate = estimate_carrier(&carrier(freq, 20_000), FS, DEFAULT_ANALYSIS_WINDOW).unwrap();
            let bin = FS / DEFAULT_ANALYSIS_WINDOW as f64;
            assert!((estimate - freq).abs() <= bin, "{freq} Hz -> {estimate} Hz");
        }
    }

    #[test]
    fn test_estimate_clips_window() {
        // Shorter than the analysis window
        let estimate = estimate_carrier(&carrier(400.0, 5000), FS, DEFAULT_ANALYSIS_WINDOW).unwrap();
        assert!((estimate - 400.0).abs() <= FS / 5000.0);

        assert!(matches!(
            estimate_carrier(&[1.0, 2.0], FS, DEFAULT_ANALYSIS_WINDOW),
            Err(ProcessingError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_resolve_keeps_matching_configuration() {
        let c = resolve_carrier(key(), 499.7, Some(500.0));
        assert_eq!(c.source, CarrierSource::Configured);
        assert!((c.frequency_hz - 500.0).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_prefers_estimate_on_mismatch() {
        let c = resolve_carrier(key(), 531.0, Some(500.0));
        assert_eq!(c.source, CarrierSource::Estimated);
        assert!((c.frequency_hz - 531.0).abs() < 1e-12);

        let c = resolve_carrier(key(), 212.0, None);
        assert_eq!(c.source, CarrierSource::Estimated);
        assert_eq!(c.configured_hz, None);
    }
}
