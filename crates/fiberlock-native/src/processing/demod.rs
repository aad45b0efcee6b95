//! Carrier demodulation
//!
//! Two interchangeable strategies recover the fluorescence envelope from a
//! carrier-modulated photometry channel:
//! - [`SpectrogramDemodulator`]: STFT magnitude at the bin nearest the carrier
//! - [`LockInDemodulator`]: quadrature references fitted to the carrier
//!   reference channel, squared products integrated by a low-pass filter
//!
//! Both implement [`Demodulate`] and return an [`Envelope`].

use std::f64::consts::{FRAC_PI_2, SQRT_2};

use fiberlock_core::{ProcessingPlan, RawChannelTrace, Transform};
use tracing::debug;

use super::design::{design_bandpass, design_butterworth_lowpass, design_elliptic_lowpass, EllipticSpec};
use super::fft::{hamming_window, SpectralAnalyzer};
use super::fit::{fit_sinusoid, FitOptions};
use super::resample::{resample, ResampleMethod};
use crate::error::{ProcessingError, ProcessingResult};

/// Demodulated envelope and its time base
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Envelope samples; filter transients are `NaN`
    pub samples: Vec<f64>,
    /// Envelope sample rate (Hz)
    pub sample_rate: f64,
    /// Time of the first sample relative to the raw trace start (s)
    pub start_time: f64,
    /// Producing algorithm
    pub transform: Transform,
    /// Time-averaged carrier-bin magnitude, when the algorithm provides one
    pub spectral_power: Option<f64>,
}

/// A demodulation algorithm.
pub trait Demodulate {
    /// Which transform this is
    fn transform(&self) -> Transform;

    /// Recover the envelope of `signal` modulated at `carrier_hz`.
    ///
    /// `reference` is the recorded carrier drive, if any. Algorithms that
    /// need a phase reference fall back to the signal itself.
    ///
    /// # Errors
    ///
    /// Filter design failures and traces too short for the algorithm.
    fn demodulate(
        &self,
        signal: &RawChannelTrace<'_>,
        reference: Option<&RawChannelTrace<'_>>,
        carrier_hz: f64,
    ) -> ProcessingResult<Envelope>;
}

/// Build the demodulator selected by a processing plan.
#[must_use]
pub fn demodulator_for(plan: &ProcessingPlan) -> Box<dyn Demodulate> {
    match plan.transform {
        Transform::Spectrogram => Box::new(SpectrogramDemodulator::from_plan(plan)),
        Transform::LockIn => Box::new(LockInDemodulator::from_plan(plan)),
    }
}

// ============================================================================
// Spectrogram
// ============================================================================

/// STFT demodulator with a periodic Hamming window.
#[derive(Clone, Copy, Debug)]
pub struct SpectrogramDemodulator {
    /// Segment length in samples
    pub nperseg: usize,
    /// Overlap between consecutive segments in samples
    pub noverlap: usize,
}

impl SpectrogramDemodulator {
    /// Create a new spectrogram demodulator
    #[must_use]
    pub fn new(nperseg: usize, noverlap: usize) -> Self {
        Self { nperseg, noverlap }
    }

    /// Segment parameters from a plan
    #[must_use]
    pub fn from_plan(plan: &ProcessingPlan) -> Self {
        Self::new(plan.no_per_segment, plan.noverlap)
    }
}

impl Demodulate for SpectrogramDemodulator {
    fn transform(&self) -> Transform {
        Transform::Spectrogram
    }

    fn demodulate(
        &self,
        signal: &RawChannelTrace<'_>,
        _reference: Option<&RawChannelTrace<'_>>,
        carrier_hz: f64,
    ) -> ProcessingResult<Envelope> {
        if self.nperseg < 2 || self.noverlap >= self.nperseg {
            return Err(ProcessingError::invalid_parameter(
                "noverlap",
                format!("{} overlap with {}-sample segments", self.noverlap, self.nperseg),
            ));
        }
        if signal.len() < self.nperseg {
            return Err(ProcessingError::InsufficientData {
                operation: "spectrogram",
                got: signal.len(),
                need: self.nperseg,
            });
        }

        let fs = signal.sample_rate;
        let mut analyzer = SpectralAnalyzer::with_window(hamming_window(self.nperseg, true), fs);
        let bin = analyzer.nearest_bin(carrier_hz);
        let samples = analyzer.bin_series(signal.samples, self.noverlap, bin);
        let spectral_power = samples.iter().sum::<f64>() / samples.len() as f64;

        debug!(
            channel = %signal.key,
            bin,
            bin_hz = analyzer.bin_frequency(bin),
            frames = samples.len(),
            "Spectrogram demodulation"
        );

        Ok(Envelope {
            samples,
            sample_rate: analyzer.frame_rate(self.noverlap),
            start_time: self.nperseg as f64 / 2.0 / fs,
            transform: Transform::Spectrogram,
            spectral_power: Some(spectral_power),
        })
    }
}

// ============================================================================
// Lock-in
// ============================================================================

/// Quadrature lock-in demodulator.
#[derive(Clone, Copy, Debug)]
pub struct LockInDemodulator {
    /// Width of the carrier bandpass (Hz)
    pub bandpass_bandwidth: f64,
    /// Whether the signal is bandpassed before mixing
    pub bandpass_signal: bool,
    /// Output rate (Hz)
    pub downsample_frequency: f64,
    /// Integration time constant (s); the low-pass cutoff is its inverse
    pub time_constant: f64,
    /// Reference snippet length for the sinusoid fit
    pub fit_snippet: usize,
    /// Start of the fit snippet (s)
    pub fit_offset: f64,
}

impl LockInDemodulator {
    /// Samples used for the reference fit
    pub const DEFAULT_FIT_SNIPPET: usize = 10_000;

    /// Butterworth order of the anti-aliasing filter
    const ANTIALIAS_ORDER: usize = 3;

    /// Parameters from a plan. The fit snippet starts after one z-score
    /// window so that it avoids the start-of-recording transient.
    #[must_use]
    pub fn from_plan(plan: &ProcessingPlan) -> Self {
        Self {
            bandpass_bandwidth: plan.bandpass_bandwidth,
            bandpass_signal: true,
            downsample_frequency: plan.downsample_frequency,
            time_constant: plan.demod_time_constant,
            fit_snippet: Self::DEFAULT_FIT_SNIPPET,
            fit_offset: plan.z_window,
        }
    }

    /// Square the products, anti-alias, downsample and integrate.
    fn integrate(&self, product: Vec<f64>, fs: f64) -> ProcessingResult<Vec<f64>> {
        let squared: Vec<f64> = product.into_iter().map(|v| v * v).collect();

        let downsampled = if self.downsample_frequency < fs {
            let antialias = design_butterworth_lowpass(
                0.8 * self.downsample_frequency / 2.0,
                fs,
                Self::ANTIALIAS_ORDER,
            )?;
            resample(
                &antialias.filtfilt(&squared),
                fs,
                self.downsample_frequency,
                ResampleMethod::Polyphase,
            )?
        } else {
            squared
        };

        let integration = design_elliptic_lowpass(
            1.0 / self.time_constant,
            self.downsample_frequency.min(fs),
            EllipticSpec::INTEGRATION,
        )?;
        Ok(integration
            .filtfilt(&downsampled)
            .into_iter()
            .map(|v| v.max(0.0).sqrt())
            .collect())
    }
}

impl Demodulate for LockInDemodulator {
    fn transform(&self) -> Transform {
        Transform::LockIn
    }

    fn demodulate(
        &self,
        signal: &RawChannelTrace<'_>,
        reference: Option<&RawChannelTrace<'_>>,
        carrier_hz: f64,
    ) -> ProcessingResult<Envelope> {
        let fs = signal.sample_rate;
        let bandpass = design_bandpass(
            carrier_hz,
            self.bandpass_bandwidth,
            fs,
            EllipticSpec::CARRIER_BANDPASS.order,
            EllipticSpec::CARRIER_BANDPASS.attenuation_db,
            EllipticSpec::CARRIER_BANDPASS.ripple_db,
        )?;

        // Fit the reference phase on a bandpassed snippet
        let reference_samples = reference.map_or(signal.samples, |r| r.samples);
        let snippet_len = self.fit_snippet.min(reference_samples.len());
        let offset = ((self.fit_offset * fs) as usize).min(reference_samples.len() - snippet_len);
        let filtered_reference = bandpass.filtfilt(reference_samples);
        let params = fit_sinusoid(
            &filtered_reference[offset..offset + snippet_len],
            fs,
            offset as f64 / fs,
            carrier_hz,
            FitOptions::default(),
        )?;

        let ref_x = params.unit_reference(signal.len(), fs, 0.0);
        let ref_y = params.unit_reference(signal.len(), fs, FRAC_PI_2);

        let mixed = if self.bandpass_signal {
            bandpass.filtfilt(signal.samples)
        } else {
            signal.samples.to_vec()
        };
        let in_phase = self.integrate(mixed.iter().zip(&ref_x).map(|(s, r)| s * r).collect(), fs)?;
        let quadrature = self.integrate(mixed.iter().zip(&ref_y).map(|(s, r)| s * r).collect(), fs)?;

        let out_rate = self.downsample_frequency.min(fs);
        let mut samples: Vec<f64> = in_phase
            .iter()
            .zip(&quadrature)
            .map(|(x, y)| x.hypot(*y) * SQRT_2)
            .collect();

        let edge = ((self.time_constant * out_rate) as usize).min(samples.len());
        samples[..edge].fill(f64::NAN);
        let len = samples.len();
        samples[len - edge..].fill(f64::NAN);

        debug!(
            channel = %signal.key,
            fitted_hz = params.frequency,
            phase = params.phase,
            samples = samples.len(),
            "Lock-in demodulation"
        );

        Ok(Envelope {
            samples,
            sample_rate: out_rate,
            start_time: 0.0,
            transform: Transform::LockIn,
            spectral_power: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiberlock_core::{ChannelKey, ChannelRole, EmissionColor, Hemisphere};
    use std::f64::consts::TAU;

    const FS: f64 = 6103.515625;

    fn envelope_at(t: f64) -> f64 {
        1.0 + 0.5 * (TAU * 0.2 * t).sin()
    }

    /// AM carrier plus the clean drive sinusoid.
    fn recording(seconds: f64) -> (Vec<f64>, Vec<f64>) {
        let n = (seconds * FS) as usize;
        let drive: Vec<f64> = (0..n).map(|i| (TAU * 500.0 * i as f64 / FS + 0.4).sin()).collect();
        let signal = (0..n)
            .map(|i| {
                let t = i as f64 / FS;
                0.3 + envelope_at(t) * (TAU * 500.0 * t + 1.3).sin() + 0.01 * (i as f64 * 0.754_877).sin()
            })
            .collect();
        (signal, drive)
    }

    fn key() -> ChannelKey {
        ChannelKey::new(Hemisphere::Right, EmissionColor::Green)
    }

    fn correlation(a: &[f64], b: &[f64]) -> f64 {
        let n = a.len() as f64;
        let (ma, mb) = (a.iter().sum::<f64>() / n, b.iter().sum::<f64>() / n);
        let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
        let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
        let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
        cov / (va * vb).sqrt()
    }

    #[test]
    fn test_lockin_recovers_envelope() {
        let (signal, drive) = recording(20.0);
        let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &signal, FS);
        let drive = RawChannelTrace::new(key(), ChannelRole::Carrier, &drive, FS);

        let mut plan = ProcessingPlan::with_sampling_frequency(FS);
        plan.z_window = 1.0;
        let demod = LockInDemodulator::from_plan(&plan);
        let envelope = demod.demodulate(&signal, Some(&drive), 500.0).unwrap();

        assert_eq!(envelope.transform, Transform::LockIn);
        assert!((envelope.sample_rate - 600.0).abs() < 1e-12);
        assert_eq!(envelope.samples.len(), 12_000);
        assert!(envelope.samples[0].is_nan());
        assert!(envelope.samples[29].is_nan());
        assert!(envelope.samples[11_999].is_nan());

        // Away from the edges the envelope is within 5%
        for (i, value) in envelope.samples.iter().enumerate().skip(600).take(10_800) {
            let expected = envelope_at(i as f64 / 600.0);
            assert!(
                ((value - expected) / expected).abs() < 0.05,
                "sample {i}: {value} vs {expected}"
            );
        }
    }

    #[test]
    fn test_lockin_without_reference() {
        let (signal, _) = recording(10.0);
        let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &signal, FS);
        let plan = ProcessingPlan::with_sampling_frequency(FS);
        let envelope = LockInDemodulator::from_plan(&plan)
            .demodulate(&signal, None, 500.0)
            .unwrap();

        let middle: Vec<f64> = envelope.samples[600..5400].to_vec();
        let expected: Vec<f64> = (600..5400).map(|i| envelope_at(i as f64 / 600.0)).collect();
        assert!(correlation(&middle, &expected) > 0.99);
    }

    #[test]
    fn test_spectrogram_tracks_envelope() {
        let (signal, _) = recording(20.0);
        let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &signal, FS);
        let demod = SpectrogramDemodulator::new(216, 108);
        let envelope = demod.demodulate(&signal, None, 500.0).unwrap();

        assert_eq!(envelope.transform, Transform::Spectrogram);
        assert!((envelope.sample_rate - FS / 108.0).abs() < 1e-9);
        assert!((envelope.start_time - 108.0 / FS).abs() < 1e-12);
        assert_eq!(envelope.samples.len(), (signal.len() - 216) / 108 + 1);

        let expected: Vec<f64> = (0..envelope.samples.len())
            .map(|i| envelope_at(envelope.start_time + i as f64 / envelope.sample_rate))
            .collect();
        assert!(correlation(&envelope.samples, &expected) > 0.99);

        let power = envelope.spectral_power.unwrap();
        let mean = envelope.samples.iter().sum::<f64>() / envelope.samples.len() as f64;
        assert!((power - mean).abs() < 1e-12);
    }

    #[test]
    fn test_spectrogram_rejects_short_trace() {
        let samples = vec![0.0; 100];
        let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &samples, FS);
        assert!(matches!(
            SpectrogramDemodulator::new(216, 108).demodulate(&signal, None, 500.0),
            Err(ProcessingError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_lockin_rejects_wide_band() {
        let (signal, _) = recording(2.0);
        let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &signal, FS);
        let mut plan = ProcessingPlan::with_sampling_frequency(FS);
        plan.bandpass_bandwidth = 2_000.0;
        assert!(matches!(
            LockInDemodulator::from_plan(&plan).demodulate(&signal, None, 500.0),
            Err(ProcessingError::UnstableFilter { .. })
        ));
    }

    #[test]
    fn test_demodulator_for_plan() {
        let mut plan = ProcessingPlan::with_sampling_frequency(FS);
        assert_eq!(demodulator_for(&plan).transform(), Transform::Spectrogram);
        plan.transform = Transform::LockIn;
        assert_eq!(demodulator_for(&plan).transform(), Transform::LockIn);
    }
}
