//! FFT-based spectral analysis
//!
//! Provides one-sided magnitude spectra, short-time Fourier transforms and
//! the window functions used by demodulation and resampling.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// FFT-based spectral analyzer for a fixed transform size
pub struct SpectralAnalyzer {
    fft_size: usize,
    sample_rate: f64,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralAnalyzer {
    /// Create a new spectral analyzer with a rectangular window
    ///
    /// # Arguments
    ///
    /// * `fft_size` - FFT size (any length; powers of 2 are fastest)
    /// * `sample_rate` - Sample rate in Hz
    #[must_use]
    pub fn new(fft_size: usize, sample_rate: f64) -> Self {
        Self::with_window(vec![1.0; fft_size], sample_rate)
    }

    /// Create an analyzer whose size is the window length
    #[must_use]
    pub fn with_window(window: Vec<f64>, sample_rate: f64) -> Self {
        let fft_size = window.len();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            sample_rate,
            scratch: vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()],
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// FFT size
    #[must_use]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Frequency resolution (Hz per bin)
    #[must_use]
    pub fn frequency_resolution(&self) -> f64 {
        self.sample_rate / self.fft_size as f64
    }

    /// Number of one-sided bins (DC through Nyquist)
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Centre frequency of bin `k`
    #[must_use]
    pub fn bin_frequency(&self, k: usize) -> f64 {
        k as f64 * self.frequency_resolution()
    }

    /// One-sided bin closest to `freq_hz`
    #[must_use]
    pub fn nearest_bin(&self, freq_hz: f64) -> usize {
        let k = (freq_hz / self.frequency_resolution()).round();
        if k <= 0.0 {
            0
        } else {
            (k as usize).min(self.n_bins() - 1)
        }
    }

    /// One-sided magnitude spectrum `|X_k|` of the first `fft_size` samples.
    ///
    /// The segment mean is removed first when `detrend` is set.
    ///
    /// # Panics
    ///
    /// Panics if `samples` is shorter than the FFT size.
    pub fn magnitude(&mut self, samples: &[f64], detrend: bool) -> Vec<f64> {
        self.transform_segment(samples, detrend);
        self.buffer[..self.n_bins()].iter().map(|c| c.norm()).collect()
    }

    /// Window and transform the first `fft_size` samples into the buffer.
    fn transform_segment(&mut self, samples: &[f64], detrend: bool) {
        assert!(samples.len() >= self.fft_size, "Not enough samples for FFT");
        let segment = &samples[..self.fft_size];
        let mean = if detrend {
            segment.iter().sum::<f64>() / self.fft_size as f64
        } else {
            0.0
        };

        for (slot, (&s, &w)) in self.buffer.iter_mut().zip(segment.iter().zip(&self.window)) {
            *slot = Complex::new((s - mean) * w, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
    }

    fn hop(&self, noverlap: usize) -> usize {
        self.fft_size.saturating_sub(noverlap).max(1)
    }

    /// STFT segments per second for the given overlap
    #[must_use]
    pub fn frame_rate(&self, noverlap: usize) -> f64 {
        self.sample_rate / self.hop(noverlap) as f64
    }

    /// Short-time Fourier transform magnitudes.
    ///
    /// Segments of `fft_size` samples start every `fft_size - noverlap`
    /// samples; each is mean-removed and windowed. Magnitudes are scaled by
    /// `2 / sum(window)` so a sinusoid centred on a bin reads as its
    /// amplitude.
    #[must_use]
    pub fn spectrogram(&mut self, samples: &[f64], noverlap: usize) -> Spectrogram {
        let hop = self.hop(noverlap);
        let scale = 2.0 / self.window.iter().sum::<f64>();

        let mut times = Vec::new();
        let mut magnitudes = Vec::new();
        let mut start = 0;
        while start + self.fft_size <= samples.len() {
            let column = self.magnitude(&samples[start..], true);
            magnitudes.push(column.into_iter().map(|m| m * scale).collect());
            times.push((start as f64 + self.fft_size as f64 / 2.0) / self.sample_rate);
            start += hop;
        }

        Spectrogram {
            frequencies: (0..self.n_bins()).map(|k| self.bin_frequency(k)).collect(),
            times,
            magnitudes,
            frame_rate: self.frame_rate(noverlap),
        }
    }

    /// Scaled STFT magnitude of a single bin, one value per segment.
    ///
    /// Same framing and scaling as [`spectrogram`](Self::spectrogram) but
    /// only the requested bin is kept. Out-of-range bins read as `NaN`.
    #[must_use]
    pub fn bin_series(&mut self, samples: &[f64], noverlap: usize, bin: usize) -> Vec<f64> {
        let hop = self.hop(noverlap);
        let scale = 2.0 / self.window.iter().sum::<f64>();
        let in_range = bin < self.n_bins();

        let frames = if samples.len() >= self.fft_size {
            (samples.len() - self.fft_size) / hop + 1
        } else {
            0
        };
        let mut series = Vec::with_capacity(frames);
        for frame in 0..frames {
            if in_range {
                self.transform_segment(&samples[frame * hop..], true);
                series.push(self.buffer[bin].norm() * scale);
            } else {
                series.push(f64::NAN);
            }
        }
        series
    }
}

/// STFT magnitude matrix
#[derive(Clone, Debug)]
pub struct Spectrogram {
    /// Bin centre frequencies (Hz)
    pub frequencies: Vec<f64>,
    /// Segment centre times (s)
    pub times: Vec<f64>,
    /// Magnitudes indexed `[segment][bin]`
    pub magnitudes: Vec<Vec<f64>>,
    /// Segments per second
    pub frame_rate: f64,
}

impl Spectrogram {
    /// Magnitude over time of one bin
    #[must_use]
    pub fn bin_series(&self, bin: usize) -> Vec<f64> {
        self.magnitudes
            .iter()
            .map(|column| column.get(bin).copied().unwrap_or(f64::NAN))
            .collect()
    }
}

/// Hamming window. `periodic` selects the DFT-even form used for spectral
/// analysis; otherwise the window is symmetric.
#[must_use]
pub fn hamming_window(size: usize, periodic: bool) -> Vec<f64> {
    if size <= 1 {
        return vec![1.0; size];
    }
    let denom = (if periodic { size } else { size - 1 }) as f64;
    (0..size)
        .map(|i| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos())
        .collect()
}

/// Symmetric Kaiser window with shape parameter `beta`
#[must_use]
pub fn kaiser_window(size: usize, beta: f64) -> Vec<f64> {
    if size <= 1 {
        return vec![1.0; size];
    }
    let norm = bessel_i0(beta);
    let m = (size - 1) as f64;
    (0..size)
        .map(|i| {
            let r = 2.0 * i as f64 / m - 1.0;
            bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / norm
        })
        .collect()
}

/// Modified Bessel function of the first kind, order zero (power series).
#[must_use]
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..200 {
        let factor = half / k as f64;
        term *= factor * factor;
        sum += term;
        if term < sum * 1e-17 {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_peak() {
        let mut analyzer = SpectralAnalyzer::new(256, 256.0);

        // 10 Hz sine lands exactly on bin 10
        let samples: Vec<f64> = (0..256)
            .map(|i| 3.0 * (2.0 * std::f64::consts::PI * 10.0 * i as f64 / 256.0).sin())
            .collect();

        let spectrum = analyzer.magnitude(&samples, false);
        assert_eq!(spectrum.len(), 129);

        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 10);
        assert!((spectrum[10] - 3.0 * 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_spectrogram_amplitude_scaling() {
        let fs = 1000.0;
        let n = 200;
        let mut analyzer = SpectralAnalyzer::with_window(hamming_window(n, true), fs);
        // 100 Hz = bin 20 of a 200-point transform
        let samples: Vec<f64> = (0..4000)
            .map(|i| 0.5 + 2.0 * (2.0 * std::f64::consts::PI * 100.0 * i as f64 / fs).cos())
            .collect();

        let spec = analyzer.spectrogram(&samples, 100);
        assert_eq!(analyzer.nearest_bin(100.0), 20);
        assert!((spec.frame_rate - 10.0).abs() < 1e-12);
        assert_eq!(spec.times.len(), (4000 - 200) / 100 + 1);
        assert!((spec.times[0] - 0.1).abs() < 1e-12);

        for amplitude in spec.bin_series(20) {
            assert!((amplitude - 2.0).abs() < 1e-9);
        }
        // Mean removed per segment
        assert!(spec.bin_series(0)[0] < 1e-9);
    }

    #[test]
    fn test_single_bin_matches_spectrogram() {
        let fs = 1000.0;
        let mut analyzer = SpectralAnalyzer::with_window(hamming_window(128, true), fs);
        let samples: Vec<f64> = (0..3000)
            .map(|i| {
                let t = i as f64 / fs;
                (1.0 + 0.3 * (2.0 * std::f64::consts::PI * 0.7 * t).sin())
                    * (2.0 * std::f64::consts::PI * 125.0 * t).sin()
                    + 0.05 * (i as f64 * 0.123).sin()
            })
            .collect();

        let bin = analyzer.nearest_bin(125.0);
        let full = analyzer.spectrogram(&samples, 64).bin_series(bin);
        let single = analyzer.bin_series(&samples, 64, bin);
        assert_eq!(single.len(), full.len());
        for (a, b) in single.iter().zip(&full) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!((analyzer.frame_rate(64) - 1000.0 / 64.0).abs() < 1e-12);

        assert!(analyzer.bin_series(&samples, 64, 1_000).iter().all(|v| v.is_nan()));
        assert!(analyzer.bin_series(&samples[..100], 64, bin).is_empty());
    }

    #[test]
    fn test_windows() {
        let w = hamming_window(8, true);
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[4] - 1.0).abs() < 1e-12);

        let k = kaiser_window(11, 5.0);
        assert!((k[5] - 1.0).abs() < 1e-12);
        assert!((k[0] - k[10]).abs() < 1e-12);
        assert!((k[0] - 1.0 / bessel_i0(5.0)).abs() < 1e-12);

        // I0(1) = 1.2660658777520082
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_2).abs() < 1e-14);
    }
}
