//! Second-order-section IIR filters
//!
//! Floating-point biquad cascades for offline processing of whole traces,
//! including forward-backward (zero-phase) application with odd-extension
//! padding and steady-state initial conditions.

/// Biquad coefficients (second-order section)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoeffs {
    /// Numerator coefficients [b0, b1, b2]
    pub b: [f64; 3],
    /// Denominator coefficients [a0=1, a1, a2]
    pub a: [f64; 3],
}

impl BiquadCoeffs {
    /// Gain at DC (z = 1)
    #[must_use]
    pub fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    /// Largest pole magnitude of this section.
    ///
    /// Poles are the roots of `z^2 + a1 z + a2`.
    #[must_use]
    pub fn max_pole_radius(&self) -> f64 {
        let a1 = self.a[1] / self.a[0];
        let a2 = self.a[2] / self.a[0];
        let disc = a1 * a1 - 4.0 * a2;
        if disc < 0.0 {
            // Complex conjugate pair, |p|^2 = a2
            a2.abs().sqrt()
        } else {
            let root = disc.sqrt();
            ((-a1 + root) / 2.0).abs().max(((-a1 - root) / 2.0).abs())
        }
    }

    /// Steady-state delay-line values for a unit step input.
    fn step_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let det = 1.0 + a1 + a2;
        let beta1 = b1 - a1 * b0;
        let beta2 = b2 - a2 * b0;
        let z0 = (beta1 + beta2) / det;
        [z0, beta2 - a2 * z0]
    }
}

/// Second-order biquad section, transposed direct form II
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    /// State: [z1, z2]
    state: [f64; 2],
}

impl Biquad {
    /// Create a new biquad section with given coefficients
    #[must_use]
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self { coeffs, state: [0.0, 0.0] }
    }

    /// Process a single sample
    #[inline]
    pub fn filter(&mut self, input: f64) -> f64 {
        let [b0, b1, b2] = self.coeffs.b;
        let [_, a1, a2] = self.coeffs.a;

        let output = b0 * input + self.state[0];
        self.state[0] = b1 * input - a1 * output + self.state[1];
        self.state[1] = b2 * input - a2 * output;

        output
    }

    /// Set the delay line
    pub fn set_state(&mut self, state: [f64; 2]) {
        self.state = state;
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.state = [0.0, 0.0];
    }
}

/// Cascade of second-order sections.
///
/// The overall gain is folded into the first section.
#[derive(Clone, Debug, PartialEq)]
pub struct SosFilter {
    sections: Vec<BiquadCoeffs>,
}

impl SosFilter {
    /// Create a filter from its sections
    #[must_use]
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self { sections }
    }

    /// Sections in application order
    #[must_use]
    pub fn sections(&self) -> &[BiquadCoeffs] {
        &self.sections
    }

    /// Number of sections
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether the cascade is empty (identity)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Largest pole magnitude across all sections
    #[must_use]
    pub fn max_pole_radius(&self) -> f64 {
        self.sections
            .iter()
            .map(BiquadCoeffs::max_pole_radius)
            .fold(0.0, f64::max)
    }

    /// All poles strictly inside the unit circle
    #[must_use]
    pub fn is_stable(&self) -> bool {
        let radius = self.max_pole_radius();
        radius.is_finite() && radius < 1.0
    }

    /// Gain at DC
    #[must_use]
    pub fn dc_gain(&self) -> f64 {
        self.sections.iter().map(BiquadCoeffs::dc_gain).product()
    }

    /// Magnitude response at `freq_hz`
    #[must_use]
    pub fn magnitude_at(&self, freq_hz: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * std::f64::consts::PI * freq_hz / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());
        self.sections
            .iter()
            .map(|s| {
                let num_re = s.b[0] + s.b[1] * c1 + s.b[2] * c2;
                let num_im = -(s.b[1] * s1 + s.b[2] * s2);
                let den_re = s.a[0] + s.a[1] * c1 + s.a[2] * c2;
                let den_im = -(s.a[1] * s1 + s.a[2] * s2);
                num_re.hypot(num_im) / den_re.hypot(den_im)
            })
            .product()
    }

    /// Filter a whole trace from rest (causal, single pass)
    #[must_use]
    pub fn filter(&self, input: &[f64]) -> Vec<f64> {
        let mut stages: Vec<Biquad> = self.sections.iter().copied().map(Biquad::new).collect();
        input
            .iter()
            .map(|&x| stages.iter_mut().fold(x, |acc, stage| stage.filter(acc)))
            .collect()
    }

    /// Delay-line values that make the cascade start in steady state for a
    /// unit step input.
    #[must_use]
    pub fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let [z0, z1] = section.step_state();
                let state = [scale * z0, scale * z1];
                scale *= section.dc_gain();
                state
            })
            .collect()
    }

    /// Default edge padding for forward-backward filtering.
    #[must_use]
    pub fn default_padlen(&self) -> usize {
        let b2_zero = self.sections.iter().filter(|s| s.b[2] == 0.0).count();
        let a2_zero = self.sections.iter().filter(|s| s.a[2] == 0.0).count();
        let ntaps = 2 * self.sections.len() + 1 - b2_zero.min(a2_zero);
        3 * ntaps
    }

    fn run_from(&self, input: &[f64], initial: f64, zi: &[[f64; 2]]) -> Vec<f64> {
        let mut stages: Vec<Biquad> = self
            .sections
            .iter()
            .zip(zi)
            .map(|(coeffs, state)| {
                let mut stage = Biquad::new(*coeffs);
                stage.set_state([state[0] * initial, state[1] * initial]);
                stage
            })
            .collect();
        input
            .iter()
            .map(|&x| stages.iter_mut().fold(x, |acc, stage| stage.filter(acc)))
            .collect()
    }

    /// Forward-backward (zero-phase) filtering.
    ///
    /// The trace is padded at both ends by odd reflection, filtered forward
    /// and backward from steady-state initial conditions, and the padding
    /// removed. The effective magnitude response is the square of the
    /// single-pass response with zero phase shift.
    #[must_use]
    pub fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        if input.is_empty() || self.sections.is_empty() {
            return input.to_vec();
        }

        let padlen = self.default_padlen().min(input.len() - 1);
        let extended = odd_extend(input, padlen);
        let zi = self.steady_state();

        let mut forward = self.run_from(&extended, extended[0], &zi);
        forward.reverse();
        let y0 = forward[0];
        let mut backward = self.run_from(&forward, y0, &zi);
        backward.reverse();

        backward.drain(..padlen);
        backward.truncate(input.len());
        backward
    }
}

/// Pad a trace by `n` samples at each end with its odd reflection.
pub(crate) fn odd_extend(input: &[f64], n: usize) -> Vec<f64> {
    let len = input.len();
    let first = input[0];
    let last = input[len - 1];

    let mut out = Vec::with_capacity(len + 2 * n);
    out.extend((1..=n).rev().map(|i| 2.0 * first - input[i]));
    out.extend_from_slice(input);
    out.extend((1..=n).map(|i| 2.0 * last - input[len - 1 - i]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_pole_lowpass() -> SosFilter {
        // y[n] = 0.1 x[n] + 0.9 y[n-1]
        SosFilter::new(vec![BiquadCoeffs {
            b: [0.1, 0.0, 0.0],
            a: [1.0, -0.9, 0.0],
        }])
    }

    #[test]
    fn test_odd_extend() {
        let x = [1.0, 2.0, 4.0, 7.0];
        let ext = odd_extend(&x, 2);
        assert_eq!(ext, vec![-2.0, 0.0, 1.0, 2.0, 4.0, 7.0, 10.0, 12.0]);
    }

    #[test]
    fn test_pole_radius() {
        assert!((one_pole_lowpass().max_pole_radius() - 0.9).abs() < 1e-12);

        // Complex pair at radius 0.95
        let r: f64 = 0.95;
        let theta: f64 = 0.3;
        let section = BiquadCoeffs {
            b: [1.0, 0.0, 0.0],
            a: [1.0, -2.0 * r * theta.cos(), r * r],
        };
        assert!((section.max_pole_radius() - r).abs() < 1e-12);

        let unstable = SosFilter::new(vec![BiquadCoeffs {
            b: [1.0, 0.0, 0.0],
            a: [1.0, -1.5, 0.0],
        }]);
        assert!(!unstable.is_stable());
    }

    #[test]
    fn test_steady_state_step() {
        let filter = one_pole_lowpass();
        let zi = filter.steady_state();
        let step = vec![3.0; 50];
        let out = filter.run_from(&step, 3.0, &zi);
        // Starting in steady state, a constant input passes unchanged
        for y in out {
            assert!((y - 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_filtfilt_preserves_constant() {
        let filter = one_pole_lowpass();
        let out = filter.filtfilt(&vec![1.5; 100]);
        assert_eq!(out.len(), 100);
        for y in out {
            assert!((y - 1.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_filtfilt_short_input() {
        let filter = one_pole_lowpass();
        assert!(filter.filtfilt(&[]).is_empty());
        let out = filter.filtfilt(&[2.0]);
        assert_eq!(out.len(), 1);
        assert!((out[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_magnitude_response() {
        let filter = one_pole_lowpass();
        assert!((filter.magnitude_at(0.0, 100.0) - 1.0).abs() < 1e-12);
        assert!(filter.magnitude_at(40.0, 100.0) < 0.1);
    }
}
