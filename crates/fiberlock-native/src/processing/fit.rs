//! Sinusoid fitting
//!
//! Least-squares fit of `A sin(2 pi f t + phi) + c` to a short snippet of a
//! reference channel. A grid search over frequency with the linear
//! sub-problem solved exactly gives the starting point; Levenberg-Marquardt
//! iterations on the normal equations refine all four parameters.

use std::f64::consts::{PI, TAU};

use tracing::debug;

use crate::error::{ProcessingError, ProcessingResult};

/// Parameters of a fitted sinusoid
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SineParams {
    /// Amplitude (non-negative)
    pub amplitude: f64,
    /// Frequency in Hz
    pub frequency: f64,
    /// Phase at t = 0 in radians, wrapped to (-pi, pi]
    pub phase: f64,
    /// DC offset
    pub offset: f64,
}

impl SineParams {
    /// Evaluate at time `t` seconds
    #[must_use]
    pub fn value_at(&self, t: f64) -> f64 {
        self.amplitude * (TAU * self.frequency * t + self.phase).sin() + self.offset
    }

    /// Unit-amplitude, zero-offset reference of `len` samples with an extra
    /// phase shift.
    #[must_use]
    pub fn unit_reference(&self, len: usize, sample_rate: f64, phase_shift: f64) -> Vec<f64> {
        let w = TAU * self.frequency / sample_rate;
        let phase = self.phase + phase_shift;
        (0..len).map(|i| (w * i as f64 + phase).sin()).collect()
    }
}

/// Fit options
#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    /// Half-width of the initial frequency grid (Hz)
    pub search_half_width_hz: f64,
    /// Grid step (Hz)
    pub search_step_hz: f64,
    /// Maximum refinement iterations
    pub max_iterations: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            search_half_width_hz: 1.0,
            search_step_hz: 0.01,
            max_iterations: 100,
        }
    }
}

/// Fit a sinusoid near `expected_hz` to `samples`.
///
/// Sample `i` is taken at time `start_time + i / sample_rate`; the returned
/// phase refers to t = 0 on that clock.
///
/// # Errors
///
/// [`ProcessingError::InsufficientData`] for fewer than 8 samples, and
/// [`ProcessingError::InvalidParameter`] when no frequency in the search
/// grid gives a solvable fit.
pub fn fit_sinusoid(
    samples: &[f64],
    sample_rate: f64,
    start_time: f64,
    expected_hz: f64,
    options: FitOptions,
) -> ProcessingResult<SineParams> {
    if samples.len() < 8 {
        return Err(ProcessingError::InsufficientData {
            operation: "sinusoid fit",
            got: samples.len(),
            need: 8,
        });
    }
    // Local clock keeps the frequency column of the Jacobian well scaled
    let times: Vec<f64> = (0..samples.len()).map(|i| i as f64 / sample_rate).collect();

    let steps = (options.search_half_width_hz / options.search_step_hz).round() as i64;
    let mut best: Option<(f64, f64, [f64; 3])> = None;
    for s in -steps..=steps {
        let freq = expected_hz + s as f64 * options.search_step_hz;
        if freq <= 0.0 {
            continue;
        }
        if let Some((sse, coeffs)) = linear_fit(samples, &times, freq) {
            if best.map_or(true, |(best_sse, _, _)| sse < best_sse) {
                best = Some((sse, freq, coeffs));
            }
        }
    }
    let (grid_sse, freq, [a, b, c]) = best.ok_or_else(|| {
        ProcessingError::invalid_parameter(
            "reference",
            format!("no sinusoid fit near {expected_hz} Hz"),
        )
    })?;

    // a sin + b cos = A sin(. + phi)
    let initial = [a.hypot(b), freq, b.atan2(a), c];
    let (params, sse) = refine(samples, &times, initial, grid_sse, options.max_iterations);

    let [mut amplitude, frequency, mut phase, offset] = params;
    if amplitude < 0.0 {
        amplitude = -amplitude;
        phase += PI;
    }
    phase -= TAU * frequency * start_time;

    debug!(
        amplitude,
        frequency,
        rms_residual = (sse / samples.len() as f64).sqrt(),
        "Fitted reference sinusoid"
    );

    Ok(SineParams {
        amplitude,
        frequency,
        phase: wrap_phase(phase),
        offset,
    })
}

/// Best `a sin(wt) + b cos(wt) + c` at a fixed frequency. Returns the
/// residual sum of squares and `[a, b, c]`.
fn linear_fit(samples: &[f64], times: &[f64], freq: f64) -> Option<(f64, [f64; 3])> {
    let w = TAU * freq;
    let mut ata = [[0.0; 3]; 3];
    let mut atb = [0.0; 3];
    for (&y, &t) in samples.iter().zip(times) {
        let (s, co) = (w * t).sin_cos();
        let row = [s, co, 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
            atb[i] += row[i] * y;
        }
    }
    let coeffs = solve(ata, atb)?;

    let sse = samples
        .iter()
        .zip(times)
        .map(|(&y, &t)| {
            let (s, co) = (w * t).sin_cos();
            let r = y - (coeffs[0] * s + coeffs[1] * co + coeffs[2]);
            r * r
        })
        .sum();
    Some((sse, coeffs))
}

fn sum_squares(samples: &[f64], times: &[f64], p: &[f64; 4]) -> f64 {
    samples
        .iter()
        .zip(times)
        .map(|(&y, &t)| {
            let r = y - (p[0] * (TAU * p[1] * t + p[2]).sin() + p[3]);
            r * r
        })
        .sum()
}

/// Levenberg-Marquardt on `[A, f, phi, c]`.
fn refine(
    samples: &[f64],
    times: &[f64],
    initial: [f64; 4],
    initial_sse: f64,
    max_iterations: usize,
) -> ([f64; 4], f64) {
    let mut p = initial;
    let mut sse = initial_sse;
    let mut lambda = 1e-3;

    for _ in 0..max_iterations {
        let mut jtj = [[0.0; 4]; 4];
        let mut jtr = [0.0; 4];
        for (&y, &t) in samples.iter().zip(times) {
            let (s, co) = (TAU * p[1] * t + p[2]).sin_cos();
            let r = y - (p[0] * s + p[3]);
            let row = [s, p[0] * co * TAU * t, p[0] * co, 1.0];
            for i in 0..4 {
                for j in 0..4 {
                    jtj[i][j] += row[i] * row[j];
                }
                jtr[i] += row[i] * r;
            }
        }

        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * jtj[i][i].max(f64::MIN_POSITIVE);
            }
            let Some(delta) = solve(damped, jtr) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = [p[0] + delta[0], p[1] + delta[1], p[2] + delta[2], p[3] + delta[3]];
            let candidate_sse = sum_squares(samples, times, &candidate);
            if candidate_sse < sse {
                let gain = (sse - candidate_sse) / sse.max(f64::MIN_POSITIVE);
                p = candidate;
                sse = candidate_sse;
                lambda = (lambda * 0.3).max(1e-12);
                improved = gain > 1e-12;
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }

    (p, sse)
}

/// Gaussian elimination with partial pivoting.
fn solve<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 6103.515625;

    #[test]
    fn test_solve() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let x = solve(a, [3.0, 5.0, 5.0]).unwrap();
        for v in x {
            assert!((v - 1.0).abs() < 1e-12);
        }
        assert!(solve([[1.0, 2.0], [2.0, 4.0]], [1.0, 2.0]).is_none());
    }

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_phase(-0.5) + 0.5).abs() < 1e-12);
        assert!((wrap_phase(TAU + 0.25) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_fit_recovers_parameters() {
        let truth = SineParams {
            amplitude: 0.8,
            frequency: 500.37,
            phase: 1.1,
            offset: 0.2,
        };
        let start = 2_000;
        let t0 = start as f64 / FS;
        let samples: Vec<f64> = (start..start + 10_000)
            .map(|i| truth.value_at(i as f64 / FS) + 0.02 * (i as f64 * 1.618_034).sin())
            .collect();

        let fit = fit_sinusoid(&samples, FS, t0, 500.0, FitOptions::default()).unwrap();
        assert!((fit.frequency - truth.frequency).abs() < 1e-3, "{fit:?}");
        assert!((fit.amplitude - truth.amplitude).abs() < 5e-3, "{fit:?}");
        assert!((fit.offset - truth.offset).abs() < 5e-3, "{fit:?}");

        // Same waveform on the absolute clock
        for i in [0usize, 1_000, 9_999] {
            let t = (start + i) as f64 / FS;
            assert!((fit.value_at(t) - truth.value_at(t)).abs() < 0.02);
        }
    }

    #[test]
    fn test_unit_reference() {
        let params = SineParams {
            amplitude: 3.0,
            frequency: 10.0,
            phase: 0.0,
            offset: 1.0,
        };
        let in_phase = params.unit_reference(100, 1000.0, 0.0);
        let quadrature = params.unit_reference(100, 1000.0, PI / 2.0);
        for (i, (x, y)) in in_phase.iter().zip(&quadrature).enumerate() {
            assert!((x * x + y * y - 1.0).abs() < 1e-12);
            let expected = (TAU * 10.0 * i as f64 / 1000.0).sin();
            assert!((x - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            fit_sinusoid(&[0.0; 4], FS, 0.0, 500.0, FitOptions::default()),
            Err(ProcessingError::InsufficientData { .. })
        ));
    }
}
