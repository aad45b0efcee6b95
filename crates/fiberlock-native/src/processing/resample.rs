//! Sample-rate conversion
//!
//! Polyphase resampling by an exact rational factor (preferred) and Fourier
//! resampling to an exact sample count. `NaN` inputs are zero-filled first.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use super::fft::kaiser_window;
use crate::error::{ProcessingError, ProcessingResult};

/// Resampling algorithm
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    /// Kaiser-windowed FIR applied in polyphase form
    #[default]
    Polyphase,
    /// Zero-padding or truncation in the frequency domain
    Fourier,
}

/// Largest denominator accepted for the rational rate ratio.
const MAX_DENOMINATOR: u128 = 1_000_000;

/// Kaiser shape parameter of the polyphase anti-aliasing filter.
const KAISER_BETA: f64 = 5.0;

/// Resample `trace` from `src_rate` to `dst_rate` Hz.
///
/// # Errors
///
/// Returns [`ProcessingError::InvalidParameter`] for non-positive rates or a
/// ratio with no rational approximation.
pub fn resample(
    trace: &[f64],
    src_rate: f64,
    dst_rate: f64,
    method: ResampleMethod,
) -> ProcessingResult<Vec<f64>> {
    if !(src_rate > 0.0) || !(dst_rate > 0.0) {
        return Err(ProcessingError::invalid_parameter(
            "sample_rate",
            format!("rates must be positive, got {src_rate} -> {dst_rate} Hz"),
        ));
    }
    let clean = zero_fill(trace);

    match method {
        ResampleMethod::Polyphase => {
            let (up, down) = rational_ratio(dst_rate / src_rate).ok_or_else(|| {
                ProcessingError::invalid_parameter(
                    "sample_rate",
                    format!("no rational approximation for {dst_rate} / {src_rate}"),
                )
            })?;
            Ok(resample_poly(&clean, up, down))
        }
        ResampleMethod::Fourier => {
            let num = (clean.len() as f64 * dst_rate / src_rate) as usize;
            Ok(resample_fourier(&clean, num))
        }
    }
}

fn zero_fill(trace: &[f64]) -> Vec<f64> {
    trace.iter().map(|&x| if x.is_nan() { 0.0 } else { x }).collect()
}

/// Resample to exactly `num` samples by Fourier-domain truncation or zero
/// padding. The signal is treated as periodic. `NaN`s are zero-filled.
#[must_use]
pub fn resample_fourier(trace: &[f64], num: usize) -> Vec<f64> {
    let nx = trace.len();
    if nx == 0 || num == 0 {
        return vec![0.0; num];
    }
    if num == nx {
        return zero_fill(trace);
    }

    let mut planner = FftPlanner::<f64>::new();
    let mut spectrum: Vec<Complex<f64>> = trace
        .iter()
        .map(|&x| Complex::new(if x.is_nan() { 0.0 } else { x }, 0.0))
        .collect();
    planner.plan_fft_forward(nx).process(&mut spectrum);

    // One-sided spectrum at the new length
    let n = num.min(nx);
    let nyq = n / 2 + 1;
    let mut half = vec![Complex::new(0.0, 0.0); num / 2 + 1];
    half[..nyq].copy_from_slice(&spectrum[..nyq]);
    if n % 2 == 0 {
        if num < nx {
            half[n / 2] *= 2.0;
        } else {
            half[n / 2] *= 0.5;
        }
    }

    // Hermitian extension; DC and Nyquist are real
    let mut full = vec![Complex::new(0.0, 0.0); num];
    full[0] = Complex::new(half[0].re, 0.0);
    for k in 1..half.len() {
        if 2 * k == num {
            full[k] = Complex::new(half[k].re, 0.0);
        } else {
            full[k] = half[k];
            full[num - k] = half[k].conj();
        }
    }
    planner.plan_fft_inverse(num).process(&mut full);

    let scale = 1.0 / nx as f64;
    full.iter().map(|c| c.re * scale).collect()
}

/// Upsample by `up`, low-pass filter, and downsample by `down`.
///
/// The anti-aliasing filter is a Kaiser-windowed sinc (beta 5) with
/// `20 * max(up, down) + 1` taps and cutoff at the lower of the two
/// Nyquist rates. Output length is `ceil(len * up / down)` and the output
/// is aligned with the input (no group delay).
#[must_use]
pub fn resample_poly(trace: &[f64], up: usize, down: usize) -> Vec<f64> {
    let g = gcd(up as u128, down as u128) as usize;
    let (up, down) = (up / g.max(1), down / g.max(1));
    if up == down || trace.is_empty() {
        return zero_fill(trace);
    }

    let n_in = trace.len();
    let n_out = (n_in * up).div_ceil(down);
    let max_rate = up.max(down);
    let half_len = 10 * max_rate;
    let h = lowpass_fir(2 * half_len + 1, 1.0 / max_rate as f64, up as f64);

    let (up_i, down_i, half_i) = (up as i64, down as i64, half_len as i64);
    let last = n_in as i64 - 1;
    (0..n_out as i64)
        .map(|m| {
            let centre = half_i + m * down_i;
            // Taps with index centre - n * up inside [0, 2 * half_len]
            let n_lo = (centre - 2 * half_i + up_i - 1).div_euclid(up_i).max(0);
            let n_hi = centre.div_euclid(up_i).min(last);
            (n_lo..=n_hi)
                .map(|n| {
                    let x = trace[n as usize];
                    if x.is_nan() {
                        0.0
                    } else {
                        x * h[(centre - n * up_i) as usize]
                    }
                })
                .sum()
        })
        .collect()
}

/// Windowed-sinc low-pass with cutoff `cutoff` (fraction of Nyquist),
/// normalized to unit DC gain and then scaled by `gain`.
fn lowpass_fir(numtaps: usize, cutoff: f64, gain: f64) -> Vec<f64> {
    let alpha = (numtaps - 1) as f64 / 2.0;
    let window = kaiser_window(numtaps, KAISER_BETA);
    let mut h: Vec<f64> = window
        .iter()
        .enumerate()
        .map(|(i, w)| cutoff * sinc(cutoff * (i as f64 - alpha)) * w)
        .collect();
    let sum: f64 = h.iter().sum();
    for tap in &mut h {
        *tap *= gain / sum;
    }
    h
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Closest fraction `p / q` to `x` with `q <= 1e6`, found from the exact
/// binary value of `x` by continued fractions.
#[must_use]
pub fn rational_ratio(x: f64) -> Option<(usize, usize)> {
    if !(x > 0.0) || !x.is_finite() {
        return None;
    }
    let (num, den) = exact_fraction(x)?;
    if den <= MAX_DENOMINATOR {
        return Some((usize::try_from(num).ok()?, usize::try_from(den).ok()?));
    }

    let (mut p0, mut q0, mut p1, mut q1) = (0u128, 1u128, 1u128, 0u128);
    let (mut n, mut d) = (num, den);
    loop {
        let a = n / d;
        let Some(q2) = a.checked_mul(q1).and_then(|v| v.checked_add(q0)) else {
            break;
        };
        if q2 > MAX_DENOMINATOR {
            break;
        }
        let p2 = a.checked_mul(p1)?.checked_add(p0)?;
        (p0, q0, p1, q1) = (p1, q1, p2, q2);
        (n, d) = (d, n - a * d);
        if d == 0 {
            break;
        }
    }

    let k = (MAX_DENOMINATOR - q0) / q1;
    let bound1 = (p0 + k * p1, q0 + k * q1);
    let bound2 = (p1, q1);
    let err = |(p, q): (u128, u128)| (p as f64 / q as f64 - x).abs();
    let (p, q) = if err(bound2) <= err(bound1) { bound2 } else { bound1 };
    if p == 0 {
        return None;
    }
    Some((usize::try_from(p).ok()?, usize::try_from(q).ok()?))
}

/// Exact `num / den` of a positive finite float, reduced.
fn exact_fraction(x: f64) -> Option<(u128, u128)> {
    let bits = x.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mantissa, exp) = if exponent == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), exponent - 1075)
    };
    let mantissa = u128::from(mantissa);

    let (num, den) = if exp >= 0 {
        if exp > 70 {
            return None;
        }
        (mantissa << exp, 1u128)
    } else {
        let shift = -exp;
        if shift > 126 {
            return None;
        }
        (mantissa, 1u128 << shift)
    };
    let g = gcd(num, den);
    Some((num / g, den / g))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rational_ratio() {
        assert_eq!(rational_ratio(600.0 / 6103.515625), Some((1536, 15625)));
        assert_eq!(rational_ratio(0.5), Some((1, 2)));
        assert_eq!(rational_ratio(1.0 / 3.0), Some((1, 3)));
        assert_eq!(rational_ratio(50.0 / 200.0), Some((1, 4)));
        assert_eq!(rational_ratio(0.0), None);
    }

    #[test]
    fn test_poly_output_length() {
        let x = vec![1.0; 1000];
        assert_eq!(resample_poly(&x, 1, 4).len(), 250);
        assert_eq!(resample_poly(&x, 2, 3).len(), 667);
        assert_eq!(resample_poly(&x, 3, 1).len(), 3000);
    }

    #[test]
    fn test_poly_preserves_slow_sine() {
        let fs = 1000.0;
        let x: Vec<f64> = (0..4000)
            .map(|i| (2.0 * std::f64::consts::PI * 2.0 * i as f64 / fs).sin())
            .collect();
        let y = resample(&x, fs, 250.0, ResampleMethod::Polyphase).unwrap();
        assert_eq!(y.len(), 1000);
        // Away from the edges the 2 Hz tone is reproduced at the new rate
        for (m, value) in y.iter().enumerate().skip(50).take(900) {
            let expected = (2.0 * std::f64::consts::PI * 2.0 * m as f64 / 250.0).sin();
            assert!((value - expected).abs() < 5e-3, "sample {m}");
        }
    }

    #[test]
    fn test_poly_zero_fills_nan() {
        let mut x = vec![1.0; 400];
        x[200] = f64::NAN;
        let y = resample_poly(&x, 1, 2);
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_fourier_exact_length_and_tone() {
        let n = 300;
        let x: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 3.0 * i as f64 / n as f64).cos())
            .collect();
        for num in [200, 450] {
            let y = resample_fourier(&x, num);
            assert_eq!(y.len(), num);
            for (m, value) in y.iter().enumerate() {
                let expected = (2.0 * std::f64::consts::PI * 3.0 * m as f64 / num as f64).cos();
                assert!((value - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_invalid_rates() {
        assert!(resample(&[1.0, 2.0], 0.0, 10.0, ResampleMethod::Fourier).is_err());
    }
}
