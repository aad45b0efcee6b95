//! Trace normalization
//!
//! Centered rolling z-score (the detrend step), full-distribution z-score
//! and rolling min-max scaling.
//!
//! A centered window of `w` samples around index `i` covers
//! `i - w/2 ..= i - w/2 + w - 1`. Windows that do not fit inside the trace
//! are incomplete; a window containing `NaN` yields `NaN`.

use std::collections::VecDeque;

/// Centered rolling z-score with sample standard deviation (ddof 1).
///
/// The first and last `window / 2` samples are set to zero. A window with
/// zero spread yields zero. Traces shorter than the window come back all
/// zero.
#[must_use]
pub fn rolling_zscore(trace: &[f64], window: usize) -> Vec<f64> {
    let n = trace.len();
    let half = window / 2;
    let mut out = vec![0.0; n];
    if window < 2 || n < window {
        return out;
    }

    // Running sums around the global mean keep cancellation small
    let finite: Vec<f64> = trace.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return out;
    }
    let center = finite.iter().sum::<f64>() / finite.len() as f64;
    let spread = (finite.iter().map(|v| (v - center).powi(2)).sum::<f64>() / finite.len() as f64).sqrt();

    let mut moments = RunningMoments::new(center);
    for &v in &trace[..window] {
        moments.add(v);
    }

    // Window starting at `start` is centred on `start + half`
    for start in 0..=n - window {
        if start > 0 {
            moments.remove(trace[start - 1]);
            moments.add(trace[start + window - 1]);
        }
        let i = start + half;
        out[i] = match moments.mean_std(window) {
            _ if trace[i].is_nan() => f64::NAN,
            None => f64::NAN,
            Some((mean, std)) if std > 1e-12 * spread => (trace[i] - mean) / std,
            Some(_) => 0.0,
        };
    }

    out[..half].fill(0.0);
    out[n - half..].fill(0.0);
    out
}

/// Window sums of deviations from a fixed centre.
struct RunningMoments {
    center: f64,
    sum: f64,
    sum_sq: f64,
    nans: usize,
}

impl RunningMoments {
    fn new(center: f64) -> Self {
        Self { center, sum: 0.0, sum_sq: 0.0, nans: 0 }
    }

    fn add(&mut self, v: f64) {
        if v.is_nan() {
            self.nans += 1;
        } else {
            let d = v - self.center;
            self.sum += d;
            self.sum_sq += d * d;
        }
    }

    fn remove(&mut self, v: f64) {
        if v.is_nan() {
            self.nans -= 1;
        } else {
            let d = v - self.center;
            self.sum -= d;
            self.sum_sq -= d * d;
        }
    }

    /// Mean and sample standard deviation, `None` while a `NaN` is inside.
    fn mean_std(&self, window: usize) -> Option<(f64, f64)> {
        if self.nans > 0 {
            return None;
        }
        let w = window as f64;
        let var = ((self.sum_sq - self.sum * self.sum / w) / (w - 1.0)).max(0.0);
        Some((self.center + self.sum / w, var.sqrt()))
    }
}

/// Z-score against the whole trace (ddof 1), ignoring `NaN`s.
///
/// A constant trace maps to zeros.
#[must_use]
pub fn zscore(trace: &[f64]) -> Vec<f64> {
    let finite: Vec<f64> = trace.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.len() < 2 {
        return trace.iter().map(|v| if v.is_nan() { f64::NAN } else { 0.0 }).collect();
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std = (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();

    trace
        .iter()
        .map(|&v| {
            if v.is_nan() {
                f64::NAN
            } else if std > 0.0 {
                (v - mean) / std
            } else {
                0.0
            }
        })
        .collect()
}

/// Centered rolling min-max scaling to `[0, 1]`.
///
/// Samples whose window is incomplete or contains `NaN` are `NaN`; a flat
/// window yields `NaN` as well.
#[must_use]
pub fn rolling_minmax(trace: &[f64], window: usize) -> Vec<f64> {
    let n = trace.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    let half = window / 2;

    // Monotonic deques of indices
    let mut lows: VecDeque<usize> = VecDeque::new();
    let mut highs: VecDeque<usize> = VecDeque::new();
    let mut last_nan: Option<usize> = None;

    for end in 0..n {
        let v = trace[end];
        if v.is_nan() {
            last_nan = Some(end);
        } else {
            while lows.back().is_some_and(|&j| trace[j] >= v) {
                lows.pop_back();
            }
            lows.push_back(end);
            while highs.back().is_some_and(|&j| trace[j] <= v) {
                highs.pop_back();
            }
            highs.push_back(end);
        }
        if end + 1 < window {
            continue;
        }

        let start = end + 1 - window;
        while lows.front().is_some_and(|&j| j < start) {
            lows.pop_front();
        }
        while highs.front().is_some_and(|&j| j < start) {
            highs.pop_front();
        }
        if last_nan.is_some_and(|j| j >= start) {
            continue;
        }
        if let (Some(&lo), Some(&hi)) = (lows.front(), highs.front()) {
            let range = trace[hi] - trace[lo];
            let i = start + half;
            if range > 0.0 {
                out[i] = (trace[i] - trace[lo]) / range;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Naive reference for the rolling z-score interior
    fn naive(trace: &[f64], window: usize, i: usize) -> f64 {
        let start = i - window / 2;
        let slice = &trace[start..start + window];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0);
        (trace[i] - mean) / var.sqrt()
    }

    fn ramp_with_wiggle(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 0.01 * i as f64 + (i as f64 * 0.37).sin()).collect()
    }

    #[test]
    fn test_rolling_zscore_edges_are_zero() {
        for window in [10, 11] {
            let x = ramp_with_wiggle(200);
            let z = rolling_zscore(&x, window);
            assert_eq!(z.len(), 200);
            assert!(z[..window / 2].iter().all(|&v| v == 0.0));
            assert!(z[200 - window / 2..].iter().all(|&v| v == 0.0));
            assert!(z[window / 2] != 0.0);
        }
    }

    #[test]
    fn test_rolling_zscore_matches_naive() {
        let x = ramp_with_wiggle(500);
        for window in [20, 33] {
            let z = rolling_zscore(&x, window);
            for i in window / 2..500 - window / 2 {
                assert!((z[i] - naive(&x, window, i)).abs() < 1e-9, "window {window}, sample {i}");
            }
        }
    }

    #[test]
    fn test_rolling_zscore_flat_and_short() {
        let z = rolling_zscore(&[5.0; 50], 10);
        assert!(z.iter().all(|&v| v == 0.0));

        let z = rolling_zscore(&[1.0, 2.0, 3.0], 10);
        assert_eq!(z, vec![0.0; 3]);
    }

    #[test]
    fn test_rolling_zscore_nan_window() {
        let mut x = ramp_with_wiggle(100);
        x[50] = f64::NAN;
        let z = rolling_zscore(&x, 10);
        assert!(z[50].is_nan());
        assert!(z[46].is_nan());
        assert!(z[54].is_nan());
        assert!(z[40].is_finite());
        assert!(z[60].is_finite());
    }

    #[test]
    fn test_zscore() {
        let z = zscore(&[1.0, 2.0, 3.0, f64::NAN]);
        assert!((z[0] + 1.0).abs() < 1e-12);
        assert!(z[1].abs() < 1e-12);
        assert!((z[2] - 1.0).abs() < 1e-12);
        assert!(z[3].is_nan());

        assert_eq!(zscore(&[2.0; 4]), vec![0.0; 4]);
    }

    #[test]
    fn test_rolling_minmax() {
        let x = [0.0, 4.0, 2.0, 8.0, 6.0, 1.0];
        let y = rolling_minmax(&x, 3);
        assert!(y[0].is_nan());
        assert!((y[1] - 1.0).abs() < 1e-12);
        assert!(y[2].abs() < 1e-12);
        assert!((y[3] - 1.0).abs() < 1e-12);
        assert!((y[4] - 5.0 / 7.0).abs() < 1e-12);
        assert!(y[5].is_nan());
    }
}
