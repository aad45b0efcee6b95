//! Cross-stream trial alignment
//!
//! The photometry and behavior systems run on independent clocks. Both see
//! the trial-start handshake, so each stream yields a sequence of trial
//! start indices. The per-trial durations of the two streams are identical
//! up to the clock ratio once the streams are shifted by the right number
//! of trials; that shift is found by maximizing the Pearson correlation of
//! the duration sequences. The photometry traces are then trimmed to the
//! overlapping trials and resampled onto the exact behavior sample count.

use std::ops::Range;

use tracing::{debug, info};

use super::resample::resample_fourier;
use crate::error::{ProcessingError, ProcessingResult};

/// Largest trial shift searched in either direction
pub const MAX_TRIAL_OFFSET: i32 = 30;

/// Duration correlation required to accept an alignment
pub const MIN_CORRELATION: f64 = 0.99999;

/// Fewest trial durations an offset must compare to be considered
pub const MIN_COMPARED_TRIALS: usize = 10;

/// Trial start indices of one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrialBoundaries {
    starts: Vec<usize>,
    stream_len: usize,
}

impl TrialBoundaries {
    /// Create from strictly increasing start indices within a stream of
    /// `stream_len` samples.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::InvalidParameter`] when the starts are not
    /// strictly increasing or reach past the end of the stream.
    pub fn new(starts: Vec<usize>, stream_len: usize) -> ProcessingResult<Self> {
        if starts.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ProcessingError::invalid_parameter(
                "trial_starts",
                "trial starts must be strictly increasing",
            ));
        }
        if starts.last().is_some_and(|&last| last >= stream_len) {
            return Err(ProcessingError::invalid_parameter(
                "trial_starts",
                format!("trial start beyond stream of {stream_len} samples"),
            ));
        }
        Ok(Self { starts, stream_len })
    }

    /// Start index of every trial
    #[must_use]
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    /// Number of trials
    #[must_use]
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Whether no trial was found
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Trial lengths in samples. The last trial runs to the end of the
    /// stream.
    #[must_use]
    pub fn durations(&self) -> Vec<f64> {
        let mut durations: Vec<f64> = self.starts.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        if let Some(&last) = self.starts.last() {
            durations.push((self.stream_len - last) as f64);
        }
        durations
    }
}

/// Pearson correlation coefficient. `NaN` when either input is constant or
/// the lengths differ.
#[must_use]
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return f64::NAN;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return f64::NAN;
    }
    cov / (var_a * var_b).sqrt()
}

/// Chosen trial shift between the streams.
///
/// A positive offset means behavior trial `offset_trials` coincides with
/// photometry trial 0 (behavior started first).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrialOffset {
    /// Trial shift
    pub offset_trials: i32,
    /// Duration correlation at that shift
    pub correlation: f64,
}

/// Photometry traces aligned onto the behavior stream.
#[derive(Clone, Debug)]
pub struct AlignmentResult {
    /// Trial shift between the streams
    pub offset_trials: i32,
    /// Duration correlation at the chosen shift
    pub correlation: f64,
    /// Behavior clock time of the first retained behavior sample (s)
    pub time_offset: f64,
    /// Retained behavior samples
    pub behavior_span: Range<usize>,
    /// Retained photometry samples
    pub photometry_span: Range<usize>,
    /// Resampled traces, each `behavior_span.len()` samples long
    pub traces: Vec<Vec<f64>>,
}

/// Trial-duration aligner for two independently clocked streams.
#[derive(Clone, Copy, Debug)]
pub struct StreamAligner {
    behavior_rate: f64,
    max_offset: i32,
    min_correlation: f64,
}

impl StreamAligner {
    /// Create an aligner for a behavior stream sampled at `behavior_rate` Hz
    #[must_use]
    pub fn new(behavior_rate: f64) -> Self {
        Self {
            behavior_rate,
            max_offset: MAX_TRIAL_OFFSET,
            min_correlation: MIN_CORRELATION,
        }
    }

    /// Override the acceptance threshold
    #[must_use]
    pub fn with_min_correlation(mut self, min_correlation: f64) -> Self {
        self.min_correlation = min_correlation;
        self
    }

    /// Number of trials compared: one less than the shorter stream, since
    /// the last trial of each stream is cut short by the recording end.
    fn compared_trials(photometry: &TrialBoundaries, behavior: &TrialBoundaries) -> usize {
        photometry.len().min(behavior.len()).saturating_sub(1)
    }

    /// Correlate shifted duration sequences for every offset in
    /// `-30..=30` and keep the best. Offsets that leave fewer than
    /// [`MIN_COMPARED_TRIALS`] overlapping durations are skipped.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::Alignment`] when no offset compares enough trials
    /// with a defined correlation, or the best one does not exceed the
    /// threshold.
    pub fn find_offset(
        &self,
        photometry: &TrialBoundaries,
        behavior: &TrialBoundaries,
    ) -> ProcessingResult<TrialOffset> {
        let shorter = Self::compared_trials(photometry, behavior);
        let photo_durations = photometry.durations();
        let behavior_durations = behavior.durations();

        let mut best: Option<TrialOffset> = None;
        for k in -self.max_offset..=self.max_offset {
            let shift = k.unsigned_abs() as usize;
            let correlation = if shift + MIN_COMPARED_TRIALS > shorter {
                f64::NAN
            } else if k < 0 {
                pearson(&photo_durations[shift..shorter], &behavior_durations[..shorter - shift])
            } else {
                pearson(&photo_durations[..shorter - shift], &behavior_durations[shift..shorter])
            };
            debug!(offset = k, correlation, "Trial duration correlation");

            if correlation.is_nan() {
                continue;
            }
            if best.map_or(true, |b| correlation > b.correlation) {
                best = Some(TrialOffset {
                    offset_trials: k,
                    correlation,
                });
            }
        }

        let best = best.ok_or_else(|| {
            ProcessingError::alignment(format!(
                "no trial offset compares at least {MIN_COMPARED_TRIALS} trials with a defined \
                 correlation ({} photometry / {} behavior trials)",
                photometry.len(),
                behavior.len()
            ))
        })?;
        if !(best.correlation > self.min_correlation) {
            return Err(ProcessingError::alignment(format!(
                "best trial offset {} has correlation {:.6}, below {}",
                best.offset_trials, best.correlation, self.min_correlation
            )));
        }
        Ok(best)
    }

    /// Find the trial offset, trim both streams to the overlapping trials
    /// and resample every photometry trace onto the trimmed behavior
    /// length.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::Alignment`] as for [`find_offset`](Self::find_offset),
    /// or when a trace is shorter than the photometry span.
    pub fn align(
        &self,
        photometry: &TrialBoundaries,
        behavior: &TrialBoundaries,
        traces: &[&[f64]],
    ) -> ProcessingResult<AlignmentResult> {
        let offset = self.find_offset(photometry, behavior)?;
        let shorter = Self::compared_trials(photometry, behavior);
        let k = offset.offset_trials;
        let photo_skip = usize::try_from((-k).max(0)).unwrap_or(0);
        let behavior_skip = usize::try_from(k.max(0)).unwrap_or(0);

        let p = photometry.starts();
        let b = behavior.starts();
        let photometry_span = p[photo_skip]..p[shorter - behavior_skip];
        let behavior_span = b[behavior_skip]..b[shorter - photo_skip];

        let target = behavior_span.len();
        let traces = traces
            .iter()
            .map(|trace| {
                trace
                    .get(photometry_span.clone())
                    .map(|segment| resample_fourier(segment, target))
                    .ok_or_else(|| {
                        ProcessingError::alignment(format!(
                            "trace of {} samples does not cover photometry span {photometry_span:?}",
                            trace.len()
                        ))
                    })
            })
            .collect::<ProcessingResult<Vec<_>>>()?;

        let time_offset = behavior_span.start as f64 / self.behavior_rate;
        info!(
            offset_trials = k,
            correlation = offset.correlation,
            time_offset,
            photometry_samples = photometry_span.len(),
            behavior_samples = target,
            "Aligned photometry to behavior"
        );

        Ok(AlignmentResult {
            offset_trials: k,
            correlation: offset.correlation,
            time_offset,
            behavior_span,
            photometry_span,
            traces,
        })
    }
}
