//! Behavior stream handling
//!
//! The behavior system exports two CSV files per session:
//! - `{subject}_analog_filled.csv`: one row per behavior sample with the
//!   task state columns (`nTrial`, `ENL`, `Cue`, `ENLP`, `nENL`, ...)
//! - `{subject}_behavior_df_full.csv`: one row per trial with the event
//!   counts (`n_ENL`, `n_Cue`) used to split penalty states
//!
//! This module loads them into column-oriented [`Frame`]s, extracts trial
//! landmarks from both streams, and applies the post-alignment labelling
//! and binning.

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use fiberlock_core::Handshake;
use tracing::{debug, info};

use super::align::TrialBoundaries;
use crate::error::{ProcessingError, ProcessingResult};

/// Trial number column
pub const TRIAL_COLUMN: &str = "nTrial";
/// Trial enable line of the behavior stream
pub const ENABLE_COLUMN: &str = "ENL";
/// Behavior clock column added on load (s)
pub const SESSION_CLOCK_COLUMN: &str = "session_clock";
/// Elapsed time within the trial (s)
pub const TRIAL_CLOCK_COLUMN: &str = "trial_clock";

/// Penalty states split after alignment
pub const PENALTY_STATES: [&str; 2] = ["ENLP", "CueP"];

// ============================================================================
// Frames
// ============================================================================

/// How a column is aggregated when binned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    /// State or counter; bins take the maximum
    Discrete,
    /// Sampled signal; bins take the mean
    Continuous,
}

/// A named column of a [`Frame`].
#[derive(Clone, Debug)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Aggregation kind
    pub kind: ColumnKind,
    /// Values; missing entries are `NaN`
    pub values: Vec<f64>,
}

/// Column-oriented table with equal-length numeric columns.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    len: usize,
    columns: Vec<Column>,
}

impl Frame {
    /// Empty frame with `len` rows and no columns
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self { len, columns: Vec::new() }
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the frame has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All columns in insertion order
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Values of a column
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    /// Values of a column that must exist.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::MissingChannel`] naming the column.
    pub fn require(&self, name: &str) -> ProcessingResult<&[f64]> {
        self.column(name).ok_or_else(|| ProcessingError::MissingChannel {
            name: name.to_string(),
        })
    }

    /// Add a column, replacing any column of the same name.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::InvalidParameter`] when the length differs from
    /// the frame.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        kind: ColumnKind,
        values: Vec<f64>,
    ) -> ProcessingResult<()> {
        let name = name.into();
        if values.len() != self.len {
            return Err(ProcessingError::invalid_parameter(
                "column",
                format!("{name} has {} rows, frame has {}", values.len(), self.len),
            ));
        }
        let column = Column { name, kind, values };
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    /// Copy of a row range
    #[must_use]
    pub fn slice(&self, rows: Range<usize>) -> Self {
        let end = rows.end.min(self.len);
        let start = rows.start.min(end);
        Self {
            len: end - start,
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    kind: c.kind,
                    values: c.values[start..end].to_vec(),
                })
                .collect(),
        }
    }

    /// Read a CSV file with a header row. A leading unnamed column (a
    /// written row index) is skipped. All columns are [`ColumnKind::Discrete`].
    ///
    /// # Errors
    ///
    /// [`ProcessingError::MissingFile`] when the path does not exist, and
    /// CSV decoding errors.
    pub fn read_csv(path: &Path) -> ProcessingResult<Self> {
        if !path.exists() {
            return Err(ProcessingError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let frame = Self::from_reader(std::fs::File::open(path)?)?;
        debug!(path = %path.display(), rows = frame.len(), columns = frame.columns.len(), "Read CSV");
        Ok(frame)
    }

    /// Read CSV text from any reader. See [`read_csv`](Self::read_csv).
    ///
    /// # Errors
    ///
    /// CSV decoding errors.
    pub fn from_reader<R: io::Read>(reader: R) -> ProcessingResult<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let skip_index = headers.first().is_some_and(String::is_empty);

        let mut values: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record = record?;
            for (idx, column) in values.iter_mut().enumerate() {
                column.push(parse_cell(record.get(idx).unwrap_or("")));
            }
        }

        let len = values.first().map_or(0, Vec::len);
        let columns = headers
            .into_iter()
            .zip(values)
            .skip(usize::from(skip_index))
            .map(|(name, values)| Column {
                name,
                kind: ColumnKind::Discrete,
                values,
            })
            .collect();
        Ok(Self { len, columns })
    }
}

/// Numeric value of a CSV cell. Booleans map to 0/1, anything else that
/// does not parse is `NaN`.
fn parse_cell(cell: &str) -> f64 {
    let cell = cell.trim();
    match cell {
        "True" | "true" => 1.0,
        "False" | "false" => 0.0,
        _ => cell.parse().unwrap_or(f64::NAN),
    }
}

/// Integer key of a trial number; `None` for missing values.
fn trial_key(value: f64) -> Option<i64> {
    value.is_finite().then(|| value.round() as i64)
}

// ============================================================================
// Behavior files
// ============================================================================

/// Both behavior files of one session.
#[derive(Clone, Debug)]
pub struct BehaviorData {
    /// Per-sample state stream with a `session_clock` column
    pub analog: Frame,
    /// Per-trial log
    pub trials: Frame,
    /// Behavior sample rate (Hz)
    pub sample_rate: f64,
}

impl BehaviorData {
    /// Path of the per-sample stream
    #[must_use]
    pub fn analog_path(dir: &Path, subject: &str) -> PathBuf {
        dir.join(format!("{subject}_analog_filled.csv"))
    }

    /// Path of the per-trial log
    #[must_use]
    pub fn trials_path(dir: &Path, subject: &str) -> PathBuf {
        dir.join(format!("{subject}_behavior_df_full.csv"))
    }

    /// Load both files from a behavior directory.
    ///
    /// Both files must exist before either is read.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::MissingFile`] for the first absent file, and CSV
    /// decoding errors.
    pub fn load(dir: &Path, subject: &str, sample_rate: f64) -> ProcessingResult<Self> {
        let analog_path = Self::analog_path(dir, subject);
        let trials_path = Self::trials_path(dir, subject);
        for path in [&analog_path, &trials_path] {
            if !path.exists() {
                return Err(ProcessingError::MissingFile { path: path.clone() });
            }
        }

        let analog = Frame::read_csv(&analog_path)?;
        let trials = Frame::read_csv(&trials_path)?;
        info!(
            subject,
            samples = analog.len(),
            trials = trials.len(),
            "Loaded behavior data"
        );
        Self::from_frames(analog, trials, sample_rate)
    }

    /// Wrap frames already in memory and add the session clock.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::InvalidParameter`] for a non-positive rate.
    pub fn from_frames(mut analog: Frame, trials: Frame, sample_rate: f64) -> ProcessingResult<Self> {
        if !(sample_rate > 0.0) {
            return Err(ProcessingError::invalid_parameter(
                "behavior_sampling",
                format!("{sample_rate} Hz must be positive"),
            ));
        }
        let clock = (0..analog.len()).map(|i| i as f64 / sample_rate).collect();
        analog.insert(SESSION_CLOCK_COLUMN, ColumnKind::Discrete, clock)?;
        Ok(Self {
            analog,
            trials,
            sample_rate,
        })
    }
}

// ============================================================================
// Trial landmarks
// ============================================================================

/// Trial starts of the behavior stream: the first high `ENL` sample of each
/// trial number.
///
/// # Errors
///
/// [`ProcessingError::MissingChannel`] without `nTrial` or `ENL`.
pub fn behavior_trial_starts(analog: &Frame) -> ProcessingResult<TrialBoundaries> {
    let trials = analog.require(TRIAL_COLUMN)?;
    let enable = analog.require(ENABLE_COLUMN)?;

    let mut seen = HashSet::new();
    let starts = trials
        .iter()
        .zip(enable)
        .enumerate()
        .filter(|(_, (_, &enl))| enl > 0.5)
        .filter_map(|(i, (&trial, _))| trial_key(trial).map(|key| (i, key)))
        .filter(|&(_, key)| seen.insert(key))
        .map(|(i, _)| i)
        .collect();
    TrialBoundaries::new(starts, analog.len())
}

/// First photometry sample after the handshake: the first `toBehSys` high
/// sample, then the first `fromBehSys` low sample at or after it.
#[must_use]
pub fn handshake_start(handshake: &Handshake) -> Option<usize> {
    let len = handshake.len();
    let sending = handshake.to_behavior[..len].iter().position(|&v| v)?;
    handshake.from_behavior[sending..len]
        .iter()
        .position(|&v| !v)
        .map(|i| sending + i)
}

/// Trial starts of a handshake-trimmed photometry stream: sample 0 and every
/// falling edge of `fromBehSys`.
///
/// # Errors
///
/// [`ProcessingError::InsufficientData`] for an empty stream.
pub fn photometry_trial_starts(from_behavior: &[bool]) -> ProcessingResult<TrialBoundaries> {
    if from_behavior.is_empty() {
        return Err(ProcessingError::InsufficientData {
            operation: "photometry trial starts",
            got: 0,
            need: 1,
        });
    }
    let starts = std::iter::once(0)
        .chain(
            from_behavior
                .windows(2)
                .enumerate()
                .filter(|(_, w)| w[0] && !w[1])
                .map(|(i, _)| i + 1),
        )
        .collect();
    TrialBoundaries::new(starts, from_behavior.len())
}

// ============================================================================
// Post-alignment refinement
// ============================================================================

/// Split a penalty state into pre-penalty and true segments.
///
/// For every trial in which `penalty` (e.g. `ENLP`) fires, samples of the
/// base state (`ENL`) whose running count (`nENL`) is below the trial's
/// final count in the trial log (`n_ENL`) preceded the penalty. Those are
/// moved into a new `state_<penalty>` column and cleared from the base
/// state.
///
/// # Errors
///
/// [`ProcessingError::InvalidParameter`] for a penalty name without the
/// `P` suffix, and [`ProcessingError::MissingChannel`] for absent columns.
pub fn split_penalty_states(frame: &mut Frame, trials: &Frame, penalty: &str) -> ProcessingResult<()> {
    let base = penalty.strip_suffix('P').filter(|b| !b.is_empty()).ok_or_else(|| {
        ProcessingError::invalid_parameter("penalty", format!("{penalty} is not a penalty state"))
    })?;

    let log_trials = trials.require(TRIAL_COLUMN)?;
    let log_counts = trials.require(&format!("n_{base}"))?;
    let final_counts: HashMap<i64, f64> = log_trials
        .iter()
        .zip(log_counts)
        .filter_map(|(&trial, &count)| trial_key(trial).map(|key| (key, count)))
        .collect();

    let trial_numbers = frame.require(TRIAL_COLUMN)?;
    let penalized: HashSet<i64> = trial_numbers
        .iter()
        .zip(frame.require(penalty)?)
        .filter(|(_, &p)| p > 0.5)
        .filter_map(|(&trial, _)| trial_key(trial))
        .collect();

    let counts = frame.require(&format!("n{base}"))?;
    let state = frame.require(base)?;

    let mut pre_penalty = vec![0.0; frame.len()];
    let mut true_state = state.to_vec();
    for i in 0..frame.len() {
        let Some(trial) = trial_key(trial_numbers[i]).filter(|t| penalized.contains(t)) else {
            continue;
        };
        let before_penalty = final_counts
            .get(&trial)
            .is_some_and(|&last| counts[i] < last);
        if before_penalty {
            pre_penalty[i] = state[i];
            true_state[i] = 0.0;
        }
    }

    debug!(penalty, trials = penalized.len(), "Split penalty state");
    frame.insert(base, ColumnKind::Discrete, true_state)?;
    frame.insert(format!("state_{penalty}"), ColumnKind::Discrete, pre_penalty)
}

/// Add the per-trial elapsed time column `trial_clock`.
///
/// # Errors
///
/// [`ProcessingError::MissingChannel`] without `nTrial`.
pub fn add_trial_clock(frame: &mut Frame, sample_rate: f64) -> ProcessingResult<()> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    let clock = frame
        .require(TRIAL_COLUMN)?
        .iter()
        .map(|&trial| match trial_key(trial) {
            Some(key) => {
                let count = counts.entry(key).or_insert(0);
                let t = *count as f64 / sample_rate;
                *count += 1;
                t
            }
            None => f64::NAN,
        })
        .collect();
    frame.insert(TRIAL_CLOCK_COLUMN, ColumnKind::Discrete, clock)
}

/// Aggregate consecutive rows into bins of `factor` rows. Discrete columns
/// take the maximum, continuous columns the mean, both ignoring `NaN`. A
/// trailing incomplete bin is kept.
#[must_use]
pub fn downsample_bins(frame: &Frame, factor: usize) -> Frame {
    let factor = factor.max(1);
    let columns = frame
        .columns
        .iter()
        .map(|c| Column {
            name: c.name.clone(),
            kind: c.kind,
            values: c
                .values
                .chunks(factor)
                .map(|bin| match c.kind {
                    ColumnKind::Discrete => nan_max(bin),
                    ColumnKind::Continuous => nan_mean(bin),
                })
                .collect(),
        })
        .collect();
    Frame {
        len: frame.len.div_ceil(factor),
        columns,
    }
}

fn nan_max(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, f64::max)
}

fn nan_mean(values: &[f64]) -> f64 {
    let (sum, n) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANALOG: &str = "\
,nTrial,ENL,ENLP,nENL
0,0,0,0,0
1,1,1,0,1
2,1,1,0,1
3,1,0,0,1
4,2,1,1,1
5,2,0,0,1
6,2,1,0,2
7,2,1,0,2
8,3,1,0,1
9,3,0,0,1
";

    const TRIALS: &str = "\
nTrial,n_ENL
1,1
2,2
3,1
";

    fn frames() -> (Frame, Frame) {
        (
            Frame::from_reader(ANALOG.as_bytes()).unwrap(),
            Frame::from_reader(TRIALS.as_bytes()).unwrap(),
        )
    }

    #[test]
    fn test_read_skips_index_column() {
        let (analog, trials) = frames();
        assert_eq!(analog.len(), 10);
        assert_eq!(analog.columns().len(), 4);
        assert_eq!(analog.columns()[0].name, "nTrial");
        assert_eq!(trials.require("n_ENL").unwrap(), &[1.0, 2.0, 1.0]);
        assert!(matches!(
            analog.require("Cue"),
            Err(ProcessingError::MissingChannel { .. })
        ));
    }

    #[test]
    fn test_parse_cell() {
        assert!((parse_cell(" 2.5 ") - 2.5).abs() < 1e-12);
        assert!((parse_cell("True") - 1.0).abs() < 1e-12);
        assert!(parse_cell("").is_nan());
        assert!(parse_cell("Cue").is_nan());
    }

    #[test]
    fn test_behavior_trial_starts() {
        let (analog, _) = frames();
        let starts = behavior_trial_starts(&analog).unwrap();
        assert_eq!(starts.starts(), &[1, 4, 8]);
        assert_eq!(starts.durations(), vec![3.0, 4.0, 2.0]);
    }

    #[test]
    fn test_handshake() {
        let handshake = Handshake {
            to_behavior: vec![false, false, true, true, true, true, true, true, true, true],
            from_behavior: vec![true, true, true, true, false, true, true, false, true, false],
        };
        let start = handshake_start(&handshake).unwrap();
        assert_eq!(start, 4);

        let starts = photometry_trial_starts(&handshake.from_behavior[start..]).unwrap();
        assert_eq!(starts.starts(), &[0, 3, 5]);

        let silent = Handshake {
            to_behavior: vec![false; 4],
            from_behavior: vec![false; 4],
        };
        assert_eq!(handshake_start(&silent), None);
    }

    #[test]
    fn test_split_penalty_states() {
        let (mut analog, trials) = frames();
        split_penalty_states(&mut analog, &trials, "ENLP").unwrap();

        // Only trial 2 is penalized; its first ENL (nENL 1 < 2) preceded the penalty
        let pre = analog.require("state_ENLP").unwrap();
        assert_eq!(pre, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let enl = analog.require("ENL").unwrap();
        assert_eq!(enl, &[0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0]);

        assert!(split_penalty_states(&mut analog, &trials, "ENL").is_err());
        assert!(matches!(
            split_penalty_states(&mut analog, &trials, "CueP"),
            Err(ProcessingError::MissingChannel { .. })
        ));
    }

    #[test]
    fn test_trial_clock() {
        let (mut analog, _) = frames();
        add_trial_clock(&mut analog, 200.0).unwrap();
        let clock = analog.require(TRIAL_CLOCK_COLUMN).unwrap();
        assert!((clock[3] - 2.0 / 200.0).abs() < 1e-12);
        assert!(clock[4].abs() < 1e-12);
        assert!((clock[7] - 3.0 / 200.0).abs() < 1e-12);
    }

    #[test]
    fn test_downsample_bins() {
        let mut frame = Frame::new(5);
        frame
            .insert("state", ColumnKind::Discrete, vec![0.0, 1.0, 0.0, f64::NAN, 0.0])
            .unwrap();
        frame
            .insert("trace", ColumnKind::Continuous, vec![1.0, 3.0, f64::NAN, 5.0, 7.0])
            .unwrap();
        let binned = downsample_bins(&frame, 2);

        assert_eq!(binned.len(), 3);
        assert_eq!(binned.require("state").unwrap(), &[1.0, 0.0, 0.0]);
        assert_eq!(binned.require("trace").unwrap(), &[2.0, 5.0, 7.0]);
        assert!(frame.insert("short", ColumnKind::Continuous, vec![1.0]).is_err());
    }

    #[test]
    fn test_load_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(BehaviorData::analog_path(dir.path(), "M1"), ANALOG).unwrap();
        assert!(matches!(
            BehaviorData::load(dir.path(), "M1", 200.0),
            Err(ProcessingError::MissingFile { .. })
        ));

        std::fs::write(BehaviorData::trials_path(dir.path(), "M1"), TRIALS).unwrap();
        let data = BehaviorData::load(dir.path(), "M1", 200.0).unwrap();
        let clock = data.analog.require(SESSION_CLOCK_COLUMN).unwrap();
        assert!((clock[9] - 0.045).abs() < 1e-12);
    }
}
