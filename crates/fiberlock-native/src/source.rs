//! Raw data input adapters
//!
//! The pipeline reads raw channels through [`ChannelSource`] and never sees
//! the file format. Two adapters are provided:
//! - [`InMemorySource`]: channel arrays already in memory
//! - [`CsvSource`]: a column-oriented CSV file, one column per channel

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ProcessingError, ProcessingResult};
use crate::processing::behavior::Frame;

// ============================================================================
// Channel Source Trait
// ============================================================================

/// Read access to the raw channels of one recording.
pub trait ChannelSource {
    /// Number of channels
    fn channel_count(&self) -> usize;

    /// Samples of channel `index` (zero-based)
    ///
    /// # Errors
    ///
    /// [`ProcessingError::MissingChannel`] when the index is out of range.
    fn channel(&self, index: usize) -> ProcessingResult<&[f64]>;

    /// Native sample rate, when the format records one
    fn sample_rate(&self) -> Option<f64> {
        None
    }
}

fn missing(index: usize, count: usize) -> ProcessingError {
    ProcessingError::MissingChannel {
        name: format!("{index} (recording has {count} channels)"),
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Channels held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    channels: Vec<Vec<f64>>,
    sample_rate: Option<f64>,
}

impl InMemorySource {
    /// Create a new in-memory source
    #[must_use]
    pub fn new(channels: Vec<Vec<f64>>) -> Self {
        Self {
            channels,
            sample_rate: None,
        }
    }

    /// Record the native sample rate
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }
}

impl ChannelSource for InMemorySource {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, index: usize) -> ProcessingResult<&[f64]> {
        self.channels
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| missing(index, self.channels.len()))
    }

    fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }
}

// ============================================================================
// CSV
// ============================================================================

/// Column-oriented CSV recording.
///
/// The first row names the channels; column `i` is channel `i`. The
/// sample rate is not part of the format and comes from the session
/// configuration.
#[derive(Clone, Debug)]
pub struct CsvSource {
    path: PathBuf,
    names: Vec<String>,
    channels: Vec<Vec<f64>>,
}

impl CsvSource {
    /// Read a recording from disk.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::MissingFile`] when the file does not exist, and
    /// CSV decoding errors.
    pub fn open(path: &Path) -> ProcessingResult<Self> {
        let frame = Frame::read_csv(path)?;
        let (names, channels) = frame
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.values.clone()))
            .unzip();
        let source = Self {
            path: path.to_path_buf(),
            names,
            channels,
        };
        info!(
            path = %path.display(),
            channels = source.channels.len(),
            samples = frame.len(),
            "Opened raw recording"
        );
        Ok(source)
    }

    /// File the recording was read from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Channel names from the header row
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl ChannelSource for CsvSource {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, index: usize) -> ProcessingResult<&[f64]> {
        self.channels
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| missing(index, self.channels.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_source() {
        let source = InMemorySource::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).with_sample_rate(100.0);
        assert_eq!(source.channel_count(), 2);
        assert_eq!(source.channel(1).unwrap(), &[3.0, 4.0]);
        assert_eq!(source.sample_rate(), Some(100.0));
        assert!(matches!(
            source.channel(2),
            Err(ProcessingError::MissingChannel { .. })
        ));
    }

    #[test]
    fn test_csv_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(&path, "carrier,signal\n0.5,1.0\n-0.5,2.0\n0.25,3.0\n").unwrap();

        let source = CsvSource::open(&path).unwrap();
        assert_eq!(source.names(), &["carrier".to_string(), "signal".to_string()]);
        assert_eq!(source.channel(1).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(source.sample_rate(), None);
        assert!(source.channel(2).is_err());

        assert!(matches!(
            CsvSource::open(&dir.path().join("absent.csv")),
            Err(ProcessingError::MissingFile { .. })
        ));
    }
}
