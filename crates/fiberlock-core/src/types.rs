//! Core types for fiberlock
//!
//! This module provides the data model shared by every processing stage:
//! - Channel identity (hemisphere, emission color)
//! - Raw and demodulated traces
//! - Carrier estimates and the transform that produced a trace
//! - Trace tables handed to the persistence boundary

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Channel identity
// ============================================================================

/// Implanted hemisphere, one fiber per side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    /// Right hemisphere (fiber 1)
    Right,
    /// Left hemisphere (fiber 2)
    Left,
}

impl Hemisphere {
    /// Both sides in processing order.
    pub const ALL: [Self; 2] = [Self::Right, Self::Left];

    /// Fiber identifier used by the persistence schema.
    #[inline]
    #[must_use]
    pub const fn fiber_id(self) -> u8 {
        match self {
            Self::Right => 1,
            Self::Left => 2,
        }
    }

    /// Lowercase tag as used in the TOML document.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Right => "right",
            Self::Left => "left",
        }
    }

    /// Single-letter suffix used in column names (`grnR`, `redL`).
    #[must_use]
    pub const fn suffix(self) -> char {
        match self {
            Self::Right => 'R',
            Self::Left => 'L',
        }
    }
}

/// Emission color of a fluorescence channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmissionColor {
    /// Green emission (e.g. GCaMP, dLight)
    Green,
    /// Red emission (e.g. jRGECO, rDA)
    Red,
    /// Blue emission
    Blue,
}

impl EmissionColor {
    /// Parse the single-letter tag used in `Signal_Indices` keys (`photom_g`).
    #[must_use]
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag.to_ascii_lowercase() {
            'g' => Some(Self::Green),
            'r' => Some(Self::Red),
            'b' => Some(Self::Blue),
            _ => None,
        }
    }

    /// Three-letter abbreviation used in column names.
    #[must_use]
    pub const fn abbreviation(self) -> &'static str {
        match self {
            Self::Green => "grn",
            Self::Red => "red",
            Self::Blue => "blu",
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Red => "red",
            Self::Blue => "blue",
        }
    }
}

/// Identifies one physical photometry channel within a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Implanted side
    pub hemisphere: Hemisphere,
    /// Emission color
    pub color: EmissionColor,
}

impl ChannelKey {
    /// Create a new channel key
    #[must_use]
    pub const fn new(hemisphere: Hemisphere, color: EmissionColor) -> Self {
        Self { hemisphere, color }
    }

    /// Column name for a trace of this channel, e.g. `detrend_grnR`.
    #[must_use]
    pub fn column_name(&self, trace_name: &str) -> String {
        format!(
            "{}_{}{}",
            trace_name,
            self.color.abbreviation(),
            self.hemisphere.suffix()
        )
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hemisphere.tag(), self.color.name())
    }
}

// ============================================================================
// Channel configuration
// ============================================================================

/// Static per-channel metadata resolved from the session configuration.
///
/// There is exactly one entry per physical channel per session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfiguration {
    /// Channel identity
    pub key: ChannelKey,
    /// Zero-based index of the modulated photometry channel in the raw data
    pub signal_index: usize,
    /// Zero-based index of the carrier reference channel, if recorded
    pub carrier_index: Option<usize>,
    /// Nominal ("set") carrier frequency in Hz
    pub set_carrier_hz: Option<f64>,
    /// Sensor protein, passed through
    pub sensor_protein: Option<String>,
    /// Excitation wavelength in nm, passed through
    pub excitation_wavelength_nm: Option<u16>,
    /// Emission wavelength in nm, passed through
    pub emission_wavelength_nm: Option<u16>,
}

impl ChannelConfiguration {
    /// Minimal configuration for a channel with a known signal index.
    #[must_use]
    pub fn new(key: ChannelKey, signal_index: usize) -> Self {
        Self {
            key,
            signal_index,
            carrier_index: None,
            set_carrier_hz: None,
            sensor_protein: None,
            excitation_wavelength_nm: None,
            emission_wavelength_nm: None,
        }
    }

    /// Set the carrier reference channel and nominal frequency.
    #[must_use]
    pub fn with_carrier(mut self, carrier_index: Option<usize>, set_carrier_hz: Option<f64>) -> Self {
        self.carrier_index = carrier_index;
        self.set_carrier_hz = set_carrier_hz;
        self
    }
}

// ============================================================================
// Raw traces
// ============================================================================

/// Role of a raw channel within a photometry recording.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Driver reference sinusoid
    Carrier,
    /// Photodetector output carrying the modulated fluorescence
    Signal,
}

/// A borrowed view of one raw channel at its native sample rate.
#[derive(Copy, Clone, Debug)]
pub struct RawChannelTrace<'a> {
    /// Channel identity
    pub key: ChannelKey,
    /// Carrier reference or photometry signal
    pub role: ChannelRole,
    /// Raw voltages
    pub samples: &'a [f64],
    /// Native sample rate in Hz
    pub sample_rate: f64,
}

impl<'a> RawChannelTrace<'a> {
    /// Create a new raw trace view
    #[must_use]
    pub const fn new(key: ChannelKey, role: ChannelRole, samples: &'a [f64], sample_rate: f64) -> Self {
        Self { key, role, samples, sample_rate }
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the trace holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Recording duration in seconds
    #[must_use]
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate
    }
}

// ============================================================================
// Carrier estimates
// ============================================================================

/// Which value was adopted as the carrier frequency.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierSource {
    /// Configured value agreed with the estimate
    Configured,
    /// Estimate was used (no configured value, or mismatch)
    Estimated,
}

/// Carrier frequency of one channel.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarrierEstimate {
    /// FFT peak frequency in Hz
    pub estimated_hz: f64,
    /// Nominal frequency from the configuration
    pub configured_hz: Option<f64>,
    /// Authoritative frequency used for demodulation
    pub frequency_hz: f64,
    /// Which of the two was adopted
    pub source: CarrierSource,
}

// ============================================================================
// Demodulated traces
// ============================================================================

/// Algorithm that produced a demodulated trace.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transform {
    /// Short-time Fourier transform magnitude at the carrier bin
    #[default]
    #[serde(rename = "spectrogram", alias = "spectogram")]
    Spectrogram,
    /// Quadrature reference-fit (lock-in) demodulation
    #[serde(rename = "lock-in", alias = "hilbert", alias = "lockin")]
    LockIn,
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spectrogram => f.write_str("spectrogram"),
            Self::LockIn => f.write_str("lock-in"),
        }
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spectrogram" | "spectogram" => Ok(Self::Spectrogram),
            "lock-in" | "lockin" | "hilbert" => Ok(Self::LockIn),
            other => Err(format!("unknown transform '{other}'")),
        }
    }
}

/// Trace name of the envelope computed from the unmodified raw signal.
pub const RAW_TRACE: &str = "raw";

/// Trace name of the envelope computed after a rolling z-score of the raw signal.
pub const DETREND_TRACE: &str = "detrend";

/// Trace name of the post-alignment rolling z-score of a detrended trace.
pub const ZSCORE_TRACE: &str = "z";

/// Envelope recovered from one carrier-modulated channel.
///
/// Samples that fall inside a filter transient are `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemodulatedTrace {
    /// Originating channel configuration
    pub channel: ChannelConfiguration,
    /// Trace name (`raw`, `detrend`)
    pub trace_name: String,
    /// Carrier used for demodulation
    pub carrier: CarrierEstimate,
    /// Algorithm that produced the envelope
    pub transform: Transform,
    /// Envelope sample rate in Hz
    pub sample_rate: f64,
    /// Time of the first envelope sample relative to the first raw sample (s)
    pub start_time: f64,
    /// Envelope samples
    #[serde(with = "nan_as_null")]
    pub samples: Vec<f64>,
    /// Time-averaged carrier-bin magnitude (spectrogram only)
    pub spectral_power: Option<f64>,
}

impl DemodulatedTrace {
    /// Channel identity
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.channel.key
    }

    /// Column name such as `raw_grnR`
    #[must_use]
    pub fn column_name(&self) -> String {
        self.channel.key.column_name(&self.trace_name)
    }

    /// Time in seconds of sample `index` relative to the raw recording start
    #[must_use]
    pub fn time_of(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.sample_rate
    }
}

/// Behavior handshake lines sampled on the demodulated time base.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Recording system → behavior system line (`toBehSys`)
    pub to_behavior: Vec<bool>,
    /// Behavior system → recording system line (`fromBehSys`)
    pub from_behavior: Vec<bool>,
}

impl Handshake {
    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.to_behavior.len().min(self.from_behavior.len())
    }

    /// Whether there are no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All demodulated traces of one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceTable {
    /// Raw acquisition sample rate in Hz
    pub raw_sample_rate: f64,
    /// Light source, passed through from the configuration
    pub light_source: Option<String>,
    /// Behavior offset, passed through from the configuration
    pub behavior_offset: f64,
    /// Per-fiber implantation notes, passed through
    pub fiber_notes: Vec<(Hemisphere, Option<String>)>,
    /// Demodulated traces in channel order
    pub traces: Vec<DemodulatedTrace>,
    /// Handshake lines on the demodulated time base, when recorded
    pub handshake: Option<Handshake>,
}

impl TraceTable {
    /// Find a trace by channel and name
    #[must_use]
    pub fn get(&self, key: ChannelKey, trace_name: &str) -> Option<&DemodulatedTrace> {
        self.traces
            .iter()
            .find(|t| t.key() == key && t.trace_name == trace_name)
    }

    /// Common demodulated sample rate, if the table is non-empty
    #[must_use]
    pub fn demod_sample_rate(&self) -> Option<f64> {
        self.traces.first().map(|t| t.sample_rate)
    }
}

// ============================================================================
// Synced output
// ============================================================================

/// One photometry trace on the behavior time base.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncedTrace {
    /// Channel identity
    pub key: ChannelKey,
    /// Trace name (`raw`, `detrend`, `z`)
    pub trace_name: String,
    /// Samples at the synced sample rate
    #[serde(with = "nan_as_null")]
    pub samples: Vec<f64>,
}

/// One behavior state column on the synced time base.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorColumn {
    /// Column name as in the behavior stream (`ENL`, `state_ENLP`, `trial_clock`)
    pub name: String,
    /// Per-bin values
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
}

/// Photometry traces aligned and binned onto the behavior clock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncedSession {
    /// Behavior session clock of each output bin (s)
    pub timestamps: Vec<f64>,
    /// Behavior clock time of the first retained sample (s)
    pub time_offset: f64,
    /// Output sample rate (Hz)
    pub sample_rate: f64,
    /// Trial shift between the two streams
    pub offset_trials: i32,
    /// Duration correlation at the chosen shift
    pub correlation: f64,
    /// Synced traces
    pub traces: Vec<SyncedTrace>,
    /// Behavior state columns binned alongside the traces
    pub behavior: Vec<BehaviorColumn>,
}

impl SyncedSession {
    /// Find a synced trace by channel and name
    #[must_use]
    pub fn trace(&self, key: ChannelKey, trace_name: &str) -> Option<&SyncedTrace> {
        self.traces
            .iter()
            .find(|t| t.key == key && t.trace_name == trace_name)
    }

    /// Find a behavior column by name
    #[must_use]
    pub fn behavior_column(&self, name: &str) -> Option<&[f64]> {
        self.behavior
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }
}

/// Sample vectors with `NaN` gaps written as `null`, which JSON can carry.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let values: Vec<Option<f64>> = values.iter().map(|v| (!v.is_nan()).then_some(*v)).collect();
        values.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(d)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}
