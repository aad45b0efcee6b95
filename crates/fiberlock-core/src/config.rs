//! Session configuration
//!
//! Typed view of the per-session TOML metafile. Every field is optional on
//! disk; [`SessionConfig::validate`] resolves defaults once and produces a
//! [`ProcessingPlan`] that is threaded explicitly through every processing
//! call.
//!
//! Metafiles are hand-edited, so numeric entries may be written as strings,
//! and `""` or `"None"` stand for an absent value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ChannelConfiguration, ChannelKey, EmissionColor, Hemisphere, Transform};

/// Top-level session metafile.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Subject identifier
    #[serde(rename = "Subject_ID", default, deserialize_with = "lenient::opt_string")]
    pub subject_id: Option<String>,
    /// Numeric processing parameters
    #[serde(rename = "Processing_Parameters", default)]
    pub processing: ProcessingParameters,
    /// Raw channel indices
    #[serde(rename = "Signal_Indices", default)]
    pub signal_indices: SignalIndices,
    /// Fiber metadata (pass-through)
    #[serde(rename = "Fiber", default)]
    pub fiber: FiberInfo,
    /// Virus injection metadata (pass-through)
    #[serde(rename = "VirusInjection", default)]
    pub virus_injection: VirusInjection,
}

/// `[Processing_Parameters]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParameters {
    /// Raw acquisition rate in Hz. Required.
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub sampling_frequency: Option<f64>,
    /// Lock-in output rate in Hz
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub downsample_frequency: Option<f64>,
    /// Bandpass width around the carrier in Hz
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub bandpass_bandwidth: Option<f64>,
    /// Behavior offset (pass-through)
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub behavior_offset: Option<f64>,
    /// Rolling z-score window in seconds
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub z_window: Option<f64>,
    /// Produce detrended traces
    #[serde(alias = "final_z", deserialize_with = "lenient::opt_bool")]
    pub z: Option<bool>,
    /// STFT segment length in samples
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub no_per_segment: Option<usize>,
    /// STFT overlap in samples
    #[serde(alias = "no_overlap", deserialize_with = "lenient::opt_usize")]
    pub noverlap: Option<usize>,
    /// Demodulation algorithm name
    #[serde(deserialize_with = "lenient::opt_string")]
    pub transform: Option<String>,
    /// Lock-in integration time constant in seconds
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub demod_time_constant: Option<f64>,
    /// Behavior acquisition rate in Hz
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub behavior_sampling: Option<f64>,
    /// Output rate of synced traces in Hz
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub sync_frequency: Option<f64>,
    /// Nominal carriers of the left fiber
    pub left: CarrierFrequencies,
    /// Nominal carriers of the right fiber
    pub right: CarrierFrequencies,
}

/// `[Processing_Parameters.<side>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierFrequencies {
    /// Green carrier (Hz)
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub carrier_frequency_g: Option<f64>,
    /// Red carrier (Hz)
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub carrier_frequency_r: Option<f64>,
    /// Blue carrier (Hz)
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub carrier_frequency_b: Option<f64>,
}

impl CarrierFrequencies {
    /// Nominal carrier for one color. Zero or negative means "not set".
    #[must_use]
    pub fn get(&self, color: EmissionColor) -> Option<f64> {
        let value = match color {
            EmissionColor::Green => self.carrier_frequency_g,
            EmissionColor::Red => self.carrier_frequency_r,
            EmissionColor::Blue => self.carrier_frequency_b,
        };
        value.filter(|f| *f > 0.0)
    }
}

/// `[Signal_Indices]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalIndices {
    /// Channels of the left fiber
    pub left: SideIndices,
    /// Channels of the right fiber
    pub right: SideIndices,
    /// Behavior handshake lines
    pub sync: Option<SyncIndices>,
    /// Total channel count of the raw file
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub total_channels: Option<usize>,
}

impl SignalIndices {
    /// Indices of one side
    #[must_use]
    pub fn side(&self, hemisphere: Hemisphere) -> &SideIndices {
        match hemisphere {
            Hemisphere::Left => &self.left,
            Hemisphere::Right => &self.right,
        }
    }
}

/// `[Signal_Indices.<side>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SideIndices {
    /// Green photometry channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub photom_g: Option<usize>,
    /// Red photometry channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub photom_r: Option<usize>,
    /// Blue photometry channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub photom_b: Option<usize>,
    /// Green carrier reference channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub carrier_g: Option<usize>,
    /// Red carrier reference channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub carrier_r: Option<usize>,
    /// Blue carrier reference channel
    #[serde(deserialize_with = "lenient::opt_usize")]
    pub carrier_b: Option<usize>,
    /// Older metafiles keep wavelengths here instead of under `Fiber`
    pub emission_wavelength: Wavelengths,
    /// Older metafiles keep wavelengths here instead of under `Fiber`
    pub excitation_wavelength: Wavelengths,
    /// Older metafiles keep the sensor here instead of under `VirusInjection`
    pub sensor_protein: Proteins,
}

impl SideIndices {
    /// Raw index of the photometry channel for a color
    #[must_use]
    pub fn photometry(&self, color: EmissionColor) -> Option<usize> {
        match color {
            EmissionColor::Green => self.photom_g,
            EmissionColor::Red => self.photom_r,
            EmissionColor::Blue => self.photom_b,
        }
    }

    /// Raw index of the carrier reference channel for a color
    #[must_use]
    pub fn carrier(&self, color: EmissionColor) -> Option<usize> {
        match color {
            EmissionColor::Green => self.carrier_g,
            EmissionColor::Red => self.carrier_r,
            EmissionColor::Blue => self.carrier_b,
        }
    }
}

/// `[Signal_Indices.sync]`: handshake line indices
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIndices {
    /// `toBehSys` channel
    #[serde(deserialize_with = "lenient::req_usize")]
    pub to_behavior: usize,
    /// `fromBehSys` channel
    #[serde(deserialize_with = "lenient::req_usize")]
    pub from_behavior: usize,
}

/// Per-color wavelengths in nm
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Wavelengths {
    /// Green channel
    #[serde(deserialize_with = "lenient::opt_u16")]
    pub green: Option<u16>,
    /// Red channel
    #[serde(deserialize_with = "lenient::opt_u16")]
    pub red: Option<u16>,
    /// Blue channel
    #[serde(deserialize_with = "lenient::opt_u16")]
    pub blue: Option<u16>,
}

impl Wavelengths {
    fn get(&self, color: EmissionColor) -> Option<u16> {
        match color {
            EmissionColor::Green => self.green,
            EmissionColor::Red => self.red,
            EmissionColor::Blue => self.blue,
        }
    }
}

/// Per-color sensor proteins
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Proteins {
    /// Green channel
    #[serde(deserialize_with = "lenient::opt_string")]
    pub green: Option<String>,
    /// Red channel
    #[serde(deserialize_with = "lenient::opt_string")]
    pub red: Option<String>,
    /// Blue channel
    #[serde(deserialize_with = "lenient::opt_string")]
    pub blue: Option<String>,
}

impl Proteins {
    fn get(&self, color: EmissionColor) -> Option<&String> {
        match color {
            EmissionColor::Green => self.green.as_ref(),
            EmissionColor::Red => self.red.as_ref(),
            EmissionColor::Blue => self.blue.as_ref(),
        }
    }
}

/// `[Fiber]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberInfo {
    /// Light source name
    #[serde(deserialize_with = "lenient::opt_string")]
    pub light_source: Option<String>,
    /// Per-side implantation details
    pub implantation: Implantation,
}

/// `[Fiber.implantation]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Implantation {
    /// Left fiber
    pub left: FiberSide,
    /// Right fiber
    pub right: FiberSide,
}

/// `[Fiber.implantation.<side>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberSide {
    /// Target region
    #[serde(deserialize_with = "lenient::opt_string")]
    pub brain_region: Option<String>,
    /// Free-text notes
    #[serde(deserialize_with = "lenient::opt_string")]
    pub notes: Option<String>,
    /// Emission wavelengths
    pub emission_wavelength: Wavelengths,
    /// Excitation wavelengths
    pub excitation_wavelength: Wavelengths,
}

/// `[VirusInjection]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirusInjection {
    /// Left injection
    pub left: VirusSide,
    /// Right injection
    pub right: VirusSide,
}

/// `[VirusInjection.<side>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirusSide {
    /// Sensor per color
    pub sensor_protein: Proteins,
}

// ============================================================================
// Validated plan
// ============================================================================

/// Processing parameters with every default resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingPlan {
    /// Raw acquisition rate (Hz)
    pub sampling_frequency: f64,
    /// Lock-in output rate (Hz)
    pub downsample_frequency: f64,
    /// Bandpass width around the carrier (Hz)
    pub bandpass_bandwidth: f64,
    /// Behavior offset, passed through
    pub behavior_offset: f64,
    /// Rolling z-score window (s)
    pub z_window: f64,
    /// Whether detrended traces are produced
    pub detrend: bool,
    /// STFT segment length (samples)
    pub no_per_segment: usize,
    /// STFT overlap (samples)
    pub noverlap: usize,
    /// Demodulation algorithm
    pub transform: Transform,
    /// Lock-in integration time constant (s)
    pub demod_time_constant: f64,
    /// Behavior acquisition rate (Hz)
    pub behavior_sampling: f64,
    /// Output rate of synced traces (Hz)
    pub sync_frequency: f64,
}

#[allow(missing_docs)]
impl ProcessingPlan {
    pub const DEFAULT_DOWNSAMPLE_HZ: f64 = 600.0;
    pub const DEFAULT_BANDPASS_BANDWIDTH_HZ: f64 = 50.0;
    pub const DEFAULT_Z_WINDOW_S: f64 = 60.0;
    pub const DEFAULT_NO_PER_SEGMENT: usize = 216;
    pub const DEFAULT_NOVERLAP: usize = 108;
    pub const DEFAULT_TIME_CONSTANT_S: f64 = 0.05;
    pub const DEFAULT_BEHAVIOR_HZ: f64 = 200.0;
    pub const DEFAULT_SYNC_HZ: f64 = 50.0;

    /// Plan with all defaults at the given raw rate.
    #[must_use]
    pub fn with_sampling_frequency(sampling_frequency: f64) -> Self {
        Self {
            sampling_frequency,
            downsample_frequency: Self::DEFAULT_DOWNSAMPLE_HZ,
            bandpass_bandwidth: Self::DEFAULT_BANDPASS_BANDWIDTH_HZ,
            behavior_offset: 0.0,
            z_window: Self::DEFAULT_Z_WINDOW_S,
            detrend: false,
            no_per_segment: Self::DEFAULT_NO_PER_SEGMENT,
            noverlap: Self::DEFAULT_NOVERLAP,
            transform: Transform::Spectrogram,
            demod_time_constant: Self::DEFAULT_TIME_CONSTANT_S,
            behavior_sampling: Self::DEFAULT_BEHAVIOR_HZ,
            sync_frequency: Self::DEFAULT_SYNC_HZ,
        }
    }

    /// Check value ranges. Called by [`SessionConfig::validate`] and usable
    /// on hand-built plans.
    pub fn check(&self) -> ConfigResult<()> {
        positive("sampling_frequency", self.sampling_frequency)?;
        positive("downsample_frequency", self.downsample_frequency)?;
        positive("bandpass_bandwidth", self.bandpass_bandwidth)?;
        positive("z_window", self.z_window)?;
        positive("demod_time_constant", self.demod_time_constant)?;
        positive("behavior_sampling", self.behavior_sampling)?;
        positive("sync_frequency", self.sync_frequency)?;

        if !self.behavior_offset.is_finite() {
            return Err(ConfigError::invalid_parameter("behavior_offset", "must be finite"));
        }
        if self.downsample_frequency > self.sampling_frequency {
            return Err(ConfigError::invalid_parameter(
                "downsample_frequency",
                format!(
                    "{} Hz exceeds the sampling frequency {} Hz",
                    self.downsample_frequency, self.sampling_frequency
                ),
            ));
        }
        if self.sync_frequency > self.behavior_sampling {
            return Err(ConfigError::invalid_parameter(
                "sync_frequency",
                format!(
                    "{} Hz exceeds the behavior sampling rate {} Hz",
                    self.sync_frequency, self.behavior_sampling
                ),
            ));
        }
        if self.no_per_segment < 2 {
            return Err(ConfigError::invalid_parameter(
                "no_per_segment",
                "needs at least 2 samples per segment",
            ));
        }
        if self.noverlap >= self.no_per_segment {
            return Err(ConfigError::invalid_parameter(
                "noverlap",
                format!("{} must be less than no_per_segment {}", self.noverlap, self.no_per_segment),
            ));
        }
        Ok(())
    }
}

fn positive(parameter: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_parameter(parameter, format!("{value} must be positive")))
    }
}

// ============================================================================
// Loading
// ============================================================================

impl SessionConfig {
    /// Parse a metafile from text.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Self::parse(text, Path::new("<memory>"))
    }

    fn parse(text: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a metafile from disk.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&text, path)?;
        debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Load a metafile, falling back to an empty configuration when it is
    /// missing or malformed.
    ///
    /// The empty configuration still fails [`validate`](Self::validate)
    /// because it has no sampling frequency.
    #[must_use]
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                info!("{e}; continuing with an empty configuration");
                Self::default()
            }
        }
    }

    /// First `*.toml` file in a session directory, in name order.
    #[must_use]
    pub fn find_in_dir(dir: &Path) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    /// Resolve defaults and check ranges.
    pub fn validate(&self) -> ConfigResult<ProcessingPlan> {
        let p = &self.processing;
        let sampling_frequency = p
            .sampling_frequency
            .ok_or(ConfigError::MissingSamplingFrequency)?;

        let transform = match p.transform.as_deref() {
            Some(name) => name
                .parse::<Transform>()
                .map_err(|reason| ConfigError::invalid_parameter("transform", reason))?,
            None => Transform::default(),
        };

        let defaults = ProcessingPlan::with_sampling_frequency(sampling_frequency);
        let plan = ProcessingPlan {
            sampling_frequency,
            downsample_frequency: p.downsample_frequency.unwrap_or(defaults.downsample_frequency),
            bandpass_bandwidth: p.bandpass_bandwidth.unwrap_or(defaults.bandpass_bandwidth),
            behavior_offset: p.behavior_offset.unwrap_or(defaults.behavior_offset),
            z_window: p.z_window.unwrap_or(defaults.z_window),
            detrend: p.z.unwrap_or(defaults.detrend),
            no_per_segment: p.no_per_segment.unwrap_or(defaults.no_per_segment),
            noverlap: p
                .noverlap
                .or_else(|| p.no_per_segment.map(|n| n / 2))
                .unwrap_or(defaults.noverlap),
            transform,
            demod_time_constant: p.demod_time_constant.unwrap_or(defaults.demod_time_constant),
            behavior_sampling: p.behavior_sampling.unwrap_or(defaults.behavior_sampling),
            sync_frequency: p.sync_frequency.unwrap_or(defaults.sync_frequency),
        };
        plan.check()?;
        Ok(plan)
    }

    /// Resolve one [`ChannelConfiguration`] per recorded photometry channel.
    ///
    /// Channels are ordered right then left, green then red then blue.
    /// Two entries sharing one raw photometry index is an error.
    pub fn channel_configurations(&self) -> ConfigResult<Vec<ChannelConfiguration>> {
        let mut seen: BTreeMap<usize, ChannelKey> = BTreeMap::new();
        let mut channels = Vec::new();

        for hemisphere in Hemisphere::ALL {
            let indices = self.signal_indices.side(hemisphere);
            let carriers = match hemisphere {
                Hemisphere::Left => &self.processing.left,
                Hemisphere::Right => &self.processing.right,
            };
            let fiber = match hemisphere {
                Hemisphere::Left => &self.fiber.implantation.left,
                Hemisphere::Right => &self.fiber.implantation.right,
            };
            let virus = match hemisphere {
                Hemisphere::Left => &self.virus_injection.left,
                Hemisphere::Right => &self.virus_injection.right,
            };

            for color in [EmissionColor::Green, EmissionColor::Red, EmissionColor::Blue] {
                let Some(signal_index) = indices.photometry(color) else {
                    continue;
                };
                let key = ChannelKey::new(hemisphere, color);
                if let Some(first) = seen.insert(signal_index, key) {
                    return Err(ConfigError::DuplicateChannel {
                        index: signal_index,
                        first: first.to_string(),
                        second: key.to_string(),
                    });
                }

                let mut channel = ChannelConfiguration::new(key, signal_index)
                    .with_carrier(indices.carrier(color), carriers.get(color));
                channel.sensor_protein = virus
                    .sensor_protein
                    .get(color)
                    .or_else(|| indices.sensor_protein.get(color))
                    .cloned();
                channel.emission_wavelength_nm = fiber
                    .emission_wavelength
                    .get(color)
                    .or_else(|| indices.emission_wavelength.get(color));
                channel.excitation_wavelength_nm = fiber
                    .excitation_wavelength
                    .get(color)
                    .or_else(|| indices.excitation_wavelength.get(color));
                channels.push(channel);
            }
        }

        Ok(channels)
    }

    /// Implantation notes per fiber, passed through to the output.
    #[must_use]
    pub fn fiber_notes(&self) -> Vec<(Hemisphere, Option<String>)> {
        vec![
            (Hemisphere::Right, self.fiber.implantation.right.notes.clone()),
            (Hemisphere::Left, self.fiber.implantation.left.notes.clone()),
        ]
    }
}

/// Deserializers for hand-edited metafile values.
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Bool(bool),
        Int(i64),
        Float(f64),
        Text(String),
    }

    fn is_absent(text: &str) -> bool {
        let t = text.trim();
        t.is_empty() || t.eq_ignore_ascii_case("none") || t.eq_ignore_ascii_case("null")
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Loose::deserialize(d)? {
            Loose::Int(i) => Ok(Some(i as f64)),
            Loose::Float(f) => Ok(Some(f)),
            Loose::Text(t) if is_absent(&t) => Ok(None),
            Loose::Text(t) => t
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected a number, got '{t}'"))),
            Loose::Bool(b) => Err(D::Error::custom(format!("expected a number, got {b}"))),
        }
    }

    pub fn opt_usize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        let invalid = |what: String| D::Error::custom(format!("expected a non-negative integer, got {what}"));
        match Loose::deserialize(d)? {
            Loose::Int(i) => usize::try_from(i).map(Some).map_err(|_| invalid(i.to_string())),
            Loose::Float(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as usize)),
            Loose::Float(f) => Err(invalid(f.to_string())),
            Loose::Text(t) if is_absent(&t) => Ok(None),
            Loose::Text(t) => t.trim().parse().map(Some).map_err(|_| invalid(format!("'{t}'"))),
            Loose::Bool(b) => Err(invalid(b.to_string())),
        }
    }

    pub fn req_usize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        opt_usize(d)?.ok_or_else(|| D::Error::custom("missing channel index"))
    }

    pub fn opt_u16<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        match opt_usize(d)? {
            Some(v) => u16::try_from(v)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("{v} is out of range"))),
            None => Ok(None),
        }
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match Loose::deserialize(d)? {
            Loose::Bool(b) => Ok(Some(b)),
            Loose::Int(0) => Ok(Some(false)),
            Loose::Int(1) => Ok(Some(true)),
            Loose::Text(t) if is_absent(&t) => Ok(None),
            Loose::Text(t) if t.trim().eq_ignore_ascii_case("true") => Ok(Some(true)),
            Loose::Text(t) if t.trim().eq_ignore_ascii_case("false") => Ok(Some(false)),
            _ => Err(D::Error::custom("expected true or false")),
        }
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Loose::deserialize(d)? {
            Loose::Text(t) if is_absent(&t) => Ok(None),
            Loose::Text(t) => Ok(Some(t)),
            Loose::Int(i) => Ok(Some(i.to_string())),
            Loose::Float(f) => Ok(Some(f.to_string())),
            Loose::Bool(b) => Ok(Some(b.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METAFILE: &str = r#"
Subject_ID = "M123"

[Fiber]
light_source = "LED"

[Fiber.implantation.left]
notes = "NAc core"
emission_wavelength = { green = 525, red = "" }

[Fiber.implantation.right]
notes = ""

[VirusInjection.left.sensor_protein]
green = "dLight1.3b"

[Processing_Parameters]
sampling_frequency = 6103.515625
downsample_frequency = "600"
bandpass_bandwidth = 40.0
z_window = 30
final_z = "true"
transform = "hilbert"
no_per_segment = 256

[Processing_Parameters.left]
carrier_frequency_g = 500
carrier_frequency_r = "None"

[Signal_Indices.left]
photom_g = 2
photom_r = "None"
carrier_g = 0
carrier_r = "None"

[Signal_Indices.right]
photom_g = "None"

[Signal_Indices.sync]
to_behavior = 5
from_behavior = 6
"#;

    #[test]
    fn test_parse_metafile() {
        let config = SessionConfig::from_toml_str(METAFILE).unwrap();
        assert_eq!(config.subject_id.as_deref(), Some("M123"));
        assert_eq!(config.processing.downsample_frequency, Some(600.0));
        assert_eq!(config.processing.z, Some(true));
        assert_eq!(config.processing.left.get(EmissionColor::Green), Some(500.0));
        assert_eq!(config.processing.left.get(EmissionColor::Red), None);
        assert_eq!(
            config.signal_indices.sync,
            Some(SyncIndices { to_behavior: 5, from_behavior: 6 })
        );
    }

    #[test]
    fn test_validate_resolves_defaults() {
        let config = SessionConfig::from_toml_str(METAFILE).unwrap();
        let plan = config.validate().unwrap();
        assert_eq!(plan.transform, Transform::LockIn);
        assert!(plan.detrend);
        assert_eq!(plan.no_per_segment, 256);
        // Overlap follows the segment length when not given
        assert_eq!(plan.noverlap, 128);
        assert!((plan.z_window - 30.0).abs() < 1e-12);
        assert!((plan.demod_time_constant - 0.05).abs() < 1e-12);
        assert!((plan.behavior_sampling - 200.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_sampling_frequency_is_fatal() {
        let config = SessionConfig::from_toml_str("[Processing_Parameters]\nz_window = 60\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingSamplingFrequency)));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let text = "[Processing_Parameters]\nsampling_frequency = 1000\ntransform = \"wavelet\"\n";
        let config = SessionConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { parameter: "transform", .. })
        ));
    }

    #[test]
    fn test_overlap_must_be_shorter_than_segment() {
        let text = "[Processing_Parameters]\nsampling_frequency = 1000\nno_per_segment = 64\nnoverlap = 64\n";
        let config = SessionConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { parameter: "noverlap", .. })
        ));
    }

    #[test]
    fn test_channel_configurations() {
        let config = SessionConfig::from_toml_str(METAFILE).unwrap();
        let channels = config.channel_configurations().unwrap();
        assert_eq!(channels.len(), 1);

        let green = &channels[0];
        assert_eq!(green.key, ChannelKey::new(Hemisphere::Left, EmissionColor::Green));
        assert_eq!(green.signal_index, 2);
        assert_eq!(green.carrier_index, Some(0));
        assert_eq!(green.set_carrier_hz, Some(500.0));
        assert_eq!(green.sensor_protein.as_deref(), Some("dLight1.3b"));
        assert_eq!(green.emission_wavelength_nm, Some(525));
        assert_eq!(green.excitation_wavelength_nm, None);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let text = "[Signal_Indices.left]\nphotom_g = 1\n[Signal_Indices.right]\nphotom_r = 1\n";
        let config = SessionConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            config.channel_configurations(),
            Err(ConfigError::DuplicateChannel { index: 1, .. })
        ));
    }

    #[test]
    fn test_load_or_empty_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_or_empty(&dir.path().join("absent.toml"));
        assert!(config.processing.sampling_frequency.is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_find_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionConfig::find_in_dir(dir.path()).is_none());

        std::fs::write(dir.path().join("b.toml"), METAFILE).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let found = SessionConfig::find_in_dir(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "b.toml");

        let loaded = SessionConfig::load(&found).unwrap();
        assert_eq!(loaded.subject_id.as_deref(), Some("M123"));
    }
}
