//! Session pipeline
//!
//! Two batch stages, each a pure function of its inputs:
//! - [`demodulate_session`]: raw channels + session configuration to a
//!   [`TraceTable`] of demodulated envelopes
//! - [`sync_session`]: a trace table + behavior files to a [`SyncedSession`]
//!   on the behavior clock
//!
//! [`save_json`] and [`load_trace_table`] persist the intermediate table.

use std::collections::HashSet;
use std::path::Path;

use fiberlock_core::{
    BehaviorColumn, CarrierEstimate, ChannelConfiguration, ChannelRole, DemodulatedTrace, Handshake,
    ProcessingPlan, RawChannelTrace, SessionConfig, SyncedSession, SyncedTrace, TraceTable,
    DETREND_TRACE, RAW_TRACE, ZSCORE_TRACE,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProcessingError, ProcessingResult};
use crate::processing::align::StreamAligner;
use crate::processing::behavior::{
    add_trial_clock, behavior_trial_starts, downsample_bins, handshake_start,
    photometry_trial_starts, split_penalty_states, BehaviorData, ColumnKind, PENALTY_STATES,
    SESSION_CLOCK_COLUMN,
};
use crate::processing::carrier::{estimate_carrier, resolve_carrier, DEFAULT_ANALYSIS_WINDOW};
use crate::processing::demod::{demodulator_for, Envelope};
use crate::processing::normalize::rolling_zscore;
use crate::source::ChannelSource;

/// Digital line threshold for the handshake channels
const HANDSHAKE_THRESHOLD: f64 = 0.5;

// ============================================================================
// Demodulation
// ============================================================================

/// Demodulate every configured photometry channel of one recording.
///
/// The plan's sampling frequency is authoritative; a differing rate reported
/// by the source is logged and ignored. Each channel's carrier is estimated
/// from its reference channel (or from the signal when no reference was
/// recorded) and reconciled with the configured value. With detrending
/// enabled a second `detrend` trace is demodulated from the rolling
/// z-score of the raw signal.
///
/// # Errors
///
/// Configuration errors, [`ProcessingError::MissingChannel`] for indices
/// outside the recording, and any filter or demodulation failure.
pub fn demodulate_session(
    config: &SessionConfig,
    source: &dyn ChannelSource,
) -> ProcessingResult<TraceTable> {
    let plan = config.validate()?;
    let channels = config.channel_configurations()?;
    let fs = plan.sampling_frequency;

    if let Some(rate) = source.sample_rate() {
        if (rate - fs).abs() > 1e-6 {
            warn!(
                source_rate = rate,
                configured_rate = fs,
                "Source sample rate differs from configuration; using configured rate"
            );
        }
    }
    if let Some(total) = config.signal_indices.total_channels {
        if total != source.channel_count() {
            warn!(
                configured = total,
                recorded = source.channel_count(),
                "Channel count differs from configuration"
            );
        }
    }

    info!(
        channels = channels.len(),
        transform = %plan.transform,
        sampling_frequency = fs,
        detrend = plan.detrend,
        "Demodulating session"
    );

    let demodulator = demodulator_for(&plan);
    let mut traces = Vec::with_capacity(channels.len() * if plan.detrend { 2 } else { 1 });

    for channel in channels {
        let key = channel.key;
        let signal = source.channel(channel.signal_index)?;
        let reference = channel.carrier_index.map(|i| source.channel(i)).transpose()?;

        let estimated = estimate_carrier(reference.unwrap_or(signal), fs, DEFAULT_ANALYSIS_WINDOW)?;
        let carrier = resolve_carrier(key, estimated, channel.set_carrier_hz);

        let reference_trace =
            reference.map(|r| RawChannelTrace::new(key, ChannelRole::Carrier, r, fs));
        let signal_trace = RawChannelTrace::new(key, ChannelRole::Signal, signal, fs);
        let envelope =
            demodulator.demodulate(&signal_trace, reference_trace.as_ref(), carrier.frequency_hz)?;
        debug!(
            channel = %key,
            carrier_hz = carrier.frequency_hz,
            samples = envelope.samples.len(),
            "Demodulated raw trace"
        );
        traces.push(trace_from(&channel, RAW_TRACE, carrier, envelope));

        if plan.detrend {
            let window = (plan.z_window * fs).round() as usize;
            let detrended = rolling_zscore(signal, window);
            let detrended_trace = RawChannelTrace::new(key, ChannelRole::Signal, &detrended, fs);
            let mut envelope =
                demodulator.demodulate(&detrended_trace, reference_trace.as_ref(), carrier.frequency_hz)?;
            mask_edges(&mut envelope.samples, (plan.z_window * envelope.sample_rate).round() as usize);
            traces.push(trace_from(&channel, DETREND_TRACE, carrier, envelope));
        }
    }

    let handshake = match (&config.signal_indices.sync, traces.first()) {
        (Some(sync), Some(time_base)) => Some(Handshake {
            to_behavior: sample_line(source.channel(sync.to_behavior)?, time_base, fs),
            from_behavior: sample_line(source.channel(sync.from_behavior)?, time_base, fs),
        }),
        (Some(_), None) => {
            warn!("Handshake channels configured but no photometry channel to sample them on");
            None
        }
        (None, _) => None,
    };

    Ok(TraceTable {
        raw_sample_rate: fs,
        light_source: config.fiber.light_source.clone(),
        behavior_offset: plan.behavior_offset,
        fiber_notes: config.fiber_notes(),
        traces,
        handshake,
    })
}

fn trace_from(
    channel: &ChannelConfiguration,
    trace_name: &str,
    carrier: CarrierEstimate,
    envelope: Envelope,
) -> DemodulatedTrace {
    DemodulatedTrace {
        channel: channel.clone(),
        trace_name: trace_name.to_string(),
        carrier,
        transform: envelope.transform,
        sample_rate: envelope.sample_rate,
        start_time: envelope.start_time,
        samples: envelope.samples,
        spectral_power: envelope.spectral_power,
    }
}

/// Set `edge` samples at both ends to `NaN`.
fn mask_edges(samples: &mut [f64], edge: usize) {
    let len = samples.len();
    let edge = edge.min(len);
    samples[..edge].fill(f64::NAN);
    samples[len - edge..].fill(f64::NAN);
}

/// Sample a digital line at the envelope times of `time_base`, taking the
/// nearest raw sample.
fn sample_line(line: &[f64], time_base: &DemodulatedTrace, raw_rate: f64) -> Vec<bool> {
    let Some(last) = line.len().checked_sub(1) else {
        return vec![false; time_base.samples.len()];
    };
    (0..time_base.samples.len())
        .map(|i| {
            let index = ((time_base.time_of(i) * raw_rate).round() as usize).min(last);
            line[index] > HANDSHAKE_THRESHOLD
        })
        .collect()
}

// ============================================================================
// Sync
// ============================================================================

/// Align a trace table onto the behavior stream and bin it to the sync rate.
///
/// Steps: trim the photometry stream at the handshake, find trial starts in
/// both streams, align and resample, add a `z` trace for every `detrend`
/// trace (dropping one z-score window at each end), add the trial clock,
/// split the penalty states, and bin by `round(behavior rate / sync rate)`.
///
/// # Errors
///
/// [`ProcessingError::MissingChannel`] without handshake lines or required
/// behavior columns, [`ProcessingError::Alignment`] when the streams cannot
/// be aligned, and [`ProcessingError::InsufficientData`] when the aligned
/// span is shorter than two z-score windows.
pub fn sync_session(
    table: &TraceTable,
    behavior: &BehaviorData,
    plan: &ProcessingPlan,
) -> ProcessingResult<SyncedSession> {
    let handshake = table.handshake.as_ref().ok_or_else(|| ProcessingError::MissingChannel {
        name: "handshake (Signal_Indices.sync)".to_string(),
    })?;
    let start = handshake_start(handshake)
        .ok_or_else(|| ProcessingError::alignment("no handshake found in the photometry stream"))?;

    let photometry = photometry_trial_starts(&handshake.from_behavior[start..handshake.len()])?;
    let behavior_starts = behavior_trial_starts(&behavior.analog)?;
    debug!(
        handshake_start = start,
        photometry_trials = photometry.len(),
        behavior_trials = behavior_starts.len(),
        "Trial landmarks"
    );

    let rate = behavior.sample_rate;
    let trimmed: Vec<&[f64]> = table
        .traces
        .iter()
        .map(|t| t.samples.get(start..).unwrap_or(&[]))
        .collect();
    let aligned = StreamAligner::new(rate).align(&photometry, &behavior_starts, &trimmed)?;

    let mut frame = behavior.analog.slice(aligned.behavior_span.clone());
    let mut photometry_columns = Vec::new();
    for (trace, samples) in table.traces.iter().zip(aligned.traces) {
        photometry_columns.push((trace.key(), trace.trace_name.clone()));
        frame.insert(trace.column_name(), ColumnKind::Continuous, samples)?;
    }

    // Post-alignment z-score of detrended traces
    let window = (plan.z_window * rate).round() as usize;
    let mut z_traces = Vec::new();
    for trace in table.traces.iter().filter(|t| t.trace_name == DETREND_TRACE) {
        let z = rolling_zscore(frame.require(&trace.column_name())?, window);
        z_traces.push((trace.key(), z));
    }
    if !z_traces.is_empty() {
        for (key, z) in z_traces {
            frame.insert(key.column_name(ZSCORE_TRACE), ColumnKind::Continuous, z)?;
            photometry_columns.push((key, ZSCORE_TRACE.to_string()));
        }
        if frame.len() <= 2 * window {
            return Err(ProcessingError::InsufficientData {
                operation: "post-alignment z-score",
                got: frame.len(),
                need: 2 * window + 1,
            });
        }
        frame = frame.slice(window..frame.len() - window);
    }

    add_trial_clock(&mut frame, rate)?;
    for penalty in PENALTY_STATES {
        if frame.column(penalty).is_none() {
            warn!(penalty, "Penalty state not in behavior stream; skipping split");
            continue;
        }
        split_penalty_states(&mut frame, &behavior.trials, penalty)?;
    }

    let factor = (rate / plan.sync_frequency).round().max(1.0) as usize;
    let binned = downsample_bins(&frame, factor);

    let mut traces = Vec::with_capacity(photometry_columns.len());
    let mut taken = HashSet::new();
    for (key, trace_name) in photometry_columns {
        let column = key.column_name(&trace_name);
        traces.push(SyncedTrace {
            key,
            trace_name,
            samples: binned.require(&column)?.to_vec(),
        });
        taken.insert(column);
    }
    let behavior_columns = binned
        .columns()
        .iter()
        .filter(|c| c.name != SESSION_CLOCK_COLUMN && !taken.contains(&c.name))
        .map(|c| BehaviorColumn {
            name: c.name.clone(),
            values: c.values.clone(),
        })
        .collect();

    let session = SyncedSession {
        timestamps: binned.require(SESSION_CLOCK_COLUMN)?.to_vec(),
        time_offset: aligned.time_offset,
        sample_rate: rate / factor as f64,
        offset_trials: aligned.offset_trials,
        correlation: aligned.correlation,
        traces,
        behavior: behavior_columns,
    };
    info!(
        samples = session.timestamps.len(),
        sample_rate = session.sample_rate,
        traces = session.traces.len(),
        "Synced session"
    );
    Ok(session)
}

// ============================================================================
// Persistence
// ============================================================================

/// Write any pipeline output as pretty-printed JSON.
///
/// # Errors
///
/// IO and encoding errors.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> ProcessingResult<()> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    debug!(path = %path.display(), "Wrote JSON output");
    Ok(())
}

/// Read a trace table written by [`save_json`].
///
/// # Errors
///
/// [`ProcessingError::MissingFile`] when the path does not exist, and IO
/// and decoding errors.
pub fn load_trace_table(path: &Path) -> ProcessingResult<TraceTable> {
    if !path.exists() {
        return Err(ProcessingError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    let file = std::io::BufReader::new(std::fs::File::open(path)?);
    Ok(serde_json::from_reader(file)?)
}
