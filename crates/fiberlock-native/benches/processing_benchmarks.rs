//! Benchmarks for signal processing modules

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use fiberlock_core::{ChannelKey, ChannelRole, EmissionColor, Hemisphere, ProcessingPlan, RawChannelTrace};
use fiberlock_native::processing::{
    carrier::estimate_carrier,
    demod::{Demodulate, LockInDemodulator, SpectrogramDemodulator},
    design::{design_bandpass, EllipticSpec},
    normalize::rolling_zscore,
};

const SAMPLE_RATE: f64 = 6103.515625;

/// Generate a 500 Hz carrier modulated by a slow envelope, with pseudo-noise
fn generate_modulated(n: usize) -> Vec<f64> {
    use std::f64::consts::TAU;

    (0..n)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE;
            let envelope = 1.0 + 0.5 * (TAU * 0.2 * t).sin();
            let noise = (i as f64 * 0.123).sin() * 0.05; // Pseudo-noise
            envelope * (TAU * 500.0 * t).sin() + noise
        })
        .collect()
}

fn key() -> ChannelKey {
    ChannelKey::new(Hemisphere::Right, EmissionColor::Green)
}

fn bench_zero_phase_bandpass(c: &mut Criterion) {
    let mut group = c.benchmark_group("zero_phase_bandpass");

    let spec = EllipticSpec::CARRIER_BANDPASS;
    let filter = design_bandpass(500.0, 50.0, SAMPLE_RATE, spec.order, spec.attenuation_db, spec.ripple_db)
        .expect("carrier bandpass is stable");

    for seconds in [1usize, 10, 60].iter() {
        let samples = generate_modulated(seconds * SAMPLE_RATE as usize);

        group.bench_with_input(BenchmarkId::from_parameter(seconds), seconds, |b, _| {
            b.iter(|| black_box(filter.filtfilt(black_box(&samples))));
        });
    }

    group.finish();
}

fn bench_carrier_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("carrier_estimation");

    let samples = generate_modulated(1 << 16);
    for window in [1usize << 12, 1 << 14, 1 << 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, &window| {
            b.iter(|| black_box(estimate_carrier(black_box(&samples), SAMPLE_RATE, window)));
        });
    }

    group.finish();
}

fn bench_demodulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("demodulation");
    group.sample_size(10);

    let samples = generate_modulated(10 * SAMPLE_RATE as usize);
    let signal = RawChannelTrace::new(key(), ChannelRole::Signal, &samples, SAMPLE_RATE);
    let mut plan = ProcessingPlan::with_sampling_frequency(SAMPLE_RATE);
    plan.z_window = 1.0;

    let spectrogram = SpectrogramDemodulator::from_plan(&plan);
    group.bench_function("spectrogram", |b| {
        b.iter(|| black_box(spectrogram.demodulate(black_box(&signal), None, 500.0)));
    });

    let lock_in = LockInDemodulator::from_plan(&plan);
    group.bench_function("lock_in", |b| {
        b.iter(|| black_box(lock_in.demodulate(black_box(&signal), None, 500.0)));
    });

    group.finish();
}

fn bench_rolling_zscore(c: &mut Criterion) {
    let mut group = c.benchmark_group("rolling_zscore");

    let samples = generate_modulated(60 * SAMPLE_RATE as usize);
    for seconds in [1usize, 10].iter() {
        let window = seconds * SAMPLE_RATE as usize;
        group.bench_with_input(BenchmarkId::from_parameter(seconds), &window, |b, &window| {
            b.iter(|| black_box(rolling_zscore(black_box(&samples), window)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_zero_phase_bandpass,
    bench_carrier_estimation,
    bench_demodulation,
    bench_rolling_zscore,
);

criterion_main!(benches);
