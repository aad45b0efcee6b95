//! IIR filter design
//!
//! Elliptic and Butterworth designs in second-order-section form. Analog
//! prototypes are built in zero-pole-gain form, frequency-transformed,
//! mapped to the z-plane by the bilinear transform with prewarping, and
//! paired into sections. Every design passes a stability gate before it is
//! returned.
//!
//! Elliptic prototypes use Landen transformations of the Jacobi elliptic
//! functions, which avoids numerical root finding on the degree equation.

use std::f64::consts::PI;

use rustfft::num_complex::Complex64;
use tracing::debug;

use super::filters::{BiquadCoeffs, SosFilter};
use crate::error::{ProcessingError, ProcessingResult};

/// Elliptic response shape shared by the bandpass and low-pass designs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EllipticSpec {
    /// Prototype order (a bandpass has twice as many poles)
    pub order: usize,
    /// Passband ripple in dB
    pub ripple_db: f64,
    /// Minimum stopband attenuation in dB
    pub attenuation_db: f64,
}

impl EllipticSpec {
    /// Carrier bandpass used ahead of demodulation
    pub const CARRIER_BANDPASS: Self = Self { order: 4, ripple_db: 0.1, attenuation_db: 40.0 };

    /// Integration low-pass of the lock-in demodulator
    pub const INTEGRATION: Self = Self { order: 3, ripple_db: 0.1, attenuation_db: 40.0 };
}

/// Design an elliptic bandpass centred on `center` with total width
/// `bandwidth`, both in Hz.
///
/// # Errors
///
/// [`ProcessingError::UnstableFilter`] when a band edge falls outside
/// (0, Nyquist) or the resulting cascade has a pole on or outside the unit
/// circle.
pub fn design_bandpass(
    center: f64,
    bandwidth: f64,
    sample_rate: f64,
    order: usize,
    attenuation_db: f64,
    ripple_db: f64,
) -> ProcessingResult<SosFilter> {
    check_order(order)?;
    check_ripple(ripple_db, attenuation_db)?;
    if !(bandwidth > 0.0) {
        return Err(ProcessingError::invalid_parameter(
            "bandwidth",
            format!("{bandwidth} Hz must be positive"),
        ));
    }

    let low = center - bandwidth / 2.0;
    let high = center + bandwidth / 2.0;
    let w_low = normalized_edge(low, sample_rate)?;
    let w_high = normalized_edge(high, sample_rate)?;

    let warped_low = prewarp(w_low);
    let warped_high = prewarp(w_high);
    let wo = (warped_low * warped_high).sqrt();
    let bw = warped_high - warped_low;

    let proto = elliptic_prototype(order, ripple_db, attenuation_db);
    let digital = proto.lowpass_to_bandpass(wo, bw).bilinear(BILINEAR_FS);
    let sos = digital.to_sos();

    checked(sos, || format!("bandpass {low:.2}-{high:.2} Hz at {sample_rate} Hz"))
}

/// Design an elliptic low-pass with passband edge `cutoff` Hz.
///
/// # Errors
///
/// [`ProcessingError::UnstableFilter`] when the cutoff is outside
/// (0, Nyquist) or the design is unstable.
pub fn design_elliptic_lowpass(
    cutoff: f64,
    sample_rate: f64,
    spec: EllipticSpec,
) -> ProcessingResult<SosFilter> {
    check_order(spec.order)?;
    check_ripple(spec.ripple_db, spec.attenuation_db)?;
    let wn = normalized_edge(cutoff, sample_rate)?;

    let proto = elliptic_prototype(spec.order, spec.ripple_db, spec.attenuation_db);
    let sos = proto.lowpass_to_lowpass(prewarp(wn)).bilinear(BILINEAR_FS).to_sos();

    checked(sos, || format!("elliptic low-pass {cutoff} Hz at {sample_rate} Hz"))
}

/// Design a Butterworth low-pass with -3 dB point at `cutoff` Hz.
///
/// # Errors
///
/// [`ProcessingError::UnstableFilter`] when the cutoff is outside
/// (0, Nyquist) or the design is unstable.
pub fn design_butterworth_lowpass(
    cutoff: f64,
    sample_rate: f64,
    order: usize,
) -> ProcessingResult<SosFilter> {
    check_order(order)?;
    let wn = normalized_edge(cutoff, sample_rate)?;

    let sos = butterworth_prototype(order)
        .lowpass_to_lowpass(prewarp(wn))
        .bilinear(BILINEAR_FS)
        .to_sos();

    checked(sos, || format!("Butterworth low-pass {cutoff} Hz at {sample_rate} Hz"))
}

// ============================================================================
// Validation
// ============================================================================

/// Designs run at a normalized rate where Nyquist is 1.
const BILINEAR_FS: f64 = 2.0;

fn check_order(order: usize) -> ProcessingResult<()> {
    if order == 0 || order > 16 {
        return Err(ProcessingError::invalid_parameter(
            "order",
            format!("{order} is outside 1..=16"),
        ));
    }
    Ok(())
}

fn check_ripple(ripple_db: f64, attenuation_db: f64) -> ProcessingResult<()> {
    if !(ripple_db > 0.0) || !(attenuation_db > ripple_db) {
        return Err(ProcessingError::invalid_parameter(
            "ripple",
            format!("need 0 < ripple ({ripple_db} dB) < attenuation ({attenuation_db} dB)"),
        ));
    }
    Ok(())
}

/// Band edge as a fraction of Nyquist, required to lie strictly inside (0, 1).
fn normalized_edge(freq: f64, sample_rate: f64) -> ProcessingResult<f64> {
    let nyquist = sample_rate / 2.0;
    let wn = freq / nyquist;
    if wn > 0.0 && wn < 1.0 {
        Ok(wn)
    } else {
        Err(ProcessingError::unstable(format!(
            "band edge {freq} Hz is outside the available spectrum (0, {nyquist}) Hz"
        )))
    }
}

fn prewarp(wn: f64) -> f64 {
    2.0 * BILINEAR_FS * (PI * wn / BILINEAR_FS).tan()
}

fn checked(sos: SosFilter, describe: impl FnOnce() -> String) -> ProcessingResult<SosFilter> {
    let radius = sos.max_pole_radius();
    if sos.is_stable() {
        debug!(sections = sos.len(), max_pole_radius = radius, "Designed filter");
        Ok(sos)
    } else {
        Err(ProcessingError::unstable(format!(
            "{}: pole radius {radius} is not inside the unit circle",
            describe()
        )))
    }
}

// ============================================================================
// Zero-pole-gain representation
// ============================================================================

#[derive(Clone, Debug)]
struct Zpk {
    zeros: Vec<Complex64>,
    poles: Vec<Complex64>,
    gain: f64,
}

impl Zpk {
    fn degree(&self) -> usize {
        self.poles.len().saturating_sub(self.zeros.len())
    }

    fn lowpass_to_lowpass(self, wo: f64) -> Self {
        let degree = self.degree();
        Self {
            zeros: self.zeros.iter().map(|&z| z * wo).collect(),
            poles: self.poles.iter().map(|&p| p * wo).collect(),
            gain: self.gain * wo.powi(degree as i32),
        }
    }

    fn lowpass_to_bandpass(self, wo: f64, bw: f64) -> Self {
        let degree = self.degree();
        let split = |roots: &[Complex64]| -> Vec<Complex64> {
            let scaled: Vec<Complex64> = roots.iter().map(|&r| r * (bw / 2.0)).collect();
            let mut out = Vec::with_capacity(2 * scaled.len());
            for &r in &scaled {
                out.push(r + (r * r - wo * wo).sqrt());
            }
            for &r in &scaled {
                out.push(r - (r * r - wo * wo).sqrt());
            }
            out
        };

        let mut zeros = split(&self.zeros);
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: split(&self.poles),
            gain: self.gain * bw.powi(degree as i32),
        }
    }

    fn bilinear(self, fs: f64) -> Self {
        let fs2 = Complex64::new(2.0 * fs, 0.0);
        let degree = self.degree();

        let num: Complex64 = self.zeros.iter().map(|&z| fs2 - z).product();
        let den: Complex64 = self.poles.iter().map(|&p| fs2 - p).product();

        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
        zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: self.poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    /// Pair roots into second-order sections.
    ///
    /// Poles closest to the unit circle are paired first with their nearest
    /// zeros and end up last in the cascade. The gain goes on the first
    /// section.
    fn to_sos(&self) -> SosFilter {
        let mut zeros = self.zeros.clone();
        let mut poles = self.poles.clone();
        let origin = Complex64::new(0.0, 0.0);
        while zeros.len() < poles.len() {
            zeros.push(origin);
        }
        while poles.len() < zeros.len() {
            poles.push(origin);
        }
        if poles.is_empty() {
            return SosFilter::new(vec![BiquadCoeffs {
                b: [self.gain, 0.0, 0.0],
                a: [1.0, 0.0, 0.0],
            }]);
        }
        if poles.len() % 2 == 1 {
            zeros.push(origin);
            poles.push(origin);
        }
        let n_sections = poles.len() / 2;

        let mut z = Root::group(&zeros);
        let mut p = Root::group(&poles);
        let mut pairs: Vec<([Complex64; 2], [Complex64; 2])> = Vec::with_capacity(n_sections);

        for _ in 0..n_sections {
            let Some(p1_idx) = argmin(&p, |r| (1.0 - r.value().norm()).abs()) else {
                break;
            };
            let p1 = p.remove(p1_idx);
            let reals_left = p.iter().filter(|r| r.is_real()).count();

            let section = if p1.is_real() && reals_left == 0 {
                // Last real pole: first-order section
                let z1 = take_nearest(&mut z, p1.value(), Some(true)).unwrap_or(Root::Real(0.0));
                ([z1.value(), origin], [p1.value(), origin])
            } else {
                let real_zeros = z.iter().filter(|r| r.is_real()).count();
                let z1 = if !p1.is_real() && real_zeros == 1 {
                    take_nearest(&mut z, p1.value(), Some(false))
                } else {
                    take_nearest(&mut z, p1.value(), None)
                }
                .unwrap_or(Root::Real(0.0));

                match (p1, z1) {
                    (Root::Pair(pc), Root::Pair(zc)) => ([zc, zc.conj()], [pc, pc.conj()]),
                    (Root::Pair(pc), Root::Real(zr)) => {
                        let z2 = take_nearest(&mut z, pc, Some(true)).unwrap_or(Root::Real(0.0));
                        ([Complex64::new(zr, 0.0), z2.value()], [pc, pc.conj()])
                    }
                    (Root::Real(pr), Root::Pair(zc)) => {
                        let p2 = take_nearest(&mut p, zc, Some(true)).unwrap_or(Root::Real(0.0));
                        ([zc, zc.conj()], [Complex64::new(pr, 0.0), p2.value()])
                    }
                    (Root::Real(pr), Root::Real(zr)) => {
                        let p2_idx = p
                            .iter()
                            .enumerate()
                            .filter(|(_, r)| r.is_real())
                            .min_by(|(_, a), (_, b)| {
                                let da = (a.value().norm() - 1.0).abs();
                                let db = (b.value().norm() - 1.0).abs();
                                da.total_cmp(&db)
                            })
                            .map(|(i, _)| i);
                        let p2 = p2_idx.map_or(Root::Real(0.0), |i| p.remove(i));
                        let z2 = take_nearest(&mut z, p2.value(), Some(true)).unwrap_or(Root::Real(0.0));
                        (
                            [Complex64::new(zr, 0.0), z2.value()],
                            [Complex64::new(pr, 0.0), p2.value()],
                        )
                    }
                }
            };
            pairs.push(section);
        }

        pairs.reverse();
        let sections = pairs
            .iter()
            .enumerate()
            .map(|(i, (zs, ps))| {
                let k = if i == 0 { self.gain } else { 1.0 };
                let b = quadratic(zs[0], zs[1]);
                let a = quadratic(ps[0], ps[1]);
                BiquadCoeffs {
                    b: [k * b[0], k * b[1], k * b[2]],
                    a,
                }
            })
            .collect();
        SosFilter::new(sections)
    }
}

/// Coefficients of (x - r1)(x - r2), real part only.
fn quadratic(r1: Complex64, r2: Complex64) -> [f64; 3] {
    [1.0, -(r1 + r2).re, (r1 * r2).re]
}

/// A real root, or one representative (positive imaginary part) of a
/// conjugate pair.
#[derive(Clone, Copy, Debug)]
enum Root {
    Real(f64),
    Pair(Complex64),
}

impl Root {
    fn value(self) -> Complex64 {
        match self {
            Self::Real(r) => Complex64::new(r, 0.0),
            Self::Pair(c) => c,
        }
    }

    fn is_real(self) -> bool {
        matches!(self, Self::Real(_))
    }

    /// Collapse conjugate pairs to one representative.
    fn group(roots: &[Complex64]) -> Vec<Self> {
        let tol = 100.0 * f64::EPSILON;
        let mut out = Vec::with_capacity(roots.len());
        for r in roots {
            if r.im.abs() <= tol * r.norm().max(1.0) {
                out.push(Self::Real(r.re));
            } else if r.im > 0.0 {
                out.push(Self::Pair(*r));
            }
        }
        out
    }
}

fn argmin<T: Copy>(items: &[T], key: impl Fn(T) -> f64) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| key(**a).total_cmp(&key(**b)))
        .map(|(i, _)| i)
}

/// Remove and return the root nearest `target`, optionally restricted to
/// real (`Some(true)`) or complex (`Some(false)`) roots.
fn take_nearest(roots: &mut Vec<Root>, target: Complex64, real: Option<bool>) -> Option<Root> {
    let idx = roots
        .iter()
        .enumerate()
        .filter(|(_, r)| real.map_or(true, |want| r.is_real() == want))
        .min_by(|(_, a), (_, b)| {
            (a.value() - target).norm().total_cmp(&(b.value() - target).norm())
        })
        .map(|(i, _)| i)?;
    Some(roots.remove(idx))
}

// ============================================================================
// Analog prototypes
// ============================================================================

/// Butterworth prototype with unit -3 dB frequency.
fn butterworth_prototype(order: usize) -> Zpk {
    let n = order as i64;
    let poles = (-n + 1..n)
        .step_by(2)
        .map(|m| -Complex64::from_polar(1.0, PI * m as f64 / (2.0 * order as f64)))
        .collect();
    Zpk { zeros: Vec::new(), poles, gain: 1.0 }
}

/// Elliptic prototype with unit passband edge.
fn elliptic_prototype(order: usize, ripple_db: f64, attenuation_db: f64) -> Zpk {
    let j = Complex64::new(0.0, 1.0);
    let n = order as f64;
    let half = order / 2;

    let ep = (10f64.powf(ripple_db / 10.0) - 1.0).sqrt();
    let es = (10f64.powf(attenuation_db / 10.0) - 1.0).sqrt();
    let k1 = ep / es;
    let k = elliptic_degree(order, k1);

    let u: Vec<f64> = (1..=half).map(|i| (2.0 * i as f64 - 1.0) / n).collect();

    let mut zeros = Vec::with_capacity(2 * half);
    for &ui in &u {
        let zeta = cde(Complex64::new(ui, 0.0), k);
        let z = j / (zeta * k);
        zeros.push(z);
        zeros.push(z.conj());
    }

    let v0 = (-j * asne(j / ep, k1) / n).re;

    let mut poles = Vec::with_capacity(order);
    for &ui in &u {
        let p = j * cde(Complex64::new(ui, -v0), k);
        poles.push(p);
        poles.push(p.conj());
    }
    if order % 2 == 1 {
        let p0 = j * sne(Complex64::new(0.0, v0), k);
        poles.push(Complex64::new(p0.re, 0.0));
    }

    let h0 = if order % 2 == 0 { 1.0 / (1.0 + ep * ep).sqrt() } else { 1.0 };
    let num: Complex64 = poles.iter().map(|&p| -p).product();
    let den: Complex64 = zeros.iter().map(|&z| -z).product();
    let gain = h0 * (num / den).re;

    Zpk { zeros, poles, gain }
}

/// Solve the degree equation for the selectivity modulus.
fn elliptic_degree(order: usize, k1: f64) -> f64 {
    let n = order as f64;
    let k1p = (1.0 - k1 * k1).sqrt();
    let prod: f64 = (1..=order / 2)
        .map(|i| sne(Complex64::new((2.0 * i as f64 - 1.0) / n, 0.0), k1p).re)
        .product();
    let kp = k1p.powi(order as i32) * prod.powi(4);
    (1.0 - kp * kp).sqrt()
}

/// Descending Landen moduli of `k`.
fn landen(k: f64) -> Vec<f64> {
    let mut moduli = Vec::new();
    let mut k = k;
    while k > f64::EPSILON && moduli.len() < 16 {
        k = (k / (1.0 + (1.0 - k * k).sqrt())).powi(2);
        moduli.push(k);
    }
    moduli
}

/// Jacobi `cd(uK, k)` by ascending Landen iteration.
fn cde(u: Complex64, k: f64) -> Complex64 {
    ascend((u * (PI / 2.0)).cos(), k)
}

/// Jacobi `sn(uK, k)` by ascending Landen iteration.
fn sne(u: Complex64, k: f64) -> Complex64 {
    ascend((u * (PI / 2.0)).sin(), k)
}

fn ascend(mut w: Complex64, k: f64) -> Complex64 {
    for &v in landen(k).iter().rev() {
        w = (1.0 + v) * w / (1.0 + v * w * w);
    }
    w
}

/// Inverse of [`cde`], normalized by K.
fn acde(w: Complex64, k: f64) -> Complex64 {
    let moduli = landen(k);
    let mut w = w;
    let mut previous = k;
    for &v in &moduli {
        w = w / (1.0 + (1.0 - w * w * previous * previous).sqrt()) * 2.0 / (1.0 + v);
        previous = v;
    }
    w.acos() * (2.0 / PI)
}

/// Inverse of [`sne`], normalized by K.
fn asne(w: Complex64, k: f64) -> Complex64 {
    1.0 - acde(w, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 6103.515625;

    fn db(x: f64) -> f64 {
        20.0 * x.log10()
    }

    #[test]
    fn test_landen_functions_invert() {
        let k = 0.6;
        let u = Complex64::new(0.37, 0.0);
        let w = sne(u, k);
        let back = asne(w, k);
        assert!((back - u).norm() < 1e-9);
    }

    #[test]
    fn test_carrier_bandpass_zero_phase() {
        let spec = EllipticSpec::CARRIER_BANDPASS;
        let filter =
            design_bandpass(500.0, 50.0, FS, spec.order, spec.attenuation_db, spec.ripple_db).unwrap();
        let x: Vec<f64> = (0..12_000)
            .map(|i| (2.0 * std::f64::consts::PI * 500.0 * i as f64 / FS).sin())
            .collect();
        let y = filter.filtfilt(&x);
        assert_eq!(y.len(), x.len());

        let interior = 3_000..9_000;
        let peak = (-20i64..=20)
            .map(|lag| {
                let score: f64 = interior
                    .clone()
                    .map(|i| x[i] * y[(i as i64 + lag) as usize])
                    .sum();
                (lag, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(lag, _)| lag)
            .unwrap();
        assert_eq!(peak, 0);

        for i in interior {
            assert!((y[i] - x[i]).abs() < 0.05, "sample {i}");
        }
    }

    #[test]
    fn test_butterworth_lowpass_response() {
        let sos = design_butterworth_lowpass(240.0, FS, 3).unwrap();
        assert_eq!(sos.len(), 2);
        assert!((sos.dc_gain() - 1.0).abs() < 1e-9);
        // -3 dB at the cutoff
        assert!((db(sos.magnitude_at(240.0, FS)) + 3.0103).abs() < 0.01);
        assert!(sos.magnitude_at(1000.0, FS) < 0.02);
    }

    #[test]
    fn test_elliptic_lowpass_response() {
        let sos = design_elliptic_lowpass(20.0, 600.0, EllipticSpec::INTEGRATION).unwrap();
        assert_eq!(sos.len(), 2);
        // Odd order: unit gain at DC
        assert!((sos.dc_gain() - 1.0).abs() < 1e-6);
        // Passband ripple bounded by 0.1 dB
        for f in [1.0, 5.0, 10.0, 15.0, 19.9] {
            let g = db(sos.magnitude_at(f, 600.0));
            assert!(g < 1e-6 && g > -0.1 - 1e-3, "{f} Hz: {g} dB");
        }
        // Stopband at least 40 dB down well past the transition band
        for f in [90.0, 150.0, 250.0, 290.0] {
            assert!(db(sos.magnitude_at(f, 600.0)) < -40.0 + 1e-3, "{f} Hz");
        }
    }

    #[test]
    fn test_bandpass_response() {
        let sos = design_bandpass(500.0, 50.0, FS, 4, 40.0, 0.1).unwrap();
        assert_eq!(sos.len(), 4);
        assert!(sos.is_stable());

        let centre = db(sos.magnitude_at(500.0, FS));
        assert!(centre < 1e-6 && centre > -0.1 - 1e-3, "{centre} dB");
        for f in [480.0, 490.0, 510.0, 520.0] {
            let g = db(sos.magnitude_at(f, FS));
            assert!(g > -0.1 - 1e-3, "{f} Hz: {g} dB");
        }
        for f in [100.0, 300.0, 800.0, 2000.0] {
            assert!(db(sos.magnitude_at(f, FS)) < -40.0 + 1e-3, "{f} Hz");
        }
    }

    #[test]
    fn test_bandwidth_beyond_spectrum_is_unstable() {
        let err = design_bandpass(500.0, 1200.0, FS, 4, 40.0, 0.1).unwrap_err();
        assert!(matches!(err, ProcessingError::UnstableFilter { .. }));

        let err = design_bandpass(3000.0, 400.0, FS, 4, 40.0, 0.1).unwrap_err();
        assert!(matches!(err, ProcessingError::UnstableFilter { .. }));

        let err = design_butterworth_lowpass(4000.0, FS, 3).unwrap_err();
        assert!(matches!(err, ProcessingError::UnstableFilter { .. }));
    }

    #[test]
    fn test_invalid_design_parameters() {
        assert!(matches!(
            design_bandpass(500.0, 50.0, FS, 0, 40.0, 0.1),
            Err(ProcessingError::InvalidParameter { parameter: "order", .. })
        ));
        assert!(matches!(
            design_bandpass(500.0, -5.0, FS, 4, 40.0, 0.1),
            Err(ProcessingError::InvalidParameter { parameter: "bandwidth", .. })
        ));
    }
}
