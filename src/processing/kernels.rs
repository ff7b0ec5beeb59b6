//! Numeric kernels applied by processing labels.
//!
//! Every kernel is a pure function of its inputs. The resolver only talks to the
//! [`SignalKernels`] trait, so alternative implementations (or instrumented ones in
//! tests) can be injected without touching the caching logic.
//!
//! ## Filters
//!
//! Low-, high- and band-pass filters are Butterworth designs realised as cascades of
//! second-order sections (`biquad`). They run forward and then backward over the data,
//! giving zero phase distortion at twice the nominal attenuation.
//!
//! ## Spectra
//!
//! - Fourier amplitude spectra use `rustfft` and are scaled by `dt`.
//! - Response spectra are 5%-damped pseudo-spectral accelerations computed with
//!   Newmark's average-acceleration method.

use crate::error::{AppResult, TsError};
use crate::processing::labels::{LabelType, ProcessingLabel};
use crate::signal::{Orientation, RawSignal};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Damping ratio used for response spectra.
pub const RESPONSE_DAMPING: f64 = 0.05;

/// Number of periods sampled by the response spectrum.
pub const RESPONSE_PERIODS: usize = 100;

/// One-sided Fourier amplitude spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Frequencies in Hz, from zero up to Nyquist
    pub frequencies: Vec<f64>,
    /// Amplitude at each frequency
    pub amplitudes: Vec<f64>,
}

/// Pseudo-spectral acceleration response spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpectrum {
    /// Oscillator periods in seconds
    pub periods: Vec<f64>,
    /// Pseudo-spectral acceleration at each period (same unit as the input)
    pub psa: Vec<f64>,
}

/// Pure signal-processing functions consumed by the record resolver.
pub trait SignalKernels: Send + Sync {
    /// Apply one processing step to a signal.
    fn apply(&self, label: &ProcessingLabel, signal: RawSignal) -> AppResult<RawSignal>;

    /// One-sided Fourier amplitude spectrum of a time series.
    fn frequency_spectrum(&self, samples: &[f64], dt: f64) -> Spectrum;

    /// Response spectrum of an acceleration time series.
    fn response_spectrum(&self, acceleration: &[f64], dt: f64) -> ResponseSpectrum;
}

/// The kernels shipped with the crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKernels;

impl SignalKernels for DefaultKernels {
    fn apply(&self, label: &ProcessingLabel, mut signal: RawSignal) -> AppResult<RawSignal> {
        let param = |key: &str| {
            label.param(key).ok_or_else(|| TsError::InvalidLabel {
                label: label.name.clone(),
                reason: format!("missing hyperparameter '{}'", key),
            })
        };
        let fs = signal.sampling_rate();

        match label.label_type {
            LabelType::LowpassFilter => {
                let sections = butterworth(Type::LowPass, fs, param("fc")?, param("N")?)?;
                for component in signal.components_mut() {
                    filtfilt(&sections, &mut component.samples);
                }
            }
            LabelType::HighpassFilter => {
                let sections = butterworth(Type::HighPass, fs, param("fc")?, param("N")?)?;
                for component in signal.components_mut() {
                    filtfilt(&sections, &mut component.samples);
                }
            }
            LabelType::BandpassFilter => {
                let order = param("N")?;
                let mut sections = butterworth(Type::HighPass, fs, param("fcs")?, order)?;
                sections.extend(butterworth(Type::LowPass, fs, param("fce")?, order)?);
                for component in signal.components_mut() {
                    filtfilt(&sections, &mut component.samples);
                }
            }
            LabelType::Taper => {
                let flag = param("flag")? as u8;
                let fraction = param("m")?;
                for component in signal.components_mut() {
                    taper(&mut component.samples, flag, fraction);
                }
            }
            LabelType::Scale => {
                let factor = param("factor")?;
                for component in signal.components_mut() {
                    component.samples.iter_mut().for_each(|v| *v *= factor);
                }
            }
            LabelType::Rotate => rotate(&mut signal, param("angle")?)?,
            LabelType::Integrate => {
                signal.kind = signal.kind.integrated().ok_or_else(|| {
                    TsError::Processing(format!(
                        "label '{}' cannot integrate a {:?} signal",
                        label.name, signal.kind
                    ))
                })?;
                let dt = signal.dt;
                for component in signal.components_mut() {
                    component.samples = integrate(&component.samples, dt);
                }
            }
            LabelType::Differentiate => {
                signal.kind = signal.kind.differentiated().ok_or_else(|| {
                    TsError::Processing(format!(
                        "label '{}' cannot differentiate a {:?} signal",
                        label.name, signal.kind
                    ))
                })?;
                let dt = signal.dt;
                for component in signal.components_mut() {
                    component.samples = differentiate(&component.samples, dt);
                }
            }
        }

        Ok(signal)
    }

    fn frequency_spectrum(&self, samples: &[f64], dt: f64) -> Spectrum {
        let n = samples.len();
        if n == 0 {
            return Spectrum {
                frequencies: Vec::new(),
                amplitudes: Vec::new(),
            };
        }

        let mut buffer: Vec<Complex<f64>> = samples.iter().map(|&v| Complex::new(v, 0.0)).collect();
        let mut planner = FftPlanner::new();
        planner.plan_fft_forward(n).process(&mut buffer);

        let bins = n / 2 + 1;
        let df = 1.0 / (n as f64 * dt);
        Spectrum {
            frequencies: (0..bins).map(|i| i as f64 * df).collect(),
            amplitudes: buffer.iter().take(bins).map(|c| c.norm() * dt).collect(),
        }
    }

    fn response_spectrum(&self, acceleration: &[f64], dt: f64) -> ResponseSpectrum {
        let periods = log_periods(0.01, 10.0, RESPONSE_PERIODS);
        let psa = periods
            .iter()
            .map(|&period| {
                let omega = 2.0 * PI / period;
                omega * omega * peak_sdof_displacement(acceleration, dt, omega, RESPONSE_DAMPING)
            })
            .collect();
        ResponseSpectrum { periods, psa }
    }
}

/// Second-order sections of an order-`order` Butterworth filter.
fn butterworth(
    filter: Type<f64>,
    fs: f64,
    cutoff: f64,
    order: f64,
) -> AppResult<Vec<Coefficients<f64>>> {
    if cutoff >= fs / 2.0 {
        return Err(TsError::Processing(format!(
            "cutoff {} Hz is at or above the Nyquist frequency {} Hz",
            cutoff,
            fs / 2.0
        )));
    }

    let order = order as usize;
    (0..order / 2)
        .map(|k| {
            let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
            let q = 1.0 / (2.0 * theta.cos());
            Coefficients::<f64>::from_params(filter, fs.hz(), cutoff.hz(), q)
                .map_err(|e| TsError::Processing(format!("filter design failed: {:?}", e)))
        })
        .collect()
}

/// Zero-phase filtering: forward pass, then backward pass.
fn filtfilt(sections: &[Coefficients<f64>], samples: &mut [f64]) {
    for section in sections {
        let mut forward = DirectForm2Transposed::<f64>::new(*section);
        samples.iter_mut().for_each(|v| *v = forward.run(*v));

        let mut backward = DirectForm2Transposed::<f64>::new(*section);
        samples.iter_mut().rev().for_each(|v| *v = backward.run(*v));
    }
}

/// Cosine taper over a fraction of the record. flag: 0 = front, 1 = end, 2 = both.
fn taper(samples: &mut [f64], flag: u8, fraction: f64) {
    let n = samples.len();
    let width = ((n as f64) * fraction).round() as usize;
    if width < 2 {
        return;
    }

    for i in 0..width {
        let w = 0.5 * (1.0 - (PI * i as f64 / (width - 1) as f64).cos());
        if flag == 0 || flag == 2 {
            samples[i] *= w;
        }
        if flag == 1 || flag == 2 {
            samples[n - 1 - i] *= w;
        }
    }
}

/// Rotate the horizontal pair clockwise by `angle` degrees.
fn rotate(signal: &mut RawSignal, angle: f64) -> AppResult<()> {
    let (az1, az2) = match (signal.h1.orientation, signal.h2.orientation) {
        (Orientation::Azimuth(a), Orientation::Azimuth(b)) => (a, b),
        _ => {
            return Err(TsError::Processing(
                "rotation requires two horizontal components".to_string(),
            ))
        }
    };

    let (sin, cos) = angle.to_radians().sin_cos();
    let npts = signal.h1.samples.len().min(signal.h2.samples.len());
    for i in 0..npts {
        let x = signal.h1.samples[i];
        let y = signal.h2.samples[i];
        signal.h1.samples[i] = cos * x + sin * y;
        signal.h2.samples[i] = -sin * x + cos * y;
    }
    signal.h1.orientation = Orientation::Azimuth((az1 + angle).rem_euclid(360.0));
    signal.h2.orientation = Orientation::Azimuth((az2 + angle).rem_euclid(360.0));
    Ok(())
}

/// Cumulative trapezoidal integral starting at zero.
pub fn integrate(samples: &[f64], dt: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut acc = 0.0;
    for (i, v) in samples.iter().enumerate() {
        if i > 0 {
            acc += 0.5 * (samples[i - 1] + v) * dt;
        }
        out.push(acc);
    }
    out
}

/// Central differences in the interior, one-sided at the ends.
pub fn differentiate(samples: &[f64], dt: f64) -> Vec<f64> {
    let n = samples.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    (samples[1] - samples[0]) / dt
                } else if i == n - 1 {
                    (samples[n - 1] - samples[n - 2]) / dt
                } else {
                    (samples[i + 1] - samples[i - 1]) / (2.0 * dt)
                }
            })
            .collect(),
    }
}

fn log_periods(start: f64, end: f64, count: usize) -> Vec<f64> {
    let (l0, l1) = (start.log10(), end.log10());
    (0..count)
        .map(|i| 10f64.powf(l0 + (l1 - l0) * i as f64 / (count - 1) as f64))
        .collect()
}

/// Peak relative displacement of a unit-mass oscillator under base acceleration.
fn peak_sdof_displacement(ground: &[f64], dt: f64, omega: f64, zeta: f64) -> f64 {
    if ground.is_empty() {
        return 0.0;
    }

    const GAMMA: f64 = 0.5;
    const BETA: f64 = 0.25;

    let k = omega * omega;
    let c = 2.0 * zeta * omega;
    let a1 = 1.0 / (BETA * dt * dt) + GAMMA * c / (BETA * dt);
    let a2 = 1.0 / (BETA * dt) + (GAMMA / BETA - 1.0) * c;
    let a3 = (1.0 / (2.0 * BETA) - 1.0) + dt * (GAMMA / (2.0 * BETA) - 1.0) * c;
    let k_hat = k + a1;

    let (mut u, mut v) = (0.0_f64, 0.0_f64);
    let mut a = -ground[0];
    let mut peak = 0.0_f64;

    for &ag in &ground[1..] {
        let p_hat = -ag + a1 * u + a2 * v + a3 * a;
        let u_next = p_hat / k_hat;
        let v_next = GAMMA / (BETA * dt) * (u_next - u)
            + (1.0 - GAMMA / BETA) * v
            + dt * (1.0 - GAMMA / (2.0 * BETA)) * a;
        let a_next = (u_next - u) / (BETA * dt * dt) - v / (BETA * dt) - (1.0 / (2.0 * BETA) - 1.0) * a;

        u = u_next;
        v = v_next;
        a = a_next;
        peak = peak.max(u.abs());
    }

    peak
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Component, MotionKind};

    fn sine_signal(freq: f64, dt: f64, npts: usize) -> RawSignal {
        let samples: Vec<f64> = (0..npts)
            .map(|i| (2.0 * PI * freq * i as f64 * dt).sin())
            .collect();
        RawSignal {
            dt,
            kind: MotionKind::Velocity,
            h1: Component::new(Orientation::Azimuth(0.0), samples.clone()),
            h2: Component::new(Orientation::Azimuth(90.0), samples.clone()),
            ver: Component::new(Orientation::Up, samples),
        }
    }

    fn rms(samples: &[f64]) -> f64 {
        (samples.iter().map(|v| v * v).sum::<f64>() / samples.len() as f64).sqrt()
    }

    #[test]
    fn test_lowpass_attenuates_high_frequency() {
        let label =
            ProcessingLabel::new("lp", LabelType::LowpassFilter, [("fc", 1.0), ("N", 4.0)]).unwrap();
        let signal = sine_signal(20.0, 0.01, 2000);
        let before = rms(&signal.h1.samples);
        let filtered = DefaultKernels.apply(&label, signal).unwrap();
        let after = rms(&filtered.h1.samples[200..1800]);
        assert!(after < before * 0.01, "rms {} -> {}", before, after);
    }

    #[test]
    fn test_lowpass_keeps_passband() {
        let label =
            ProcessingLabel::new("lp", LabelType::LowpassFilter, [("fc", 10.0), ("N", 4.0)])
                .unwrap();
        let signal = sine_signal(0.5, 0.01, 4000);
        let before = rms(&signal.h1.samples[500..3500]);
        let filtered = DefaultKernels.apply(&label, signal).unwrap();
        let after = rms(&filtered.h1.samples[500..3500]);
        assert!((after - before).abs() / before < 0.05);
    }

    #[test]
    fn test_cutoff_above_nyquist_is_rejected() {
        let label =
            ProcessingLabel::new("lp", LabelType::LowpassFilter, [("fc", 80.0), ("N", 4.0)])
                .unwrap();
        let err = DefaultKernels.apply(&label, sine_signal(1.0, 0.01, 100)).unwrap_err();
        assert!(matches!(err, TsError::Processing(_)));
    }

    #[test]
    fn test_integrate_and_differentiate_change_kind() {
        let integ = ProcessingLabel::new("i", LabelType::Integrate, Vec::<(String, f64)>::new())
            .unwrap();
        let diff =
            ProcessingLabel::new("d", LabelType::Differentiate, Vec::<(String, f64)>::new())
                .unwrap();

        let disp = DefaultKernels.apply(&integ, sine_signal(1.0, 0.01, 100)).unwrap();
        assert_eq!(disp.kind, MotionKind::Displacement);
        assert!(DefaultKernels.apply(&integ, disp).is_err());

        let acc = DefaultKernels.apply(&diff, sine_signal(1.0, 0.01, 100)).unwrap();
        assert_eq!(acc.kind, MotionKind::Acceleration);
        assert!(DefaultKernels.apply(&diff, acc).is_err());
    }

    #[test]
    fn test_integrate_constant() {
        let out = integrate(&[1.0, 1.0, 1.0, 1.0], 0.5);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
        let back = differentiate(&out, 0.5);
        assert!(back.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_rotate_by_ninety_degrees() {
        let mut signal = sine_signal(1.0, 0.01, 10);
        signal.h1.samples = vec![1.0; 10];
        signal.h2.samples = vec![0.0; 10];
        let label = ProcessingLabel::new("r", LabelType::Rotate, [("angle", 90.0)]).unwrap();
        let rotated = DefaultKernels.apply(&label, signal).unwrap();
        assert!(rotated.h1.samples[0].abs() < 1e-12);
        assert!((rotated.h2.samples[0] + 1.0).abs() < 1e-12);
        assert_eq!(rotated.h1.orientation, Orientation::Azimuth(90.0));
        assert_eq!(rotated.h2.orientation, Orientation::Azimuth(180.0));
    }

    #[test]
    fn test_taper_both_ends() {
        let mut samples = vec![1.0; 100];
        taper(&mut samples, 2, 0.1);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[99], 0.0);
        assert_eq!(samples[50], 1.0);
    }

    #[test]
    fn test_frequency_spectrum_peak() {
        let signal = sine_signal(5.0, 0.01, 1000);
        let spectrum = DefaultKernels.frequency_spectrum(&signal.h1.samples, signal.dt);
        assert_eq!(spectrum.frequencies.len(), 501);
        let (peak_idx, _) = spectrum
            .amplitudes
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, &a)| if a > best.1 { (i, a) } else { best });
        assert!((spectrum.frequencies[peak_idx] - 5.0).abs() < 0.11);
    }

    #[test]
    fn test_response_spectrum_shape() {
        let acc: Vec<f64> = (0..1000).map(|i| if i == 10 { 1.0 } else { 0.0 }).collect();
        let rsp = DefaultKernels.response_spectrum(&acc, 0.01);
        assert_eq!(rsp.periods.len(), RESPONSE_PERIODS);
        assert!((rsp.periods[0] - 0.01).abs() < 1e-12);
        assert!((rsp.periods[RESPONSE_PERIODS - 1] - 10.0).abs() < 1e-9);
        assert!(rsp.psa.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(rsp.psa.iter().any(|v| *v > 0.0));
    }
}
