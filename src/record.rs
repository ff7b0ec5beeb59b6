//! Processed records: the values held by the result cache.
//!
//! A [`ProcessedRecord`] bundles everything derived from one station's raw signal under
//! one incident and one pipeline: displacement, velocity and acceleration for each
//! component, their Fourier amplitude spectra, acceleration response spectra and the
//! station's epicentral distance. Records are immutable once built; the cache stores
//! their `bincode` encoding, which is deterministic for equal records.

use crate::error::{AppResult, TsError};
use crate::processing::kernels::{differentiate, integrate, ResponseSpectrum, SignalKernels};
use crate::processing::labels::ProcessingLabel;
use crate::signal::{MotionKind, Orientation, RawSignal};
use crate::station::{Hypocenter, Station};
use serde::{Deserialize, Serialize};

/// One component of one derived motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    /// Samples over time
    pub values: Vec<f64>,
    /// Peak absolute value
    pub peak: f64,
    /// Fourier amplitude over the record's frequency vector
    pub fft_amplitude: Vec<f64>,
    /// Present for acceleration bundles only
    pub response_spectrum: Option<ResponseSpectrum>,
}

impl SignalBundle {
    fn build(
        kernels: &dyn SignalKernels,
        values: Vec<f64>,
        dt: f64,
        with_response: bool,
    ) -> (Self, Vec<f64>) {
        let spectrum = kernels.frequency_spectrum(&values, dt);
        let response_spectrum = with_response.then(|| kernels.response_spectrum(&values, dt));
        let peak = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        (
            Self {
                values,
                peak,
                fft_amplitude: spectrum.amplitudes,
                response_spectrum,
            },
            spectrum.frequencies,
        )
    }
}

/// The three components of one derived motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionBundle {
    /// First horizontal component
    pub h1: SignalBundle,
    /// Second horizontal component
    pub h2: SignalBundle,
    /// Vertical component
    pub ver: SignalBundle,
}

/// Everything derived for one (station, incident, pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    /// Project-wide station id
    pub station_id: String,
    /// Station name inside the incident
    pub station_name: String,
    /// Incident the raw signal came from
    pub incident_name: String,
    /// The pipeline that produced this record, fully resolved
    pub pipeline: Vec<ProcessingLabel>,
    /// Sampling interval in seconds
    pub dt: f64,
    /// Samples per component
    pub npts: usize,
    /// Orientation of `h1`, `h2` and `ver` after processing
    pub orientations: [Orientation; 3],
    /// Frequencies shared by every `fft_amplitude`
    pub freq_vec: Vec<f64>,
    /// Displacement in meters
    pub displacement: MotionBundle,
    /// Velocity in meters per second
    pub velocity: MotionBundle,
    /// Acceleration; carries the response spectra
    pub acceleration: MotionBundle,
    /// None when the project has no registered source
    pub epicentral_distance_km: Option<f64>,
}

impl ProcessedRecord {
    /// Run `pipeline` over `raw` and derive all bundles.
    pub fn compute(
        kernels: &dyn SignalKernels,
        station: &Station,
        incident_name: &str,
        pipeline: Vec<ProcessingLabel>,
        raw: RawSignal,
        source: Option<&Hypocenter>,
    ) -> AppResult<Self> {
        if !(raw.dt.is_finite() && raw.dt > 0.0) {
            return Err(TsError::Processing(format!(
                "invalid sampling interval {} for station {}",
                raw.dt, station.id
            )));
        }

        let mut signal = raw;
        for label in &pipeline {
            signal = kernels.apply(label, signal)?;
        }

        let npts = signal.npts();
        let dt = signal.dt;
        let to_velocity = |samples: &[f64]| -> Vec<f64> {
            let samples = &samples[..npts];
            match signal.kind {
                MotionKind::Displacement => differentiate(samples, dt),
                MotionKind::Velocity => samples.to_vec(),
                MotionKind::Acceleration => integrate(samples, dt),
            }
        };

        let velocities = [
            to_velocity(&signal.h1.samples),
            to_velocity(&signal.h2.samples),
            to_velocity(&signal.ver.samples),
        ];

        let motion = |derive: fn(&[f64], f64) -> Vec<f64>, with_response: bool| {
            let [h1, h2, ver] = &velocities;
            let (h1, freq_vec) = SignalBundle::build(kernels, derive(h1, dt), dt, with_response);
            let (h2, _) = SignalBundle::build(kernels, derive(h2, dt), dt, with_response);
            let (ver, _) = SignalBundle::build(kernels, derive(ver, dt), dt, with_response);
            (MotionBundle { h1, h2, ver }, freq_vec)
        };

        let (displacement, _) = motion(integrate, false);
        let (velocity, freq_vec) = motion(|v, _| v.to_vec(), false);
        let (acceleration, _) = motion(differentiate, true);

        Ok(Self {
            station_id: station.id.clone(),
            station_name: station.name_in(incident_name).to_string(),
            incident_name: incident_name.to_string(),
            pipeline,
            dt,
            npts,
            orientations: [
                signal.h1.orientation,
                signal.h2.orientation,
                signal.ver.orientation,
            ],
            freq_vec,
            displacement,
            velocity,
            acceleration,
            epicentral_distance_km: source.map(|s| station.epicentral_distance_km(s)),
        })
    }

    /// Time of every sample, starting at zero.
    pub fn time_vec(&self) -> Vec<f64> {
        (0..self.npts).map(|i| i as f64 * self.dt).collect()
    }

    /// Serialized form stored in the cache.
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
