//! Raw three-component ground-motion signals.
//!
//! A [`RawSignal`] is what an incident's storage layer hands to the resolver: two
//! horizontal components and one vertical component sampled at a common `dt`, together
//! with the physical quantity the samples represent.

use serde::{Deserialize, Serialize};

/// Orientation of a single recorded component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Orientation {
    /// Horizontal component, azimuth in degrees clockwise from north
    Azimuth(f64),
    /// Vertical component, positive up
    Up,
    /// Vertical component, positive down
    Down,
}

/// Physical quantity carried by the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    /// Meters
    Displacement,
    /// Meters per second
    Velocity,
    /// Meters per second squared
    Acceleration,
}

impl MotionKind {
    /// Quantity obtained after one time integration.
    pub fn integrated(self) -> Option<Self> {
        match self {
            MotionKind::Acceleration => Some(MotionKind::Velocity),
            MotionKind::Velocity => Some(MotionKind::Displacement),
            MotionKind::Displacement => None,
        }
    }

    /// Quantity obtained after one time differentiation.
    pub fn differentiated(self) -> Option<Self> {
        match self {
            MotionKind::Displacement => Some(MotionKind::Velocity),
            MotionKind::Velocity => Some(MotionKind::Acceleration),
            MotionKind::Acceleration => None,
        }
    }
}

/// One recorded component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Sensor orientation
    pub orientation: Orientation,
    /// Samples at the signal's `dt`
    pub samples: Vec<f64>,
}

impl Component {
    /// Component with the given orientation and samples.
    pub fn new(orientation: Orientation, samples: Vec<f64>) -> Self {
        Self {
            orientation,
            samples,
        }
    }
}

/// A raw (unprocessed) three-component signal for one station under one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    /// Sampling interval in seconds
    pub dt: f64,
    /// Quantity the samples represent
    pub kind: MotionKind,
    /// First horizontal component
    pub h1: Component,
    /// Second horizontal component
    pub h2: Component,
    /// Vertical component
    pub ver: Component,
}

impl RawSignal {
    /// Number of samples of the shortest component.
    pub fn npts(&self) -> usize {
        self.h1
            .samples
            .len()
            .min(self.h2.samples.len())
            .min(self.ver.samples.len())
    }

    /// Sampling rate in Hz.
    pub fn sampling_rate(&self) -> f64 {
        1.0 / self.dt
    }

    /// Mutable access to all three components, horizontals first.
    pub fn components_mut(&mut self) -> [&mut Component; 3] {
        [&mut self.h1, &mut self.h2, &mut self.ver]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_kind_chain() {
        assert_eq!(
            MotionKind::Acceleration.integrated(),
            Some(MotionKind::Velocity)
        );
        assert_eq!(MotionKind::Displacement.integrated(), None);
        assert_eq!(
            MotionKind::Displacement.differentiated(),
            Some(MotionKind::Velocity)
        );
        assert_eq!(MotionKind::Acceleration.differentiated(), None);
    }

    #[test]
    fn test_npts_uses_shortest_component() {
        let signal = RawSignal {
            dt: 0.01,
            kind: MotionKind::Velocity,
            h1: Component::new(Orientation::Azimuth(0.0), vec![0.0; 10]),
            h2: Component::new(Orientation::Azimuth(90.0), vec![0.0; 8]),
            ver: Component::new(Orientation::Up, vec![0.0; 9]),
        };
        assert_eq!(signal.npts(), 8);
        assert!((signal.sampling_rate() - 100.0).abs() < 1e-9);
    }
}
