//! Magnetometer sample type.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A three-axis magnetometer measurement in the body frame.
///
/// Units are Gauss; typical Earth-field magnitudes are 0.25-0.65 Gauss.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MagSample {
    /// Timestamp of the measurement.
    pub time_us: Timestamp,

    /// Measured field in body frame (Gauss).
    pub mag: Vector3<f64>,
}

impl MagSample {
    /// Creates a new magnetometer sample.
    #[must_use]
    pub const fn new(time_us: Timestamp, mag: Vector3<f64>) -> Self {
        Self { time_us, mag }
    }

    /// Field strength (Gauss).
    #[must_use]
    pub fn strength(&self) -> f64 {
        self.mag.norm()
    }
}
