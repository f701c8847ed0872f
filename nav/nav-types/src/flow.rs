//! Optical flow sample type.

use nalgebra::{Vector2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// An integrated optical flow measurement.
///
/// Flow sensors report the angular motion of the image integrated over an
/// interval, together with a snapshot of the sensor's own rate gyro
/// integrated over the same interval. The estimator subtracts its own
/// bias-corrected body rotation before using the flow as a velocity
/// observation, so both integrals must cover the same window.
///
/// Sign convention: a right-hand rotation of the image about an axis
/// produces a positive integral about that axis.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowSample {
    /// Timestamp of the trailing edge of the integration interval.
    pub time_us: Timestamp,

    /// Integrated image motion about the body X and Y axes (rad).
    pub flow_rad_xy: Vector2<f64>,

    /// Integrated sensor gyro rotation over the same interval (rad).
    pub gyro_rad_xyz: Vector3<f64>,

    /// Integration interval (s).
    pub dt: f64,

    /// Sensor-reported quality, 0 (invalid) to 255 (best).
    pub quality: u8,
}

impl FlowSample {
    /// Mean line-of-sight rate over the integration interval (rad/s).
    ///
    /// Returns zero for a degenerate interval.
    #[must_use]
    pub fn flow_rate(&self) -> Vector2<f64> {
        if self.dt > 0.0 {
            self.flow_rad_xy / self.dt
        } else {
            Vector2::zeros()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn flow_rate_from_integral() {
        let sample = FlowSample {
            time_us: Timestamp::zero(),
            flow_rad_xy: Vector2::new(0.02, -0.01),
            gyro_rad_xyz: Vector3::zeros(),
            dt: 0.1,
            quality: 255,
        };
        assert_relative_eq!(sample.flow_rate().x, 0.2, epsilon = 1e-12);
        assert_relative_eq!(sample.flow_rate().y, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn flow_rate_degenerate() {
        let sample = FlowSample {
            time_us: Timestamp::zero(),
            flow_rad_xy: Vector2::new(0.02, -0.01),
            gyro_rad_xyz: Vector3::zeros(),
            dt: 0.0,
            quality: 255,
        };
        assert_eq!(sample.flow_rate(), Vector2::zeros());
    }
}
