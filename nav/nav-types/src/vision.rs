//! External vision sample type.

use nalgebra::{UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A pose and velocity report from an external vision system.
///
/// The vision system's navigation frame is in general rotated relative to
/// the estimator's NED frame; the estimator maintains its own alignment
/// estimate and rotates these observations before fusing them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VisionSample {
    /// Timestamp of the measurement.
    pub time_us: Timestamp,

    /// Position in the vision navigation frame (m).
    pub pos: Vector3<f64>,

    /// Velocity in the vision navigation frame (m/s).
    pub vel: Vector3<f64>,

    /// Orientation of the body frame in the vision navigation frame.
    pub quat: UnitQuaternion<f64>,

    /// 1-sigma position error (m).
    pub pos_err: f64,

    /// 1-sigma velocity error (m/s).
    pub vel_err: f64,

    /// 1-sigma angular error (rad).
    pub ang_err: f64,
}

impl VisionSample {
    /// Yaw angle of the reported orientation (rad).
    #[must_use]
    pub fn yaw(&self) -> f64 {
        self.quat.euler_angles().2
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn vision_yaw_extraction() {
        let sample = VisionSample {
            time_us: Timestamp::zero(),
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
            quat: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.7),
            pos_err: 0.1,
            vel_err: 0.1,
            ang_err: 0.05,
        };
        assert_relative_eq!(sample.yaw(), 0.7, epsilon = 1e-12);
    }
}
