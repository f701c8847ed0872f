//! Inertial measurement sample types.
//!
//! The estimator consumes *integrated* inertial increments rather than raw
//! rates: each sample carries the rotation (delta angle) and velocity change
//! (delta velocity) accumulated over the sample interval. This matches what
//! flight-grade IMU drivers deliver and makes downsampling a matter of
//! summation.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{SampleError, Timestamp};

/// An integrated inertial sample.
///
/// # Units
///
/// - Delta angle: radians accumulated over `delta_ang_dt`
/// - Delta velocity: m/s accumulated over `delta_vel_dt`
///
/// # Example
///
/// ```
/// use nav_types::{ImuSample, Timestamp};
/// use nalgebra::Vector3;
///
/// let dt = 0.008;
/// let imu = ImuSample::new(
///     Timestamp::from_micros(8_000),
///     Vector3::zeros(),
///     Vector3::new(0.0, 0.0, -9.81 * dt),
///     dt,
/// );
/// assert!((imu.delta_vel_dt - dt).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImuSample {
    /// Timestamp of the trailing edge of the integration interval.
    pub time_us: Timestamp,

    /// Delta angle in body frame over the integration interval (rad).
    pub delta_ang: Vector3<f64>,

    /// Delta velocity in body frame over the integration interval (m/s).
    pub delta_vel: Vector3<f64>,

    /// Integration interval of the delta angle (s).
    pub delta_ang_dt: f64,

    /// Integration interval of the delta velocity (s).
    pub delta_vel_dt: f64,
}

impl ImuSample {
    /// Creates a sample with a common integration interval for both channels.
    #[must_use]
    pub fn new(
        time_us: Timestamp,
        delta_ang: Vector3<f64>,
        delta_vel: Vector3<f64>,
        dt: f64,
    ) -> Self {
        Self {
            time_us,
            delta_ang,
            delta_vel,
            delta_ang_dt: dt,
            delta_vel_dt: dt,
        }
    }

    /// Creates a zero sample (vehicle perfectly still, no gravity).
    #[must_use]
    pub fn zero(time_us: Timestamp) -> Self {
        Self::new(time_us, Vector3::zeros(), Vector3::zeros(), 0.0)
    }

    /// Checks the sample for non-finite values and a usable interval.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint. Estimators reject samples
    /// failing this check at ingest; a NaN reaching the strapdown
    /// integration would poison every downstream state.
    pub fn validate(&self) -> Result<(), SampleError> {
        if !self.delta_ang.iter().all(|v| v.is_finite()) {
            return Err(SampleError::NonFinite("delta_ang"));
        }
        if !self.delta_vel.iter().all(|v| v.is_finite()) {
            return Err(SampleError::NonFinite("delta_vel"));
        }
        if !(self.delta_ang_dt.is_finite() && self.delta_vel_dt.is_finite()) {
            return Err(SampleError::NonFinite("delta_dt"));
        }
        if self.delta_ang_dt < 0.0 || self.delta_vel_dt < 0.0 {
            return Err(SampleError::InvalidInterval(
                self.delta_ang_dt.min(self.delta_vel_dt),
            ));
        }
        Ok(())
    }

    /// Mean angular rate over the integration interval (rad/s).
    ///
    /// Returns zero when the interval is degenerate.
    #[must_use]
    pub fn angular_rate(&self) -> Vector3<f64> {
        if self.delta_ang_dt > 0.0 {
            self.delta_ang / self.delta_ang_dt
        } else {
            Vector3::zeros()
        }
    }

    /// Mean specific force over the integration interval (m/s^2).
    ///
    /// Returns zero when the interval is degenerate.
    #[must_use]
    pub fn specific_force(&self) -> Vector3<f64> {
        if self.delta_vel_dt > 0.0 {
            self.delta_vel / self.delta_vel_dt
        } else {
            Vector3::zeros()
        }
    }
}

impl Default for ImuSample {
    fn default() -> Self {
        Self::zero(Timestamp::zero())
    }
}
