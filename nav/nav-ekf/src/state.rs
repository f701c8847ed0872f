//! Estimator state vector and reset bookkeeping.
//!
//! The state ordering is fixed; observation Jacobians and the covariance
//! transition are written against these indices and must never be permuted.

use nalgebra::{Quaternion, SVector, UnitQuaternion, Vector2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of EKF states.
pub const NUM_STATES: usize = 24;

/// State index groups. Ranges are `start..end` (end exclusive).
pub mod idx {
    use std::ops::Range;

    /// Attitude quaternion (w, x, y, z).
    pub const QUAT: Range<usize> = 0..4;
    /// NED velocity (m/s).
    pub const VEL: Range<usize> = 4..7;
    /// NED position (m).
    pub const POS: Range<usize> = 7..10;
    /// Delta-angle bias (rad per filter period).
    pub const GYRO_BIAS: Range<usize> = 10..13;
    /// Delta-velocity bias (m/s per filter period).
    pub const ACCEL_BIAS: Range<usize> = 13..16;
    /// Earth magnetic field, NED (Gauss).
    pub const MAG_EARTH: Range<usize> = 16..19;
    /// Body magnetic bias (Gauss).
    pub const MAG_BIAS: Range<usize> = 19..22;
    /// Wind velocity, NE (m/s).
    pub const WIND: Range<usize> = 22..24;
}

/// A column vector over the full state.
pub type StateColumn = SVector<f64, NUM_STATES>;

/// The 24-element state estimated at the delayed fusion horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateVector {
    /// Attitude quaternion rotating body frame vectors into NED.
    pub quat: UnitQuaternion<f64>,
    /// Velocity in NED (m/s).
    pub vel: Vector3<f64>,
    /// Position in NED relative to the origin (m).
    pub pos: Vector3<f64>,
    /// Delta-angle bias over the filter period (rad).
    pub delta_ang_bias: Vector3<f64>,
    /// Delta-velocity bias over the filter period (m/s).
    pub delta_vel_bias: Vector3<f64>,
    /// Earth magnetic field in NED (Gauss).
    pub mag_earth: Vector3<f64>,
    /// Body-frame magnetometer bias (Gauss).
    pub mag_bias: Vector3<f64>,
    /// Wind velocity, North-East (m/s).
    pub wind: Vector2<f64>,
}

impl Default for StateVector {
    fn default() -> Self {
        Self {
            quat: UnitQuaternion::identity(),
            vel: Vector3::zeros(),
            pos: Vector3::zeros(),
            delta_ang_bias: Vector3::zeros(),
            delta_vel_bias: Vector3::zeros(),
            mag_earth: Vector3::zeros(),
            mag_bias: Vector3::zeros(),
            wind: Vector2::zeros(),
        }
    }
}

impl StateVector {
    /// Flattens the state into a column using the fixed index layout.
    #[must_use]
    pub fn to_column(&self) -> StateColumn {
        let mut x = StateColumn::zeros();
        x[0] = self.quat.w;
        x[1] = self.quat.i;
        x[2] = self.quat.j;
        x[3] = self.quat.k;
        x.fixed_rows_mut::<3>(4).copy_from(&self.vel);
        x.fixed_rows_mut::<3>(7).copy_from(&self.pos);
        x.fixed_rows_mut::<3>(10).copy_from(&self.delta_ang_bias);
        x.fixed_rows_mut::<3>(13).copy_from(&self.delta_vel_bias);
        x.fixed_rows_mut::<3>(16).copy_from(&self.mag_earth);
        x.fixed_rows_mut::<3>(19).copy_from(&self.mag_bias);
        x.fixed_rows_mut::<2>(22).copy_from(&self.wind);
        x
    }

    /// Applies a scalar sequential-fusion correction `x += K * innovation`
    /// and renormalizes the quaternion.
    pub fn apply_correction(&mut self, gain: &StateColumn, innovation: f64) {
        let q = self.quat.quaternion();
        let corrected = Quaternion::new(
            q.w + gain[0] * innovation,
            q.i + gain[1] * innovation,
            q.j + gain[2] * innovation,
            q.k + gain[3] * innovation,
        );
        self.quat = UnitQuaternion::from_quaternion(corrected);
        self.vel += gain.fixed_rows::<3>(4) * innovation;
        self.pos += gain.fixed_rows::<3>(7) * innovation;
        self.delta_ang_bias += gain.fixed_rows::<3>(10) * innovation;
        self.delta_vel_bias += gain.fixed_rows::<3>(13) * innovation;
        self.mag_earth += gain.fixed_rows::<3>(16) * innovation;
        self.mag_bias += gain.fixed_rows::<3>(19) * innovation;
        self.wind += gain.fixed_rows::<2>(22) * innovation;
    }

    /// Clamps states to physically sensible ranges.
    ///
    /// `dt` is the filter period the bias states are scaled by.
    pub fn constrain(&mut self, dt: f64, acc_bias_lim: f64) {
        const GYRO_BIAS_RATE_LIM: f64 = 0.349; // 20 deg/s

        self.quat.renormalize();
        self.vel = self.vel.map(|v| v.clamp(-1000.0, 1000.0));
        self.pos = self.pos.map(|p| p.clamp(-1.0e6, 1.0e6));
        let ang_lim = GYRO_BIAS_RATE_LIM * dt;
        self.delta_ang_bias = self.delta_ang_bias.map(|b| b.clamp(-ang_lim, ang_lim));
        let vel_lim = acc_bias_lim * dt;
        self.delta_vel_bias = self.delta_vel_bias.map(|b| b.clamp(-vel_lim, vel_lim));
        self.mag_earth = self.mag_earth.map(|m| m.clamp(-1.0, 1.0));
        self.mag_bias = self.mag_bias.map(|m| m.clamp(-0.5, 0.5));
        self.wind = self.wind.map(|w| w.clamp(-100.0, 100.0));
    }

    /// Yaw angle of the attitude about the NED down axis (rad).
    #[must_use]
    pub fn yaw(&self) -> f64 {
        self.quat.euler_angles().2
    }
}

/// Monotonic (wrapping) reset counters with the deltas last applied.
///
/// Consumers detect a reset by comparing counters with wrapping-difference
/// semantics; the paired delta is the change applied by the most recent
/// reset of that group.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResetStatus {
    /// Horizontal velocity reset count.
    pub vel_ne_counter: u8,
    /// Vertical velocity reset count.
    pub vel_d_counter: u8,
    /// Horizontal position reset count.
    pub pos_ne_counter: u8,
    /// Vertical position reset count.
    pub pos_d_counter: u8,
    /// Quaternion reset count.
    pub quat_counter: u8,

    /// NE velocity change applied by the last reset (m/s).
    pub vel_ne_change: Vector2<f64>,
    /// Down velocity change applied by the last reset (m/s).
    pub vel_d_change: f64,
    /// NE position change applied by the last reset (m).
    pub pos_ne_change: Vector2<f64>,
    /// Down position change applied by the last reset (m).
    pub pos_d_change: f64,
    /// Quaternion delta applied by the last reset. Multiply the pre-reset
    /// quaternion by this to obtain the post-reset quaternion.
    pub quat_change: UnitQuaternion<f64>,
}

/// Solution status bits reported to the flight controller.
pub mod solution_status {
    /// Attitude estimate is valid.
    pub const ATTITUDE: u16 = 1 << 0;
    /// Horizontal velocity estimate is valid.
    pub const VELOCITY_HORIZ: u16 = 1 << 1;
    /// Vertical velocity estimate is valid.
    pub const VELOCITY_VERT: u16 = 1 << 2;
    /// Horizontal position estimate is valid relative to the origin.
    pub const POS_HORIZ_REL: u16 = 1 << 3;
    /// Horizontal position estimate is valid globally.
    pub const POS_HORIZ_ABS: u16 = 1 << 4;
    /// Vertical position estimate is valid.
    pub const POS_VERT_ABS: u16 = 1 << 5;
    /// Height above ground estimate is valid.
    pub const POS_VERT_AGL: u16 = 1 << 6;
    /// Filter is dead-reckoning on inertial data only.
    pub const CONST_POS_MODE: u16 = 1 << 7;
    /// A covariance group reset occurred this tick.
    pub const COV_RESET: u16 = 1 << 8;
    /// Bad vertical accelerometer data detected.
    pub const BAD_ACC_VERTICAL: u16 = 1 << 9;
}

/// GNSS quality check failure bits.
pub mod gps_check_fail {
    /// Insufficient fix type.
    pub const FIX: u16 = 1 << 0;
    /// Reported horizontal accuracy too poor.
    pub const EPH: u16 = 1 << 1;
    /// Reported vertical accuracy too poor.
    pub const EPV: u16 = 1 << 2;
    /// Reported speed accuracy too poor.
    pub const SACC: u16 = 1 << 3;
    /// Too few satellites.
    pub const NSATS: u16 = 1 << 4;
    /// Position dilution of precision too high.
    pub const PDOP: u16 = 1 << 5;
    /// Horizontal drift too high while stationary.
    pub const HDRIFT: u16 = 1 << 6;
    /// Vertical drift too high while stationary.
    pub const VDRIFT: u16 = 1 << 7;
}

/// Innovation consistency check failure bits.
pub mod innovation_fault {
    /// Magnetometer X innovation rejected.
    pub const MAG_X: u16 = 1 << 0;
    /// Magnetometer Y innovation rejected.
    pub const MAG_Y: u16 = 1 << 1;
    /// Magnetometer Z innovation rejected.
    pub const MAG_Z: u16 = 1 << 2;
    /// Heading innovation rejected.
    pub const HEADING: u16 = 1 << 3;
    /// Horizontal velocity innovation rejected.
    pub const VEL_H: u16 = 1 << 4;
    /// Vertical velocity innovation rejected.
    pub const VEL_V: u16 = 1 << 5;
    /// Horizontal position innovation rejected.
    pub const POS_H: u16 = 1 << 6;
    /// Height innovation rejected.
    pub const POS_V: u16 = 1 << 7;
    /// Airspeed innovation rejected.
    pub const TAS: u16 = 1 << 8;
    /// Height-above-ground innovation rejected.
    pub const HAGL: u16 = 1 << 9;
    /// Sideslip innovation rejected.
    pub const BETA: u16 = 1 << 10;
    /// Optical flow innovation rejected.
    pub const FLOW: u16 = 1 << 11;
}
