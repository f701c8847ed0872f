//! Yaw observation fusion.
//!
//! A single yaw angle extracted from the magnetometer, an external vision
//! pose or a dual-antenna GNSS baseline is fused against the yaw of the
//! attitude quaternion. The Euler decomposition (321 vs 312) is chosen per
//! sample so the extraction never passes near its gimbal singularity.

use nalgebra::Vector3;

use crate::fusion::{fuse_scalar, wrap_pi};
use crate::prediction::rotated_vector_partial;
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

impl Ekf {
    /// Returns `true` when the 321 (yaw-pitch-roll) sequence has the
    /// smaller intermediate rotation for the current attitude.
    pub(crate) fn should_use_321_sequence(&self) -> bool {
        // R(2,0) -> sin(pitch) for 321, R(2,1) -> sin(roll) for 312.
        self.r_to_earth[(2, 0)].abs() < self.r_to_earth[(2, 1)].abs()
    }

    /// Yaw of the current attitude using the better-conditioned sequence.
    pub(crate) fn predicted_yaw(&self) -> f64 {
        if self.should_use_321_sequence() {
            self.r_to_earth[(1, 0)].atan2(self.r_to_earth[(0, 0)])
        } else {
            (-self.r_to_earth[(0, 1)]).atan2(self.r_to_earth[(1, 1)])
        }
    }

    /// Fuses a yaw observation (rad). Returns `true` on success.
    pub(crate) fn fuse_heading(&mut self, measured_yaw: f64, obs_var: f64) -> bool {
        let q = self.state.quat.quaternion();
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);

        // Partials of the rotation matrix elements entering the yaw
        // extraction, in terms of unnormalized quaternion elements.
        let (predicted, num, den, dnum, dden) = if self.should_use_321_sequence() {
            // yaw = atan2(R10, R00)
            let num = 2.0 * (x * y + w * z);
            let den = w * w + x * x - y * y - z * z;
            let dnum = [2.0 * z, 2.0 * y, 2.0 * x, 2.0 * w];
            let dden = [2.0 * w, 2.0 * x, -2.0 * y, -2.0 * z];
            (num.atan2(den), num, den, dnum, dden)
        } else {
            // yaw = atan2(-R01, R11)
            let num = -2.0 * (x * y - w * z);
            let den = w * w - x * x + y * y - z * z;
            let dnum = [2.0 * z, -2.0 * y, -2.0 * x, 2.0 * w];
            let dden = [2.0 * w, -2.0 * x, 2.0 * y, -2.0 * z];
            (num.atan2(den), num, den, dnum, dden)
        };

        let norm_sq = num * num + den * den;
        if norm_sq < 1e-9 {
            return false;
        }

        let mut h = StateColumn::zeros();
        for col in 0..4 {
            h[col] = (den * dnum[col] - num * dden[col]) / norm_sq;
        }

        let innovation = wrap_pi(measured_yaw - predicted);
        let result = fuse_scalar(
            &mut self.state,
            &mut self.cov,
            &h,
            innovation,
            obs_var,
            self.params.heading_innov_gate,
            self.bias_monitor.is_inhibited(),
        );

        self.innovations.heading = innovation;
        self.innovations.heading_var = result.variance;
        self.innovations.heading_test_ratio = result.test_ratio;
        self.set_innovation_fault(innovation_fault::HEADING, !result.fused);

        if result.fused {
            self.time_last_mag_fuse = self.time_delayed;
            self.condition_covariance();
        }
        result.fused
    }

    /// Extracts the yaw observation from a magnetometer sample using the
    /// tilt estimate and the configured declination.
    pub(crate) fn mag_heading_observation(&self, mag: Vector3<f64>) -> f64 {
        // Rotate the measurement into a yaw-free earth frame; the azimuth
        // left over is declination minus vehicle yaw.
        let (roll, pitch, _) = self.state.quat.euler_angles();
        let tilt = nalgebra::UnitQuaternion::from_euler_angles(roll, pitch, 0.0);
        let mag_earth = tilt * (mag - self.state.mag_bias);
        wrap_pi(self.params.mag_declination - mag_earth.y.atan2(mag_earth.x))
    }

    /// Fuses the yaw of a dual-antenna GNSS baseline.
    ///
    /// The observation is the azimuth of the antenna baseline, which is
    /// offset from the body X axis by a fixed mounting angle.
    pub(crate) fn fuse_gps_yaw(&mut self, measured_yaw: f64, yaw_offset: f64) -> bool {
        const GPS_YAW_OBS_VAR: f64 = 0.01; // (0.1 rad)^2

        let baseline_body = Vector3::new(yaw_offset.cos(), yaw_offset.sin(), 0.0);
        let baseline_earth = self.r_to_earth * baseline_body;
        let vx = baseline_earth.x;
        let vy = baseline_earth.y;
        let norm_sq = vx * vx + vy * vy;
        if norm_sq < 1e-9 {
            return false;
        }

        let jac = rotated_vector_partial(&self.state.quat, &baseline_body);
        let mut h = StateColumn::zeros();
        for col in 0..4 {
            h[col] = (vx * jac[(1, col)] - vy * jac[(0, col)]) / norm_sq;
        }

        let predicted = vy.atan2(vx);
        let innovation = wrap_pi(measured_yaw - predicted);
        let result = fuse_scalar(
            &mut self.state,
            &mut self.cov,
            &h,
            innovation,
            GPS_YAW_OBS_VAR,
            self.params.heading_innov_gate,
            self.bias_monitor.is_inhibited(),
        );

        self.innovations.heading = innovation;
        self.innovations.heading_var = result.variance;
        self.innovations.heading_test_ratio = result.test_ratio;

        if result.fused {
            self.condition_covariance();
        }
        result.fused
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::EkfParams;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use nav_types::Timestamp;

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        ekf.filter_initialised = true;
        ekf.initialise_covariance();
        ekf.time_delayed = Timestamp::from_secs_f64(1.0);
        ekf
    }

    #[test]
    fn sequence_selection_follows_tilt() {
        let mut ekf = aligned_ekf();
        // Level: pitch term is zero, 321 preferred.
        assert!(ekf.should_use_321_sequence());

        // Rolled 90 degrees: R(2,1) ~ 1, still 321.
        ekf.state.quat = UnitQuaternion::from_euler_angles(std::f64::consts::FRAC_PI_2, 0.0, 0.0);
        ekf.r_to_earth = ekf.state.quat.to_rotation_matrix().into_inner();
        assert!(ekf.should_use_321_sequence());

        // Pitched 90 degrees: the 321 extraction degenerates, use 312.
        ekf.state.quat = UnitQuaternion::from_euler_angles(0.0, std::f64::consts::FRAC_PI_2, 0.0);
        ekf.r_to_earth = ekf.state.quat.to_rotation_matrix().into_inner();
        assert!(!ekf.should_use_321_sequence());
    }

    #[test]
    fn predicted_yaw_matches_euler() {
        let mut ekf = aligned_ekf();
        ekf.state.quat = UnitQuaternion::from_euler_angles(0.1, -0.05, 0.8);
        ekf.r_to_earth = ekf.state.quat.to_rotation_matrix().into_inner();
        assert_relative_eq!(ekf.predicted_yaw(), 0.8, epsilon = 1e-10);
    }

    #[test]
    fn heading_fusion_converges_yaw() {
        let mut ekf = aligned_ekf();
        ekf.cov
            .init_quat_covariances(&ekf.state.quat, &Vector3::new(0.01, 0.01, 0.25));

        for _ in 0..20 {
            ekf.fuse_heading(0.5, 0.01);
        }
        assert_relative_eq!(ekf.state.yaw(), 0.5, epsilon = 0.05);
    }

    #[test]
    fn mag_heading_observation_level_vehicle() {
        let mut ekf = aligned_ekf();
        ekf.params.mag_declination = 0.0;
        // Vehicle yawed 0.3 rad: the body sees the field rotated by -0.3.
        let yaw = 0.3;
        let field = Vector3::new(0.21, 0.0, 0.45);
        let body_mag = UnitQuaternion::from_euler_angles(0.0, 0.0, yaw).inverse() * field;
        let obs = ekf.mag_heading_observation(body_mag);
        assert_relative_eq!(obs, yaw, epsilon = 1e-10);
    }

    #[test]
    fn gps_yaw_fusion_with_offset_baseline() {
        let mut ekf = aligned_ekf();
        ekf.cov
            .init_quat_covariances(&ekf.state.quat, &Vector3::new(0.01, 0.01, 0.25));

        // Vehicle at yaw zero, antenna baseline mounted at 90 degrees: the
        // baseline azimuth observation equals the mounting offset.
        let offset = std::f64::consts::FRAC_PI_2;
        assert!(ekf.fuse_gps_yaw(offset, offset));
        assert_relative_eq!(ekf.state.yaw(), 0.0, epsilon = 1e-6);
    }
}
