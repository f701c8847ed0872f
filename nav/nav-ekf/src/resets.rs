//! State reset operations.
//!
//! Every reset follows the same sequence: compute the delta between old and
//! new state, write the new state, zero the covariance cross-terms of the
//! affected group, set its diagonal to an initial variance, record the delta
//! with a wrapping counter, and re-anchor the output predictor so the
//! present-time outputs jump by the same amount.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::state::idx;
use crate::Ekf;

impl Ekf {
    /// Resets the horizontal velocity states.
    pub(crate) fn reset_vel_ne_to(&mut self, vel_ne: Vector2<f64>, variance: f64) {
        let delta = vel_ne - self.state.vel.xy();
        self.state.vel.x = vel_ne.x;
        self.state.vel.y = vel_ne.y;

        self.cov.reset_group(4..6, variance);
        self.reset_status.vel_ne_change = delta;
        self.reset_status.vel_ne_counter = self.reset_status.vel_ne_counter.wrapping_add(1);
        self.output_predictor.apply_vel_ne_reset(delta);
        self.time_last_vel_fuse = self.time_delayed;
    }

    /// Resets the vertical velocity state.
    pub(crate) fn reset_vel_d_to(&mut self, vel_d: f64, variance: f64) {
        let delta = vel_d - self.state.vel.z;
        self.state.vel.z = vel_d;

        self.cov.reset_group(6..7, variance);
        self.reset_status.vel_d_change = delta;
        self.reset_status.vel_d_counter = self.reset_status.vel_d_counter.wrapping_add(1);
        self.output_predictor.apply_vel_d_reset(delta);
    }

    /// Resets the horizontal position states.
    pub(crate) fn reset_pos_ne_to(&mut self, pos_ne: Vector2<f64>, variance: f64) {
        let delta = pos_ne - self.state.pos.xy();
        self.state.pos.x = pos_ne.x;
        self.state.pos.y = pos_ne.y;

        self.cov.reset_group(7..9, variance);
        self.reset_status.pos_ne_change = delta;
        self.reset_status.pos_ne_counter = self.reset_status.pos_ne_counter.wrapping_add(1);
        self.output_predictor.apply_pos_ne_reset(delta);
        self.time_last_pos_fuse = self.time_delayed;
    }

    /// Resets the vertical position state.
    pub(crate) fn reset_height_to(&mut self, pos_d: f64, variance: f64) {
        let delta = pos_d - self.state.pos.z;
        self.state.pos.z = pos_d;

        self.cov.reset_group(9..10, variance);
        self.reset_status.pos_d_change = delta;
        self.reset_status.pos_d_counter = self.reset_status.pos_d_counter.wrapping_add(1);
        self.output_predictor.apply_pos_d_reset(delta);
        self.time_last_hgt_fuse = self.time_delayed;

        tracing::debug!(delta, "height reset");
    }

    /// Resets yaw and the magnetic field states from a magnetometer sample.
    ///
    /// Roll and pitch are preserved; the heading comes from the measured
    /// field and the configured declination. Returns `false` when the field
    /// is too weak to define a heading.
    pub(crate) fn reset_mag_heading(
        &mut self,
        mag: Vector3<f64>,
        increase_yaw_var: bool,
    ) -> bool {
        if mag.norm() < 1e-3 {
            return false;
        }

        let yaw_meas = self.mag_heading_observation(mag);
        let quat_before = self.state.quat;

        let (roll, pitch, _) = self.state.quat.euler_angles();
        self.state.quat = UnitQuaternion::from_euler_angles(roll, pitch, yaw_meas);
        self.r_to_earth = self.state.quat.to_rotation_matrix().into_inner();

        let delta = self.state.quat * quat_before.inverse();
        self.reset_status.quat_change = delta;
        self.reset_status.quat_counter = self.reset_status.quat_counter.wrapping_add(1);

        // The new yaw invalidates every attitude cross-correlation.
        self.cov.uncorrelate_quat_states();
        if increase_yaw_var {
            let yaw_var = self.params.mag_heading_noise.powi(2).max(1.0e-4);
            self.cov
                .increase_quat_yaw_err_variance(&self.state.quat, yaw_var);
        }

        // Re-derive the field states in the new frame: the earth field is
        // the measurement rotated up, the body bias starts over.
        self.state.mag_earth = self.r_to_earth * (mag - self.state.mag_bias);
        self.state.mag_bias = Vector3::zeros();
        let mag_var = self.params.mag_noise.powi(2);
        self.cov.reset_group(idx::MAG_EARTH, mag_var);
        self.cov.reset_group(idx::MAG_BIAS, mag_var);
        self.mag_control.decl_cov_reset = false;

        self.output_predictor.apply_quat_reset(&delta);
        self.control.yaw_align = true;

        tracing::debug!(yaw = yaw_meas, "heading reset from magnetometer");
        true
    }

    /// Resets the wind states, optionally seeding them from an airspeed
    /// measurement projected along the current heading.
    pub(crate) fn reset_wind_states(&mut self, airspeed: Option<f64>) {
        match airspeed {
            Some(tas) if tas > 1.0 => {
                let yaw = self.state.yaw();
                self.state.wind.x = self.state.vel.x - tas * yaw.cos();
                self.state.wind.y = self.state.vel.y - tas * yaw.sin();
            }
            _ => {
                self.state.wind = Vector2::zeros();
            }
        }
        self.reset_wind_covariance();
    }

    /// Resets the wind covariance group to its initial uncertainty.
    pub(crate) fn reset_wind_covariance(&mut self) {
        self.cov
            .reset_group(idx::WIND, self.params.initial_wind_uncertainty.powi(2));
    }

    /// Resets both IMU bias state groups to zero with switch-on variances.
    pub(crate) fn reset_imu_bias_states(&mut self) {
        let dt = self.dt_ekf_avg;
        self.state.delta_ang_bias = Vector3::zeros();
        self.state.delta_vel_bias = Vector3::zeros();
        self.cov.reset_group(
            idx::GYRO_BIAS,
            (self.params.switch_on_gyro_bias * dt).powi(2),
        );
        self.cov.reset_group(
            idx::ACCEL_BIAS,
            (self.params.switch_on_accel_bias * dt).powi(2),
        );
        self.last_imu_bias_cov_reset = self.time_delayed;
        tracing::info!("IMU bias states reset");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::EkfParams;
    use approx::assert_relative_eq;
    use nav_types::Timestamp;

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        ekf.filter_initialised = true;
        ekf.initialise_covariance();
        ekf.time_delayed = Timestamp::from_secs_f64(5.0);
        ekf
    }

    #[test]
    fn pos_reset_records_delta_and_counter() {
        let mut ekf = aligned_ekf();
        ekf.state.pos.x = 1.0;
        ekf.reset_pos_ne_to(Vector2::new(4.0, -2.0), 0.25);

        let (delta, counter) = ekf.pos_ne_reset();
        assert_eq!(counter, 1);
        assert_relative_eq!(delta.x, 3.0, epsilon = 1e-12);
        assert_relative_eq!(delta.y, -2.0, epsilon = 1e-12);
        assert_eq!(ekf.state.pos.x, 4.0);
        // Output predictor shifted by the same delta.
        assert_relative_eq!(ekf.position().x, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn pos_reset_zeroes_cross_covariance() {
        let mut ekf = aligned_ekf();
        ekf.cov.matrix_mut()[(7, 4)] = 0.1;
        ekf.cov.matrix_mut()[(4, 7)] = 0.1;
        ekf.reset_pos_ne_to(Vector2::zeros(), 0.25);
        assert_eq!(ekf.covariances()[(7, 4)], 0.0);
        assert_eq!(ekf.covariances()[(7, 7)], 0.25);
    }

    #[test]
    fn counter_wraps_at_256() {
        let mut ekf = aligned_ekf();
        ekf.reset_status.pos_d_counter = 255;
        ekf.reset_height_to(1.0, 0.1);
        assert_eq!(ekf.pos_d_reset().1, 0, "wrapping counter");
    }

    #[test]
    fn mag_heading_reset_sets_yaw_and_field() {
        let mut ekf = aligned_ekf();
        ekf.params.mag_declination = 0.0;
        // Field seen by a vehicle yawed 0.6 rad.
        let yaw = 0.6;
        let field = Vector3::new(0.21, 0.0, 0.45);
        let body_mag = UnitQuaternion::from_euler_angles(0.0, 0.0, yaw).inverse() * field;

        assert!(ekf.reset_mag_heading(body_mag, true));
        assert_relative_eq!(ekf.state.yaw(), yaw, epsilon = 1e-9);
        assert!(ekf.control.yaw_align);
        assert_eq!(ekf.quat_reset().1, 1);
        // Earth field recovered in NED.
        assert_relative_eq!(ekf.state.mag_earth.x, 0.21, epsilon = 1e-9);
        assert_relative_eq!(ekf.state.mag_earth.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn mag_heading_reset_rejects_weak_field() {
        let mut ekf = aligned_ekf();
        assert!(!ekf.reset_mag_heading(Vector3::zeros(), true));
        assert_eq!(ekf.quat_reset().1, 0);
    }

    #[test]
    fn quat_reset_delta_maps_old_to_new() {
        let mut ekf = aligned_ekf();
        let before = ekf.state.quat;
        let field = Vector3::new(0.15, -0.15, 0.45);
        assert!(ekf.reset_mag_heading(field, false));

        let (delta, _) = ekf.quat_reset();
        let reconstructed = delta * before;
        assert_relative_eq!(
            reconstructed.angle_to(&ekf.state.quat),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn wind_reset_from_airspeed() {
        let mut ekf = aligned_ekf();
        ekf.state.vel = Vector3::new(12.0, 0.0, 0.0);
        // Flying north at 12 m/s ground speed with 10 m/s airspeed: 2 m/s
        // tailwind.
        ekf.reset_wind_states(Some(10.0));
        assert_relative_eq!(ekf.state.wind.x, 2.0, epsilon = 1e-9);
        assert_eq!(ekf.covariances()[(22, 22)], 1.0);
    }

    #[test]
    fn imu_bias_reset_zeroes_states() {
        let mut ekf = aligned_ekf();
        ekf.state.delta_ang_bias = Vector3::new(0.001, 0.0, 0.0);
        ekf.state.delta_vel_bias = Vector3::new(0.0, 0.002, 0.0);
        ekf.reset_imu_bias_states();
        assert_eq!(ekf.state.delta_ang_bias, Vector3::zeros());
        assert_eq!(ekf.state.delta_vel_bias, Vector3::zeros());
        assert_eq!(ekf.last_imu_bias_cov_reset, ekf.time_delayed);
    }
}
