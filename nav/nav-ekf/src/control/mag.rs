//! Magnetometer fusion control.
//!
//! Decides per tick between heading fusion, full 3-axis fusion and no
//! fusion, requests yaw resets when the heading has gone bad, and tracks
//! the observability conditions under which the magnetic field and bias
//! states can safely be estimated.

use nalgebra::Vector2;
use nav_types::Timestamp;

use crate::covariance::MagCovarianceSnapshot;
use crate::{Ekf, MagFuseMode};

/// Seconds of in-flight 3-axis fusion before the field is considered
/// aligned.
const FLT_ALIGN_DURATION_S: f64 = 5.0;

/// Bad in-flight heading events tolerated before the magnetometer is
/// declared faulty.
const MAX_BAD_YAW_EVENTS: u8 = 2;

/// Magnetometer controller state.
#[derive(Debug, Clone)]
pub(crate) struct MagControl {
    /// Yaw is observable from horizontal acceleration.
    pub(crate) yaw_angle_observable: bool,
    /// Mag biases are observable from yaw rotation.
    pub(crate) mag_bias_observable: bool,
    /// Low-pass filtered horizontal acceleration (m/s^2).
    accel_lpf_ne: Vector2<f64>,
    /// Filtered yaw rate about the earth D axis (rad/s).
    yaw_rate_lpf: f64,
    /// A yaw reset from magnetometer data has been requested.
    pub(crate) yaw_reset_req: bool,
    /// Mag use is inhibited (on ground, at rest).
    pub(crate) use_inhibit: bool,
    use_inhibit_prev: bool,
    /// Inhibit lasted long enough that a reset is required on release.
    pub(crate) inhibit_yaw_reset_req: bool,
    time_inhibit_start: Timestamp,
    /// Declination covariance terms were modified since the last field
    /// reset.
    pub(crate) decl_cov_reset: bool,
    /// In-flight alignment progress.
    flt_align_start: Timestamp,
    pub(crate) num_bad_flight_yaw_events: u8,
    /// Field covariance saved when leaving 3-axis fusion.
    saved_covariance: Option<MagCovarianceSnapshot>,
    in_air_prev: bool,
}

impl Default for MagControl {
    fn default() -> Self {
        Self {
            yaw_angle_observable: false,
            mag_bias_observable: false,
            accel_lpf_ne: Vector2::zeros(),
            yaw_rate_lpf: 0.0,
            yaw_reset_req: false,
            use_inhibit: false,
            use_inhibit_prev: false,
            inhibit_yaw_reset_req: false,
            time_inhibit_start: Timestamp::zero(),
            decl_cov_reset: false,
            flt_align_start: Timestamp::zero(),
            num_bad_flight_yaw_events: 0,
            saved_covariance: None,
            in_air_prev: false,
        }
    }
}

impl Ekf {
    /// Magnetometer fusion state machine for this tick.
    pub(crate) fn control_mag_fusion(&mut self) {
        if self.params.mag_fusion_mode == MagFuseMode::None || self.control.mag_fault {
            self.control.mag_hdg = false;
            self.control.mag_3d = false;
            self.control.mag_dec = false;
            return;
        }

        self.update_mag_observability();
        self.update_mag_inhibit();

        // Takeoff edge: the ground is full of hard iron, realign once
        // airborne and climbing away from it.
        if self.control.in_air && !self.mag_control.in_air_prev {
            self.mag_control.yaw_reset_req = true;
        }
        self.mag_control.in_air_prev = self.control.in_air;

        // A heading that cannot fuse for a long stretch in flight is wrong,
        // not noisy; realign and count the event.
        if self.control.in_air
            && self.control.yaw_align
            && self.innovations.heading_test_ratio > 1.0
            && self
                .time_delayed
                .since(self.time_last_mag_fuse)
                .as_micros()
                > self.params.reset_timeout_us
        {
            self.mag_control.yaw_reset_req = true;
            self.mag_control.num_bad_flight_yaw_events =
                self.mag_control.num_bad_flight_yaw_events.saturating_add(1);
            if self.mag_control.num_bad_flight_yaw_events >= MAX_BAD_YAW_EVENTS
                && self.control.gps
            {
                // Position aiding can carry yaw; stop trusting the sensor.
                self.control.mag_fault = true;
                tracing::warn!("magnetometer declared faulty after repeated yaw failures");
            }
        }

        let Some(mag) = self.mag_sample_delayed else {
            return;
        };

        // Service any pending yaw reset with the fresh sample.
        if self.mag_control.yaw_reset_req
            || (self.mag_control.inhibit_yaw_reset_req && !self.mag_control.use_inhibit)
        {
            let increase_yaw_var = self.control.in_air;
            if self.reset_mag_heading(mag.mag, increase_yaw_var) {
                self.mag_control.yaw_reset_req = false;
                self.mag_control.inhibit_yaw_reset_req = false;
            }
        }

        // In-flight field alignment: requires climbing clear of ground-level
        // magnetic disturbances and enough motion to make the field states
        // observable before the settling clock can run down.
        let climbed_clear =
            self.height_control.last_on_ground_pos_d - self.state.pos.z > 1.5;
        let field_observable =
            self.mag_control.mag_bias_observable || self.mag_control.yaw_angle_observable;
        if self.params.mag_fusion_mode == MagFuseMode::Auto
            && self.control.in_air
            && !self.control.mag_aligned_in_flight
            && climbed_clear
            && field_observable
        {
            if self.mag_control.flt_align_start.is_zero() {
                self.mag_control.flt_align_start = self.time_delayed;
            } else if self
                .time_delayed
                .since(self.mag_control.flt_align_start)
                .as_secs_f64()
                > FLT_ALIGN_DURATION_S
            {
                self.control.mag_aligned_in_flight = true;
            }
        }

        // Mode arbitration.
        let want_3d = match self.params.mag_fusion_mode {
            MagFuseMode::ThreeAxis => true,
            MagFuseMode::Auto => self.control.in_air && self.control.mag_aligned_in_flight,
            _ => false,
        };

        let was_3d = self.control.mag_3d;
        self.control.mag_3d = want_3d && !self.mag_control.use_inhibit;
        self.control.mag_hdg = !self.control.mag_3d && !self.mag_control.use_inhibit;
        self.control.mag_dec = self.control.mag_3d;

        // Field covariance continuity across mode switches.
        if self.control.mag_3d && !was_3d {
            if let Some(saved) = self.mag_control.saved_covariance.take() {
                self.cov.restore_mag_covariance(&saved);
            }
        } else if !self.control.mag_3d && was_3d {
            self.mag_control.saved_covariance = Some(self.cov.save_mag_covariance());
        }

        if self.control.mag_3d {
            self.fuse_mag(mag.mag);
            // Declination also runs once after every field reset so the
            // earth-field covariance gets its azimuth constraint back.
            if self.control.mag_dec || !self.mag_control.decl_cov_reset {
                self.fuse_declination(self.params.mag_declination_sigma);
                self.limit_declination();
            }
        } else if self.control.mag_hdg {
            let obs_yaw = self.mag_heading_observation(mag.mag);
            let obs_var = self.params.mag_heading_noise.powi(2);
            self.fuse_heading(obs_yaw, obs_var);
        }
    }

    /// Observability of yaw and the mag bias states from vehicle motion.
    fn update_mag_observability(&mut self) {
        let imu = self.imu_sample_delayed;
        let dt = imu.delta_ang_dt.max(1e-4);

        let accel_ne = (self.r_to_earth * (imu.delta_vel / imu.delta_vel_dt.max(1e-4))).xy();
        self.mag_control.accel_lpf_ne += 0.1 * (accel_ne - self.mag_control.accel_lpf_ne);
        self.mag_control.yaw_angle_observable =
            self.mag_control.accel_lpf_ne.norm() > self.params.mag_acc_gate;

        let yaw_rate = (self.r_to_earth * (imu.delta_ang / dt)).z;
        self.mag_control.yaw_rate_lpf += 0.1 * (yaw_rate - self.mag_control.yaw_rate_lpf);
        self.mag_control.mag_bias_observable =
            self.mag_control.yaw_rate_lpf.abs() > self.params.mag_yaw_rate_gate;
    }

    /// Ground-handling inhibit: a vehicle at rest on the ground sits in its
    /// own magnetic disturbance field.
    fn update_mag_inhibit(&mut self) {
        self.mag_control.use_inhibit = !self.control.in_air && self.vehicle_at_rest;

        if self.mag_control.use_inhibit && !self.mag_control.use_inhibit_prev {
            self.mag_control.time_inhibit_start = self.time_delayed;
        }
        if self.mag_control.use_inhibit
            && !self.mag_control.time_inhibit_start.is_zero()
            && self
                .time_delayed
                .since(self.mag_control.time_inhibit_start)
                .as_secs_f64()
                > 5.0
        {
            self.mag_control.inhibit_yaw_reset_req = true;
        }
        self.mag_control.use_inhibit_prev = self.mag_control.use_inhibit;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::EkfParams;
    use nalgebra::Vector3;
    use nav_types::{ImuSample, MagSample};

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        ekf.filter_initialised = true;
        ekf.state.mag_earth = Vector3::new(0.21, 0.0, 0.45);
        ekf.initialise_covariance();
        ekf.control.tilt_align = true;
        ekf.control.yaw_align = true;
        ekf.time_delayed = Timestamp::from_secs_f64(30.0);
        ekf.time_last_mag_fuse = Timestamp::from_secs_f64(29.9);
        ekf.imu_sample_delayed = ImuSample::new(
            ekf.time_delayed,
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, -9.81 * 0.008),
            0.008,
        );
        ekf.vehicle_at_rest = false;
        ekf
    }

    fn mag_sample(ekf: &Ekf) -> MagSample {
        MagSample::new(ekf.time_delayed, Vector3::new(0.21, 0.0, 0.45))
    }

    #[test]
    fn mode_none_disables_everything() {
        let mut ekf = aligned_ekf();
        ekf.params.mag_fusion_mode = MagFuseMode::None;
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert!(!ekf.control.mag_hdg && !ekf.control.mag_3d);
    }

    #[test]
    fn heading_mode_on_ground() {
        let mut ekf = aligned_ekf();
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert!(ekf.control.mag_hdg);
        assert!(!ekf.control.mag_3d);
        assert_eq!(ekf.time_last_mag_fuse, ekf.time_delayed);
    }

    #[test]
    fn takeoff_requests_yaw_reset() {
        let mut ekf = aligned_ekf();
        let counter_before = ekf.quat_reset().1;
        ekf.control.in_air = true;
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert_eq!(ekf.quat_reset().1, counter_before.wrapping_add(1));
    }

    #[test]
    fn auto_mode_promotes_to_3d_after_alignment() {
        let mut ekf = aligned_ekf();
        ekf.control.in_air = true;
        ekf.mag_control.in_air_prev = true;
        // Climbed well clear of the ground, yawing enough to observe the
        // field bias states.
        ekf.state.pos.z = -10.0;
        ekf.mag_control.yaw_rate_lpf = 0.5;
        ekf.imu_sample_delayed.delta_ang = Vector3::new(0.0, 0.0, 0.5 * 0.008);

        // First tick starts the alignment clock.
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert!(!ekf.control.mag_3d);

        // Well past the settling period.
        ekf.time_delayed = Timestamp::from_secs_f64(40.0);
        ekf.mag_sample_delayed = Some(MagSample::new(
            ekf.time_delayed,
            Vector3::new(0.21, 0.0, 0.45),
        ));
        ekf.time_last_mag_fuse = Timestamp::from_secs_f64(39.9);
        ekf.control_mag_fusion();
        assert!(ekf.control.mag_aligned_in_flight);
        assert!(ekf.control.mag_3d);
        assert!(ekf.control.mag_dec);
    }

    #[test]
    fn alignment_waits_for_observability() {
        let mut ekf = aligned_ekf();
        ekf.control.in_air = true;
        ekf.mag_control.in_air_prev = true;
        ekf.state.pos.z = -10.0;
        // Straight-and-level flight: nothing makes the field observable.
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();

        ekf.time_delayed = Timestamp::from_secs_f64(40.0);
        ekf.time_last_mag_fuse = Timestamp::from_secs_f64(39.9);
        ekf.mag_sample_delayed = Some(MagSample::new(
            ekf.time_delayed,
            Vector3::new(0.21, 0.0, 0.45),
        ));
        ekf.control_mag_fusion();
        assert!(!ekf.control.mag_aligned_in_flight);
        assert!(!ekf.control.mag_3d, "stays in heading mode");
    }

    #[test]
    fn at_rest_on_ground_inhibits_mag() {
        let mut ekf = aligned_ekf();
        ekf.vehicle_at_rest = true;
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        let fuse_time_before = ekf.time_last_mag_fuse;
        ekf.control_mag_fusion();
        assert!(ekf.mag_control.use_inhibit);
        assert!(!ekf.control.mag_hdg && !ekf.control.mag_3d);
        assert_eq!(ekf.time_last_mag_fuse, fuse_time_before);
    }

    #[test]
    fn repeated_bad_yaw_declares_fault() {
        let mut ekf = aligned_ekf();
        ekf.control.in_air = true;
        ekf.mag_control.in_air_prev = true;
        ekf.control.gps = true;
        ekf.mag_control.num_bad_flight_yaw_events = MAX_BAD_YAW_EVENTS - 1;
        ekf.innovations.heading_test_ratio = 5.0;
        ekf.time_last_mag_fuse = Timestamp::from_secs_f64(10.0);

        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert!(ekf.control.mag_fault);

        // Once faulted, the controller stays out entirely.
        ekf.mag_sample_delayed = Some(mag_sample(&ekf));
        ekf.control_mag_fusion();
        assert!(!ekf.control.mag_hdg && !ekf.control.mag_3d);
    }
}
