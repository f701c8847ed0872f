//! Three-axis magnetometer and declination fusion.

use nalgebra::Vector3;

use crate::fusion::{fuse_scalar, inverse_rotated_vector_partial, wrap_pi};
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

/// Minimum usable horizontal earth-field strength (Gauss).
const H_FIELD_MIN: f64 = 0.001;

impl Ekf {
    /// Fuses a 3-axis magnetometer measurement against the earth field and
    /// body bias states.
    ///
    /// All three axes are gated together: one failing axis rejects the whole
    /// sample, since a disturbance never affects a single magnetometer axis
    /// in isolation.
    pub(crate) fn fuse_mag(&mut self, mag: Vector3<f64>) {
        let q = self.state.quat;
        let r_transpose = self.r_to_earth.transpose();
        let predicted = r_transpose * self.state.mag_earth + self.state.mag_bias;
        let jq = inverse_rotated_vector_partial(&q, &self.state.mag_earth);

        let obs_var = self.params.mag_noise.powi(2);
        let gate = self.params.mag_innov_gate.max(1.0);

        let mut rows: [StateColumn; 3] = [StateColumn::zeros(); 3];
        let mut innovations = Vector3::zeros();
        let mut any_failed = false;

        for axis in 0..3 {
            let mut h = StateColumn::zeros();
            for col in 0..4 {
                h[col] = jq[(axis, col)];
            }
            for col in 0..3 {
                h[16 + col] = r_transpose[(axis, col)];
            }
            h[19 + axis] = 1.0;

            let innovation = mag[axis] - predicted[axis];
            let ph = self.cov.matrix() * h;
            let variance = h.dot(&ph) + obs_var;
            let ratio = innovation * innovation / (gate * gate * variance);

            self.innovations.mag[axis] = innovation;
            self.innovations.mag_var[axis] = variance;
            self.innovations.mag_test_ratio[axis] = ratio;

            if ratio > 1.0 || !variance.is_finite() || variance < obs_var {
                any_failed = true;
            }

            rows[axis] = h;
            innovations[axis] = innovation;
        }

        self.set_innovation_fault(innovation_fault::MAG_X, self.innovations.mag_test_ratio.x > 1.0);
        self.set_innovation_fault(innovation_fault::MAG_Y, self.innovations.mag_test_ratio.y > 1.0);
        self.set_innovation_fault(innovation_fault::MAG_Z, self.innovations.mag_test_ratio.z > 1.0);

        if any_failed {
            return;
        }

        // Sequential update; the gate has already been applied.
        let inhibit = self.bias_monitor.is_inhibited();
        for axis in 0..3 {
            fuse_scalar(
                &mut self.state,
                &mut self.cov,
                &rows[axis],
                innovations[axis],
                obs_var,
                f64::INFINITY,
                inhibit,
            );
        }

        self.time_last_mag_fuse = self.time_delayed;
        self.condition_covariance();
    }

    /// Constrains the earth-field azimuth to the local declination.
    ///
    /// Runs after 3-axis fusion in the same tick; without it the declination
    /// is unobservable whenever the vehicle flies straight.
    pub(crate) fn fuse_declination(&mut self, decl_sigma: f64) {
        let n = self.state.mag_earth.x;
        let e = self.state.mag_earth.y;
        let h_sq = n * n + e * e;
        if h_sq < H_FIELD_MIN * H_FIELD_MIN {
            return;
        }

        let mut h = StateColumn::zeros();
        h[16] = -e / h_sq;
        h[17] = n / h_sq;

        let predicted = e.atan2(n);
        let innovation = wrap_pi(self.params.mag_declination - predicted);

        let result = fuse_scalar(
            &mut self.state,
            &mut self.cov,
            &h,
            innovation,
            decl_sigma * decl_sigma,
            f64::INFINITY,
            self.bias_monitor.is_inhibited(),
        );
        if result.fused {
            self.mag_control.decl_cov_reset = true;
            self.condition_covariance();
        }
    }

    /// Applies sensible limits to the NE earth-field states so declination
    /// fusion cannot collapse the field to zero.
    pub(crate) fn limit_declination(&mut self) {
        let decl = self.params.mag_declination;
        let n = self.state.mag_earth.x;
        let e = self.state.mag_earth.y;
        let strength = n.hypot(e);
        if strength < H_FIELD_MIN {
            self.state.mag_earth.x = H_FIELD_MIN * decl.cos();
            self.state.mag_earth.y = H_FIELD_MIN * decl.sin();
        }
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
        ekf.state.mag_earth = Vector3::new(0.21, 0.0, 0.45);
        ekf.initialise_covariance();
        ekf.time_delayed = Timestamp::from_secs_f64(1.0);
        ekf
    }

    #[test]
    fn consistent_measurement_is_fused() {
        let mut ekf = aligned_ekf();
        // Identity attitude: the body sees the earth field directly.
        let meas = Vector3::new(0.22, 0.01, 0.44);
        ekf.fuse_mag(meas);
        assert_eq!(ekf.time_last_mag_fuse, ekf.time_delayed);
        assert!(ekf.innovations.mag_test_ratio.x <= 1.0);
    }

    #[test]
    fn outlier_rejects_whole_sample() {
        let mut ekf = aligned_ekf();
        let before_state = ekf.state;
        let before_cov = ekf.cov.clone();

        // 10-sigma class outlier on one axis.
        let meas = Vector3::new(0.21, 2.0, 0.45);
        ekf.fuse_mag(meas);

        assert_eq!(ekf.state, before_state, "state byte-identical on reject");
        assert_eq!(ekf.cov, before_cov);
        assert!(ekf.time_last_mag_fuse.is_zero());
        assert!(ekf.innovation_fault_status & innovation_fault::MAG_Y != 0);
    }

    #[test]
    fn declination_fusion_steers_field_azimuth() {
        let mut ekf = aligned_ekf();
        ekf.params.mag_declination = 0.2;
        ekf.state.mag_earth = Vector3::new(0.21, 0.0, 0.45);
        // Give the earth-field states some uncertainty to work with.
        ekf.cov.matrix_mut()[(16, 16)] = 0.01;
        ekf.cov.matrix_mut()[(17, 17)] = 0.01;

        ekf.fuse_declination(0.1);
        let decl = ekf.state.mag_earth.y.atan2(ekf.state.mag_earth.x);
        assert!(decl > 0.0, "azimuth moved toward declination");
    }

    #[test]
    fn limit_declination_restores_collapsed_field() {
        let mut ekf = aligned_ekf();
        ekf.params.mag_declination = 0.3;
        ekf.state.mag_earth = Vector3::new(1e-6, 0.0, 0.45);
        ekf.limit_declination();
        let strength = ekf.state.mag_earth.x.hypot(ekf.state.mag_earth.y);
        assert_relative_eq!(strength, H_FIELD_MIN, epsilon = 1e-12);
    }
}
