//! Synthetic sideslip fusion.
//!
//! Fixed-wing airframes fly with near-zero sideslip, so a synthetic zero
//! observation of the body-frame velocity ratio `v_y / v_x` constrains the
//! wind states without any extra sensor.

use nalgebra::{Matrix3x4, Vector3};

use crate::fusion::{fuse_scalar, inverse_rotated_vector_partial};
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

impl Ekf {
    /// Fuses a synthetic zero-sideslip observation.
    pub(crate) fn fuse_sideslip(&mut self) {
        let v_rel_earth = Vector3::new(
            self.state.vel.x - self.state.wind.x,
            self.state.vel.y - self.state.wind.y,
            self.state.vel.z,
        );
        let v_body = self.r_to_earth.transpose() * v_rel_earth;
        if v_body.x.abs() < 2.0 {
            // Quotient observation degenerates at low forward speed.
            return;
        }

        let predicted = v_body.y / v_body.x;

        // Chain rule through the body-frame projection.
        let jq: Matrix3x4<f64> = inverse_rotated_vector_partial(&self.state.quat, &v_rel_earth);
        let r_transpose = self.r_to_earth.transpose();
        let vx_sq = v_body.x * v_body.x;

        let mut h = StateColumn::zeros();
        for col in 0..4 {
            h[col] = (v_body.x * jq[(1, col)] - v_body.y * jq[(0, col)]) / vx_sq;
        }
        for col in 0..3 {
            let dvx = r_transpose[(0, col)];
            let dvy = r_transpose[(1, col)];
            h[4 + col] = (v_body.x * dvy - v_body.y * dvx) / vx_sq;
        }
        for col in 0..2 {
            // Wind enters with the opposite sign of velocity.
            h[22 + col] = -h[4 + col];
        }

        let innovation = -predicted;
        let obs_var = self.params.beta_noise.powi(2);

        let result = fuse_scalar(
            &mut self.state,
            &mut self.cov,
            &h,
            innovation,
            obs_var,
            self.params.beta_innov_gate,
            self.bias_monitor.is_inhibited(),
        );

        self.innovations.beta = innovation;
        self.innovations.beta_var = result.variance;
        self.innovations.beta_test_ratio = result.test_ratio;
        self.set_innovation_fault(innovation_fault::BETA, !result.fused);

        if result.fused {
            self.time_last_beta_fuse = self.time_delayed;
            self.condition_covariance();
        }
    }
}
