//! Multirotor drag fusion for wind estimation.
//!
//! A multirotor in translational flight experiences a specific force along
//! its body X and Y axes from rotor momentum drag and bluff-body drag, both
//! functions of the air-relative velocity. Balancing the measured specific
//! force against this model makes wind observable without an airspeed
//! sensor.

use nalgebra::{Matrix3x4, Vector3};

use crate::fusion::{fuse_scalar, inverse_rotated_vector_partial};
use crate::state::StateColumn;
use crate::Ekf;

/// Air density used by the bluff-body model (kg/m^3, ISA sea level).
const RHO_AIR: f64 = 1.225;

impl Ekf {
    /// Fuses the measured body X/Y specific force against the drag model.
    pub(crate) fn fuse_drag(&mut self) {
        let imu = self.imu_sample_delayed;
        let dt = imu.delta_vel_dt;
        if dt < 1e-4 {
            return;
        }
        let measured_accel = (imu.delta_vel - self.state.delta_vel_bias) / dt;

        let v_rel_earth = Vector3::new(
            self.state.vel.x - self.state.wind.x,
            self.state.vel.y - self.state.wind.y,
            self.state.vel.z,
        );
        let v_body = self.r_to_earth.transpose() * v_rel_earth;
        let airspeed = v_body.norm();

        let jq: Matrix3x4<f64> = inverse_rotated_vector_partial(&self.state.quat, &v_rel_earth);
        let r_transpose = self.r_to_earth.transpose();
        let obs_var = self.params.drag_noise.powi(2);
        let bcoef = [self.params.bcoef_x, self.params.bcoef_y];
        let mcoef = self.params.mcoef;

        for axis in 0..2 {
            // Combined momentum and bluff-body drag along this axis.
            let bluff = 0.5 * RHO_AIR * airspeed / bcoef[axis];
            let predicted = -(bluff + mcoef) * v_body[axis];
            let innovation = measured_accel[axis] - predicted;

            // d(predicted)/d(v_body) treating |v| as slowly varying.
            let gain = -(bluff + mcoef);
            let mut h = StateColumn::zeros();
            for col in 0..4 {
                h[col] = gain * jq[(axis, col)];
            }
            for col in 0..3 {
                h[4 + col] = gain * r_transpose[(axis, col)];
            }
            for col in 0..2 {
                h[22 + col] = -gain * r_transpose[(axis, col)];
            }

            let result = fuse_scalar(
                &mut self.state,
                &mut self.cov,
                &h,
                innovation,
                obs_var,
                5.0,
                self.bias_monitor.is_inhibited(),
            );

            self.innovations.drag[axis] = innovation;
            self.innovations.drag_var[axis] = result.variance;

            if result.fused {
                self.condition_covariance();
            }
        }
    }
}
