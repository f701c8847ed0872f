//! Optical flow fusion.
//!
//! The flow sensor reports integrated line-of-sight angular motion, which
//! mixes vehicle translation with body rotation. Before fusion the filter
//! subtracts its own bias-corrected rotation accumulated over the same
//! interval, learning the flow sensor's gyro bias in the process.

use nalgebra::{Matrix3x4, Vector2, Vector3};
use nav_types::FlowSample;

use crate::fusion::{fuse_scalar, inverse_rotated_vector_partial};
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

impl Ekf {
    /// Fuses a compensated optical flow sample as two line-of-sight rate
    /// observations.
    pub(crate) fn fuse_opt_flow(&mut self, flow: &FlowSample) {
        let Some(flow_rate) = self.flow_comp.body_rate_compensated(flow) else {
            return;
        };

        // Distance to the ground along the sensor boresight, from the
        // terrain estimator projected through the current tilt.
        let r22 = self.r_to_earth[(2, 2)];
        if r22 < 0.7 {
            // Excessive tilt: the ground is no longer in view.
            return;
        }
        let hagl = (self.terrain.vpos() - self.state.pos.z).max(self.params.rng_gnd_clearance);
        let distance = hagl / r22;

        let v_body = self.r_to_earth.transpose() * self.state.vel;

        // LOS rates: translation across the image, divided by distance.
        let predicted = Vector2::new(v_body.y / distance, -v_body.x / distance);

        let jq: Matrix3x4<f64> = inverse_rotated_vector_partial(&self.state.quat, &self.state.vel);
        let r_transpose = self.r_to_earth.transpose();
        let obs_var = self.flow_meas_var(flow.quality);
        let gate = self.params.flow_innov_gate.max(1.0);

        // Axis order: X observation first, then Y, innovations fixed at
        // the start of the kernel.
        let mut rows = [StateColumn::zeros(); 2];
        let mut innovations = Vector2::zeros();
        for axis in 0..2 {
            // LOS about X observes body Y velocity and vice versa.
            let (body_row, sign) = if axis == 0 { (1, 1.0) } else { (0, -1.0) };
            let mut h = StateColumn::zeros();
            for col in 0..4 {
                h[col] = sign * jq[(body_row, col)] / distance;
            }
            for col in 0..3 {
                h[4 + col] = sign * r_transpose[(body_row, col)] / distance;
            }
            rows[axis] = h;
            innovations[axis] = flow_rate[axis] - predicted[axis];
        }

        let mut max_ratio: f64 = 0.0;
        let mut fused_any = false;
        for axis in 0..2 {
            let result = fuse_scalar(
                &mut self.state,
                &mut self.cov,
                &rows[axis],
                innovations[axis],
                obs_var,
                gate,
                self.bias_monitor.is_inhibited(),
            );
            self.innovations.flow[axis] = innovations[axis];
            self.innovations.flow_var[axis] = result.variance;
            max_ratio = max_ratio.max(result.test_ratio);
            fused_any |= result.fused;
        }

        self.innovations.flow_test_ratio = max_ratio;
        self.set_innovation_fault(innovation_fault::FLOW, !fused_any);

        if fused_any {
            self.time_last_of_fuse = self.time_delayed;
            self.condition_covariance();
        }
    }

    /// Observation variance for a flow sample, derated with sensor quality.
    pub(crate) fn flow_meas_var(&self, quality: u8) -> f64 {
        let qual_min = self.params.flow_qual_min;
        let weight = if qual_min < 255 {
            f64::from(quality.saturating_sub(qual_min)) / f64::from(255 - qual_min)
        } else {
            1.0
        };
        let noise = self.params.flow_noise_qual_min
            + weight * (self.params.flow_noise - self.params.flow_noise_qual_min);
        noise * noise
    }
}

/// Accumulates bias-corrected IMU rotation over the flow integration
/// interval and learns the flow sensor's internal gyro bias.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlowCompensator {
    gyro_bias: Vector3<f64>,
    delta_ang: Vector3<f64>,
    delta_time: f64,
}

impl FlowCompensator {
    /// Accumulates one delayed-horizon IMU sample.
    pub(crate) fn accumulate(&mut self, delta_ang: Vector3<f64>, dt: f64) {
        self.delta_ang += delta_ang;
        self.delta_time += dt;
    }

    /// Removes body rotation from a flow sample, returning the
    /// translational line-of-sight rate (rad/s).
    ///
    /// Returns `None` when no IMU rotation covering the interval has been
    /// accumulated yet.
    pub(crate) fn body_rate_compensated(&mut self, flow: &FlowSample) -> Option<Vector2<f64>> {
        if self.delta_time <= 0.0 || flow.dt <= 0.0 {
            return None;
        }

        let imu_rate = self.delta_ang / self.delta_time;
        let flow_gyro_rate = flow.gyro_rad_xyz / flow.dt;

        // Slow learning of the constant offset between the two gyros.
        let bias_err = flow_gyro_rate - imu_rate;
        self.gyro_bias += 0.01 * (bias_err - self.gyro_bias);

        let body_rate = flow_gyro_rate - self.gyro_bias;
        let flow_rate = flow.flow_rate();
        let compensated = Vector2::new(flow_rate.x - body_rate.x, flow_rate.y - body_rate.y);

        self.delta_ang = Vector3::zeros();
        self.delta_time = 0.0;
        Some(compensated)
    }
}
