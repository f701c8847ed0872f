//! Velocity, position and height fusion.
//!
//! Six scalar observations (vN, vE, vD, pN, pE, pD) are direct observations
//! of single states, gated in four groups: horizontal velocity, vertical
//! velocity, horizontal position and height. A group is fused only when all
//! of its members pass the innovation check, so a single bad axis cannot
//! drag its sibling in.

use crate::fusion::{fuse_scalar, ScalarFusion};
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

/// Seconds a bad-vertical-accelerometer detection stays latched.
const BAD_ACC_PROBATION_S: f64 = 10.0;

impl Ekf {
    /// Fuses the observation groups staged by the fusion-mode controller.
    pub(crate) fn fuse_vel_pos_height(&mut self) {
        let state_indices = [4usize, 5, 6, 7, 8, 9];
        let obs = self.vel_pos_obs;

        let obs_var = [
            self.vel_obs_var.x,
            self.vel_obs_var.y,
            self.vel_obs_var.z,
            self.pos_obs_var_ne,
            self.pos_obs_var_ne,
            self.hgt_obs_var,
        ];

        let vvel_gate = if self.faults.bad_vert_accel {
            // Widen the gate so a recovering accelerometer can re-converge.
            self.params.vel_innov_gate * 2.0
        } else {
            self.params.vel_innov_gate
        };
        let gates = [
            self.params.vel_innov_gate,
            self.params.vel_innov_gate,
            vvel_gate,
            self.pos_innov_gate_ne,
            self.pos_innov_gate_ne,
            self.hgt_innov_gate,
        ];

        // Innovations and variances for every component, fused or not.
        let mut test_ratio = [0.0f64; 6];
        for i in 0..6 {
            let si = state_indices[i];
            let x = self.state.to_column();
            self.innovations.vel_pos[i] = obs[i] - x[si];
            self.innovations.vel_pos_var[i] = self.cov.var(si) + obs_var[i];
            let gate = gates[i].max(1.0);
            test_ratio[i] = self.innovations.vel_pos[i].powi(2)
                / (gate * gate * self.innovations.vel_pos_var[i]);
            self.innovations.vel_pos_test_ratio[i] = test_ratio[i];
        }

        let hvel_pass = test_ratio[0] <= 1.0 && test_ratio[1] <= 1.0;
        let vvel_pass = test_ratio[2] <= 1.0;
        let hpos_pass = test_ratio[3] <= 1.0 && test_ratio[4] <= 1.0;
        let hgt_pass = test_ratio[5] <= 1.0;

        self.set_innovation_fault(innovation_fault::VEL_H, self.fuse_hor_vel && !hvel_pass);
        self.set_innovation_fault(innovation_fault::VEL_V, self.fuse_vert_vel && !vvel_pass);
        self.set_innovation_fault(innovation_fault::POS_H, self.fuse_pos && !hpos_pass);
        self.set_innovation_fault(innovation_fault::POS_V, self.fuse_height && !hgt_pass);

        // A vertical velocity and height innovation failing together with
        // opposite signs is the signature of accelerometer clipping.
        if self.fuse_vert_vel
            && self.fuse_height
            && !vvel_pass
            && !hgt_pass
            && self.innovations.vel_pos[2] * self.innovations.vel_pos[5] < 0.0
        {
            self.height_control.time_bad_vert_accel = self.time_delayed;
        }
        self.faults.bad_vert_accel = self
            .time_delayed
            .since(self.height_control.time_bad_vert_accel)
            .as_secs_f64()
            < BAD_ACC_PROBATION_S
            && !self.height_control.time_bad_vert_accel.is_zero();

        let fuse_flags = [
            self.fuse_hor_vel && hvel_pass,
            self.fuse_hor_vel && hvel_pass,
            self.fuse_vert_vel && vvel_pass,
            self.fuse_pos && hpos_pass,
            self.fuse_pos && hpos_pass,
            self.fuse_height && hgt_pass,
        ];

        let inhibit = self.bias_monitor.is_inhibited();
        let mut any_vel = false;
        let mut any_pos = false;
        let mut any_hgt = false;

        for i in 0..6 {
            if !fuse_flags[i] {
                continue;
            }
            let mut h = StateColumn::zeros();
            h[state_indices[i]] = 1.0;
            let result: ScalarFusion = fuse_scalar(
                &mut self.state,
                &mut self.cov,
                &h,
                self.innovations.vel_pos[i],
                obs_var[i],
                gates[i],
                inhibit,
            );
            if result.fused {
                match i {
                    0..=2 => any_vel = true,
                    3 | 4 => any_pos = true,
                    _ => any_hgt = true,
                }
            }
        }

        if any_vel {
            self.time_last_vel_fuse = self.time_delayed;
        }
        if any_pos {
            self.time_last_pos_fuse = self.time_delayed;
        }
        if any_hgt {
            self.time_last_hgt_fuse = self.time_delayed;
        }

        if any_vel || any_pos || any_hgt {
            self.condition_covariance();
        }
    }

    pub(crate) fn set_innovation_fault(&mut self, bit: u16, failed: bool) {
        if failed {
            self.innovation_fault_status |= bit;
        } else {
            self.innovation_fault_status &= !bit;
        }
    }
}
