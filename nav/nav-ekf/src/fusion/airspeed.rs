//! True airspeed fusion.

use nalgebra::Vector3;

use crate::fusion::fuse_scalar;
use crate::state::{innovation_fault, StateColumn};
use crate::Ekf;

impl Ekf {
    /// Fuses a true airspeed measurement against the velocity and wind
    /// states.
    ///
    /// The observation model is the magnitude of the air-relative velocity:
    /// `tas = |(vN - wN, vE - wE, vD)|`.
    pub(crate) fn fuse_airspeed(&mut self, true_airspeed: f64, eas2tas: f64) {
        let v_rel = Vector3::new(
            self.state.vel.x - self.state.wind.x,
            self.state.vel.y - self.state.wind.y,
            self.state.vel.z,
        );
        let predicted = v_rel.norm();
        if predicted < 1.0 {
            // Air-relative speed too low for a usable gradient.
            return;
        }

        let mut h = StateColumn::zeros();
        h[4] = v_rel.x / predicted;
        h[5] = v_rel.y / predicted;
        h[6] = v_rel.z / predicted;
        h[22] = -v_rel.x / predicted;
        h[23] = -v_rel.y / predicted;

        let obs_var = (self.params.eas_noise * eas2tas.clamp(0.9, 10.0)).powi(2);
        let innovation = true_airspeed - predicted;

        let result = fuse_scalar(
            &mut self.state,
            &mut self.cov,
            &h,
            innovation,
            obs_var,
            self.params.tas_innov_gate,
            self.bias_monitor.is_inhibited(),
        );

        self.innovations.airspeed = innovation;
        self.innovations.airspeed_var = result.variance;
        self.innovations.airspeed_test_ratio = result.test_ratio;
        self.set_innovation_fault(innovation_fault::TAS, !result.fused);

        if result.fused {
            self.time_last_arsp_fuse = self.time_delayed;
            self.condition_covariance();
        }
    }
}
