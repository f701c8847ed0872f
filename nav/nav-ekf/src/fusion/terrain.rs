//! Single-state terrain height estimator.
//!
//! The distance to ground is estimated as the terrain's vertical position in
//! NED, driven by range finder measurements. Keeping it outside the main
//! state vector decouples a noisy, frequently-dropping sensor from the
//! navigation solution while still providing height-above-ground output.

use nav_types::{RangeSample, Timestamp};

use crate::state::innovation_fault;
use crate::{Ekf, EkfParams};

/// Seconds without a successful range fusion before the estimate goes
/// invalid.
const HAGL_VALID_TIMEOUT_S: f64 = 5.0;

/// One-state Kalman filter over the terrain vertical position.
#[derive(Debug, Clone)]
pub(crate) struct TerrainEstimator {
    vpos: f64,
    var: f64,
    initialised: bool,
    time_last_fuse: Timestamp,
    sin_tilt_rng: f64,
    cos_tilt_rng: f64,
}

impl Default for TerrainEstimator {
    fn default() -> Self {
        Self {
            vpos: 0.0,
            var: 1.0e4,
            initialised: false,
            time_last_fuse: Timestamp::zero(),
            sin_tilt_rng: 0.0,
            cos_tilt_rng: 1.0,
        }
    }
}

impl TerrainEstimator {
    /// Initializes the terrain state below the vehicle.
    pub(crate) fn init(
        &mut self,
        pos_d: f64,
        params: &EkfParams,
        range: Option<&RangeSample>,
    ) {
        self.sin_tilt_rng = params.rng_sens_pitch.sin();
        self.cos_tilt_rng = params.rng_sens_pitch.cos();

        let clearance = params.rng_gnd_clearance;
        self.vpos = match range {
            Some(sample) if sample.is_usable() => pos_d + sample.rng * self.cos_tilt_rng,
            _ => pos_d + clearance,
        };
        self.var = params.range_noise.powi(2).max(0.01);
        self.initialised = true;
    }

    /// Terrain vertical position in NED (m).
    pub(crate) const fn vpos(&self) -> f64 {
        self.vpos
    }

    /// Terrain state variance (m^2).
    pub(crate) const fn variance(&self) -> f64 {
        self.var
    }

    /// Returns `true` while the estimate is fresh enough to use.
    pub(crate) const fn is_valid(&self) -> bool {
        self.initialised
    }

    /// Returns `true` when a range sample has been fused recently.
    pub(crate) fn is_fresh(&self, now: Timestamp) -> bool {
        self.initialised
            && now.since(self.time_last_fuse).as_secs_f64() < HAGL_VALID_TIMEOUT_S
    }

    /// Process model: terrain uncertainty grows with horizontal speed
    /// through the terrain gradient.
    pub(crate) fn predict(&mut self, dt: f64, horiz_speed: f64, params: &EkfParams) {
        if !self.initialised {
            return;
        }
        let process_noise =
            params.terrain_p_noise + params.terrain_gradient * horiz_speed;
        self.var += (process_noise * dt).powi(2);
    }

    /// Scalar Kalman update from a range measurement.
    ///
    /// Returns `(innovation, variance, test_ratio, fused)`.
    pub(crate) fn fuse(
        &mut self,
        range: &RangeSample,
        pos_d: f64,
        vel_d_var: f64,
        r_2_2: f64,
        params: &EkfParams,
        now: Timestamp,
    ) -> (f64, f64, f64, bool) {
        // Project the slant range onto the vertical through both the
        // attitude and the fixed sensor tilt.
        let cos_total = (r_2_2 * self.cos_tilt_rng).max(0.1);
        let measured_vpos = pos_d + range.rng * cos_total;

        let obs_var = params.range_noise.powi(2) + vel_d_var.max(0.0);
        let innovation = measured_vpos - self.vpos;
        let variance = self.var + obs_var;
        let gate = params.range_innov_gate.max(1.0);
        let test_ratio = innovation * innovation / (gate * gate * variance);

        if test_ratio > 1.0 {
            return (innovation, variance, test_ratio, false);
        }

        let gain = self.var / variance;
        self.vpos += gain * innovation;
        self.var = ((1.0 - gain) * self.var).max(1e-4);
        self.time_last_fuse = now;
        (innovation, variance, test_ratio, true)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, vpos: f64, var: f64) {
        self.vpos = vpos;
        self.var = var;
        self.initialised = true;
    }
}

impl Ekf {
    /// Runs the terrain estimator for this tick: prediction plus an update
    /// when a usable range sample reached the fusion horizon.
    pub(crate) fn run_terrain_estimator(&mut self) {
        if !self.terrain.is_valid() {
            let range = self.range_sample_delayed;
            self.terrain
                .init(self.state.pos.z, &self.params, range.as_ref());
            return;
        }

        let dt = self.imu_sample_delayed.delta_vel_dt;
        let horiz_speed = self.state.vel.xy().norm();
        self.terrain.predict(dt, horiz_speed, &self.params);

        // Terrain cannot rise above the vehicle.
        if self.terrain.vpos() < self.state.pos.z {
            self.terrain
                .force_vpos_floor(self.state.pos.z + self.params.rng_gnd_clearance);
        }

        let Some(range) = self.range_sample_delayed else {
            return;
        };
        if !range.is_usable() || self.faults.rng_stuck {
            return;
        }

        let r_2_2 = self.r_to_earth[(2, 2)];
        if r_2_2 < 0.7 {
            return;
        }

        let (innovation, variance, test_ratio, fused) = self.terrain.fuse(
            &range,
            self.state.pos.z,
            self.cov.var(6) * dt * dt,
            r_2_2,
            &self.params,
            self.time_delayed,
        );

        self.innovations.hagl = innovation;
        self.innovations.hagl_var = variance;
        self.innovations.hagl_test_ratio = test_ratio;
        self.set_innovation_fault(innovation_fault::HAGL, !fused);
    }

    /// Height above ground level from the terrain state (m).
    #[must_use]
    pub fn height_above_ground(&self) -> f64 {
        (self.terrain.vpos() - self.state.pos.z).max(0.0)
    }
}

impl TerrainEstimator {
    fn force_vpos_floor(&mut self, floor: f64) {
        self.vpos = floor;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> EkfParams {
        EkfParams::default()
    }

    #[test]
    fn init_from_range_sample() {
        let mut terrain = TerrainEstimator::default();
        let range = RangeSample::new(Timestamp::zero(), 2.0, 200);
        terrain.init(-5.0, &params(), Some(&range));
        assert!(terrain.is_valid());
        assert_relative_eq!(terrain.vpos(), -3.0, epsilon = 1e-12);
    }

    #[test]
    fn init_without_range_uses_ground_clearance() {
        let mut terrain = TerrainEstimator::default();
        terrain.init(0.0, &params(), None);
        assert_relative_eq!(terrain.vpos(), params().rng_gnd_clearance, epsilon = 1e-12);
    }

    #[test]
    fn variance_grows_with_speed() {
        let mut slow = TerrainEstimator::default();
        slow.force_state(5.0, 0.1);
        let mut fast = slow.clone();

        slow.predict(0.008, 0.0, &params());
        fast.predict(0.008, 10.0, &params());
        assert!(fast.variance() > slow.variance());
    }

    #[test]
    fn fusion_converges_to_measurement() {
        let mut terrain = TerrainEstimator::default();
        terrain.force_state(0.0, 100.0);
        let range = RangeSample::new(Timestamp::from_secs_f64(1.0), 8.0, 200);

        let (innovation, _, _, fused) = terrain.fuse(
            &range,
            0.0,
            0.0,
            1.0,
            &params(),
            Timestamp::from_secs_f64(1.0),
        );
        assert!(fused);
        assert!(innovation > 0.0);
        // Large prior variance: the estimate jumps almost to the range.
        assert_relative_eq!(terrain.vpos(), 8.0, epsilon = 0.1);
        assert!(terrain.is_fresh(Timestamp::from_secs_f64(2.0)));
        assert!(!terrain.is_fresh(Timestamp::from_secs_f64(30.0)));
    }

    #[test]
    fn outlier_is_gated() {
        let mut terrain = TerrainEstimator::default();
        terrain.force_state(5.0, 0.01);
        let range = RangeSample::new(Timestamp::from_secs_f64(1.0), 100.0, 200);
        let before = terrain.vpos();
        let (_, _, ratio, fused) = terrain.fuse(
            &range,
            0.0,
            0.0,
            1.0,
            &params(),
            Timestamp::from_secs_f64(1.0),
        );
        assert!(!fused);
        assert!(ratio > 1.0);
        assert_eq!(terrain.vpos(), before);
    }
}
