//! Observation fusion kernels.
//!
//! Every kernel follows the same contract: compute the innovation
//! `y = z - h(x)` and its variance `S = H P H^T + R`, check the normalized
//! test ratio `y^2 / (gate^2 S)` against 1, and only then apply the scalar
//! sequential update. A rejected observation leaves state and covariance
//! untouched.
//!
//! Vector observations are fused one component at a time in a fixed order;
//! innovations are computed once per kernel invocation and not refreshed
//! between the scalar steps.

pub(crate) mod airspeed;
pub(crate) mod drag;
pub(crate) mod flow;
pub(crate) mod heading;
pub(crate) mod mag;
pub(crate) mod sideslip;
pub(crate) mod terrain;
pub(crate) mod vel_pos;
pub(crate) mod vision;

use crate::covariance::Covariance;
use crate::state::{idx, StateColumn, StateVector};

/// Outcome of one scalar fusion attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScalarFusion {
    /// Innovation variance `S`.
    pub variance: f64,
    /// Normalized innovation test ratio.
    pub test_ratio: f64,
    /// Whether the state was updated.
    pub fused: bool,
    /// False when `S` dropped below the observation noise, indicating an
    /// ill-conditioned covariance.
    pub healthy: bool,
}

/// Applies one scalar sequential Kalman update.
///
/// `h` is the dense observation Jacobian row. When `inhibit_accel_bias` is
/// set the gain rows of the delta-velocity bias states are zeroed so the
/// observation cannot move them.
pub(crate) fn fuse_scalar(
    state: &mut StateVector,
    cov: &mut Covariance,
    h: &StateColumn,
    innovation: f64,
    obs_var: f64,
    gate_sigma: f64,
    inhibit_accel_bias: bool,
) -> ScalarFusion {
    let ph = cov.matrix() * h;
    let variance = h.dot(&ph) + obs_var;

    if !variance.is_finite() || variance < obs_var {
        return ScalarFusion {
            variance,
            test_ratio: f64::INFINITY,
            fused: false,
            healthy: false,
        };
    }

    let gate = gate_sigma.max(1.0);
    let test_ratio = innovation * innovation / (gate * gate * variance);
    if test_ratio > 1.0 {
        return ScalarFusion {
            variance,
            test_ratio,
            fused: false,
            healthy: true,
        };
    }

    let mut gain = ph / variance;
    if inhibit_accel_bias {
        for i in idx::ACCEL_BIAS {
            gain[i] = 0.0;
        }
    }

    // P <- (I - K H) P, computed as P - K (P h)^T.
    let p = cov.matrix_mut();
    *p -= gain * ph.transpose();
    cov.symmetrize();

    state.apply_correction(&gain, innovation);

    ScalarFusion {
        variance,
        test_ratio,
        fused: true,
        healthy: true,
    }
}

/// The 3x4 partial of `R(q)^T a` with respect to the quaternion elements.
///
/// Evaluates the body-frame projection of an earth-frame vector; the
/// conjugation flips the sign of the vector-part columns.
pub(crate) fn inverse_rotated_vector_partial(
    q: &nalgebra::UnitQuaternion<f64>,
    a: &nalgebra::Vector3<f64>,
) -> nalgebra::Matrix3x4<f64> {
    let mut j = crate::prediction::rotated_vector_partial(&q.conjugate(), a);
    for col in 1..4 {
        let scaled = -j.column(col);
        j.set_column(col, &scaled);
    }
    j
}

/// Wraps an angle to the interval (-pi, pi].
pub(crate) fn wrap_pi(angle: f64) -> f64 {
    let mut wrapped = angle % std::f64::consts::TAU;
    if wrapped > std::f64::consts::PI {
        wrapped -= std::f64::consts::TAU;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += std::f64::consts::TAU;
    }
    wrapped
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup() -> (StateVector, Covariance) {
        let mut cov = Covariance::default();
        for i in 0..crate::NUM_STATES {
            cov.matrix_mut()[(i, i)] = 0.5;
        }
        (StateVector::default(), cov)
    }

    #[test]
    fn fuse_reduces_variance() {
        let (mut state, mut cov) = setup();
        let mut h = StateColumn::zeros();
        h[4] = 1.0; // observe vN directly

        let before = cov.var(4);
        let result = fuse_scalar(&mut state, &mut cov, &h, 0.3, 0.1, 5.0, false);
        assert!(result.fused);
        assert!(cov.var(4) < before);
        assert!(state.vel.x > 0.0);
    }

    #[test]
    fn gate_failure_leaves_state_untouched() {
        let (mut state, mut cov) = setup();
        let before_state = state;
        let before_cov = cov.clone();
        let mut h = StateColumn::zeros();
        h[4] = 1.0;

        // Innovation far outside a 1-sigma gate.
        let result = fuse_scalar(&mut state, &mut cov, &h, 100.0, 0.1, 1.0, false);
        assert!(!result.fused);
        assert!(result.test_ratio > 1.0);
        assert_eq!(state, before_state);
        assert_eq!(cov, before_cov);
    }

    #[test]
    fn zero_innovation_keeps_state_but_shrinks_covariance() {
        let (mut state, mut cov) = setup();
        let mut h = StateColumn::zeros();
        h[7] = 1.0;

        let before = cov.var(7);
        let result = fuse_scalar(&mut state, &mut cov, &h, 0.0, 0.01, 5.0, false);
        assert!(result.fused);
        assert_eq!(state.pos.x, 0.0);
        assert!(cov.var(7) < before);
    }

    #[test]
    fn ill_conditioned_covariance_reported() {
        let (mut state, mut cov) = setup();
        cov.matrix_mut()[(4, 4)] = -1.0;
        let mut h = StateColumn::zeros();
        h[4] = 1.0;
        let result = fuse_scalar(&mut state, &mut cov, &h, 0.1, 0.1, 5.0, false);
        assert!(!result.healthy);
        assert!(!result.fused);
    }

    #[test]
    fn accel_bias_inhibit_zeroes_gain_rows() {
        let (mut state, mut cov) = setup();
        // Correlate vN with the accel bias so the gain would move it.
        cov.matrix_mut()[(4, 13)] = 0.2;
        cov.matrix_mut()[(13, 4)] = 0.2;
        let mut h = StateColumn::zeros();
        h[4] = 1.0;

        fuse_scalar(&mut state, &mut cov, &h, 0.3, 0.1, 5.0, true);
        assert_eq!(state.delta_vel_bias.x, 0.0);
        assert!(state.vel.x != 0.0);
    }

    #[test]
    fn wrap_pi_bounds() {
        assert_relative_eq!(wrap_pi(3.0 * std::f64::consts::PI), std::f64::consts::PI);
        assert_relative_eq!(wrap_pi(-3.0 * std::f64::consts::PI), std::f64::consts::PI);
        assert_relative_eq!(wrap_pi(0.5), 0.5);
    }
}
