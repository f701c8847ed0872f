//! Covariance storage and conditioning.
//!
//! The covariance is kept as one contiguous 24x24 block. Every mutating step
//! ends with the same conditioning sequence: diagonal floors, symmetrization,
//! and a per-group health check that falls back to a group reset rather than
//! letting an ill-conditioned matrix poison the filter.

use std::ops::Range;

use nalgebra::{Matrix3, Matrix4x3, SMatrix, UnitQuaternion, Vector3};

use crate::state::{idx, NUM_STATES};

/// The full covariance matrix type.
pub type CovMatrix = SMatrix<f64, NUM_STATES, NUM_STATES>;

/// Per-group variance ceilings. Exceeding one forces a group reset.
const QUAT_VAR_MAX: f64 = 1.0;
const VEL_VAR_MAX: f64 = 1.0e6;
const POS_VAR_MAX: f64 = 1.0e6;
const MAG_VAR_MAX: f64 = 1.0;
const WIND_VAR_MAX: f64 = 1.0e3;

/// Per-group variance floors applied before the health check.
const QUAT_VAR_MIN: f64 = 1.0e-10;
const VEL_VAR_MIN: f64 = 1.0e-6;
const POS_VAR_MIN: f64 = 1.0e-6;
const BIAS_VAR_MIN: f64 = 0.0;

/// Groups whose covariance was reset by the conditioning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CovarianceFault {
    /// Attitude covariance was reset.
    pub quat: bool,
    /// Velocity covariance was reset.
    pub vel: bool,
    /// Position covariance was reset.
    pub pos: bool,
    /// A magnetic field or bias group was reset.
    pub mag: bool,
    /// The wind group was reset.
    pub wind: bool,
}

impl CovarianceFault {
    /// Returns `true` when any group was reset.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.quat || self.vel || self.pos || self.mag || self.wind
    }
}

/// Saved magnetic field covariance for reuse across power cycles or
/// re-initialization of 3-axis fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagCovarianceSnapshot {
    /// Earth field covariance block (Gauss^2).
    pub earth: Matrix3<f64>,
    /// Body bias diagonal variances (Gauss^2).
    pub body_diag: Vector3<f64>,
}

/// State covariance with group-wise conditioning operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    m: CovMatrix,
}

impl Default for Covariance {
    fn default() -> Self {
        Self {
            m: CovMatrix::zeros(),
        }
    }
}

impl Covariance {
    /// Read access to the full matrix.
    #[must_use]
    pub const fn matrix(&self) -> &CovMatrix {
        &self.m
    }

    /// Mutable access for the prediction and fusion steps.
    pub fn matrix_mut(&mut self) -> &mut CovMatrix {
        &mut self.m
    }

    /// Variance of a single state.
    #[must_use]
    pub fn var(&self, i: usize) -> f64 {
        self.m[(i, i)]
    }

    /// Zeroes the rows and columns of a state range against all states.
    pub fn zero_group(&mut self, range: Range<usize>) {
        for i in range {
            for j in 0..NUM_STATES {
                self.m[(i, j)] = 0.0;
                self.m[(j, i)] = 0.0;
            }
        }
    }

    /// Zeroes off-diagonal terms of a range and sets its diagonal.
    pub fn reset_group(&mut self, range: Range<usize>, variance: f64) {
        self.zero_group(range.clone());
        for i in range {
            self.m[(i, i)] = variance;
        }
    }

    /// Forces symmetry: `P = (P + P^T) / 2`.
    pub fn symmetrize(&mut self) {
        for i in 0..NUM_STATES {
            for j in (i + 1)..NUM_STATES {
                let mean = 0.5 * (self.m[(i, j)] + self.m[(j, i)]);
                self.m[(i, j)] = mean;
                self.m[(j, i)] = mean;
            }
        }
    }

    /// Decorrelates the quaternion states from every other group while
    /// keeping the quaternion block itself.
    pub fn uncorrelate_quat_states(&mut self) {
        for i in idx::QUAT {
            for j in idx::QUAT.end..NUM_STATES {
                self.m[(i, j)] = 0.0;
                self.m[(j, i)] = 0.0;
            }
        }
    }

    /// Applies floors, symmetrizes, and resets any group whose diagonal has
    /// gone non-finite or exceeded its ceiling.
    ///
    /// `initial` supplies per-group reset variances. Returns the groups that
    /// were reset.
    pub fn condition(&mut self, initial: &InitialVariances) -> CovarianceFault {
        let mut fault = CovarianceFault::default();

        self.clamp_floor(idx::QUAT, QUAT_VAR_MIN);
        self.clamp_floor(idx::VEL, VEL_VAR_MIN);
        self.clamp_floor(idx::POS, POS_VAR_MIN);
        self.clamp_floor(idx::GYRO_BIAS, BIAS_VAR_MIN);
        self.clamp_floor(idx::ACCEL_BIAS, BIAS_VAR_MIN);

        self.symmetrize();

        if self.group_unhealthy(idx::QUAT, QUAT_VAR_MAX) {
            self.reset_group(idx::QUAT, initial.quat);
            fault.quat = true;
        }
        if self.group_unhealthy(idx::VEL, VEL_VAR_MAX) {
            self.reset_group(idx::VEL, initial.vel);
            fault.vel = true;
        }
        if self.group_unhealthy(idx::POS, POS_VAR_MAX) {
            self.reset_group(idx::POS, initial.pos);
            fault.pos = true;
        }
        if self.group_unhealthy(idx::GYRO_BIAS, initial.gyro_bias_max) {
            self.reset_group(idx::GYRO_BIAS, initial.gyro_bias);
        }
        if self.group_unhealthy(idx::ACCEL_BIAS, initial.accel_bias_max) {
            self.reset_group(idx::ACCEL_BIAS, initial.accel_bias);
        }
        if self.group_unhealthy(idx::MAG_EARTH, MAG_VAR_MAX)
            || self.group_unhealthy(idx::MAG_BIAS, MAG_VAR_MAX)
        {
            self.reset_group(idx::MAG_EARTH, initial.mag);
            self.reset_group(idx::MAG_BIAS, initial.mag);
            fault.mag = true;
        }
        if self.group_unhealthy(idx::WIND, WIND_VAR_MAX) {
            self.reset_group(idx::WIND, initial.wind);
            fault.wind = true;
        }

        fault
    }

    fn clamp_floor(&mut self, range: Range<usize>, floor: f64) {
        for i in range {
            if self.m[(i, i)] < floor {
                self.m[(i, i)] = floor;
            }
        }
    }

    fn group_unhealthy(&self, range: Range<usize>, ceiling: f64) -> bool {
        range
            .into_iter()
            .any(|i| !self.m[(i, i)].is_finite() || self.m[(i, i)] > ceiling)
    }

    /// Converts the quaternion covariance block into the variance of an
    /// equivalent error rotation vector (rad^2).
    #[must_use]
    pub fn rot_vec_variances(&self, quat: &UnitQuaternion<f64>) -> Vector3<f64> {
        // delta_theta = 2 * vec(conj(q_hat) * q), so the Jacobian is twice
        // the vector rows of the left-multiplication matrix of conj(q_hat).
        let j = 2.0 * quat_left_mul_vec_rows(&quat.conjugate());
        let pq = self.m.fixed_view::<4, 4>(0, 0).into_owned();
        let rot_cov = j * pq * j.transpose();
        rot_cov.diagonal()
    }

    /// Initializes the quaternion covariance block from rotation vector
    /// variances (rad^2), zeroing quaternion cross-covariances.
    pub fn init_quat_covariances(
        &mut self,
        quat: &UnitQuaternion<f64>,
        rot_vec_var: &Vector3<f64>,
    ) {
        self.zero_group(idx::QUAT);
        // q = q_hat * dq(delta_theta), d q / d delta_theta at zero error.
        let j = 0.5 * quat_right_mul_cols(quat);
        let pq = j * Matrix3::from_diagonal(rot_vec_var) * j.transpose();
        self.m.fixed_view_mut::<4, 4>(0, 0).copy_from(&pq);
    }

    /// Adds yaw error variance (rad^2) to the quaternion block, leaving
    /// tilt uncertainty unchanged.
    pub fn increase_quat_yaw_err_variance(&mut self, quat: &UnitQuaternion<f64>, yaw_var: f64) {
        // Yaw error applied in the earth frame: q_new = dq_yaw * q.
        // d q_new / d yaw at zero is half the pure-down quaternion product.
        let q = quat.quaternion();
        let col = nalgebra::Vector4::new(-0.5 * q.k, -0.5 * q.j, 0.5 * q.i, 0.5 * q.w);
        let outer = col * col.transpose() * yaw_var;
        let mut block = self.m.fixed_view_mut::<4, 4>(0, 0);
        block += outer;
    }

    /// Snapshot of the magnetic field covariance for later restoration.
    #[must_use]
    pub fn save_mag_covariance(&self) -> MagCovarianceSnapshot {
        MagCovarianceSnapshot {
            earth: self
                .m
                .fixed_view::<3, 3>(idx::MAG_EARTH.start, idx::MAG_EARTH.start)
                .into_owned(),
            body_diag: Vector3::new(
                self.var(idx::MAG_BIAS.start),
                self.var(idx::MAG_BIAS.start + 1),
                self.var(idx::MAG_BIAS.start + 2),
            ),
        }
    }

    /// Restores a previously saved magnetic field covariance, decorrelating
    /// the field groups from everything else.
    pub fn restore_mag_covariance(&mut self, saved: &MagCovarianceSnapshot) {
        self.zero_group(idx::MAG_EARTH);
        self.zero_group(idx::MAG_BIAS);
        self.m
            .fixed_view_mut::<3, 3>(idx::MAG_EARTH.start, idx::MAG_EARTH.start)
            .copy_from(&saved.earth);
        for (k, i) in idx::MAG_BIAS.enumerate() {
            self.m[(i, i)] = saved.body_diag[k];
        }
    }
}

/// Per-group initial (reset) variances derived from the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialVariances {
    /// Quaternion element variance used on a blind attitude reset.
    pub quat: f64,
    /// Velocity variance (m/s)^2.
    pub vel: f64,
    /// Position variance (m^2).
    pub pos: f64,
    /// Delta-angle bias variance (rad^2).
    pub gyro_bias: f64,
    /// Delta-angle bias ceiling before reset (rad^2).
    pub gyro_bias_max: f64,
    /// Delta-velocity bias variance ((m/s)^2).
    pub accel_bias: f64,
    /// Delta-velocity bias ceiling before reset ((m/s)^2).
    pub accel_bias_max: f64,
    /// Magnetic field variance (Gauss^2).
    pub mag: f64,
    /// Wind velocity variance ((m/s)^2).
    pub wind: f64,
}

/// The 3 columns of `d(q_hat * dq)/d(vec(dq))`: right-multiplication by a
/// small quaternion, restricted to its vector part.
fn quat_right_mul_cols(q: &UnitQuaternion<f64>) -> Matrix4x3<f64> {
    let q = q.quaternion();
    Matrix4x3::new(
        -q.i, -q.j, -q.k, //
        q.w, -q.k, q.j, //
        q.k, q.w, -q.i, //
        -q.j, q.i, q.w,
    )
}

/// The vector rows of the left-multiplication matrix `L(p)` such that
/// `vec(p * q) = rows * [w, x, y, z]^T`.
fn quat_left_mul_vec_rows(p: &UnitQuaternion<f64>) -> nalgebra::Matrix3x4<f64> {
    let p = p.quaternion();
    nalgebra::Matrix3x4::new(
        p.i, p.w, -p.k, p.j, //
        p.j, p.k, p.w, -p.i, //
        p.k, -p.j, p.i, p.w,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::state::StateVector;
    use approx::assert_relative_eq;

    fn initial() -> InitialVariances {
        InitialVariances {
            quat: 0.01,
            vel: 0.25,
            pos: 1.0,
            gyro_bias: 1.0e-6,
            gyro_bias_max: 1.0e-2,
            accel_bias: 1.0e-4,
            accel_bias_max: 1.0e-2,
            mag: 2.5e-3,
            wind: 1.0,
        }
    }

    fn seeded() -> Covariance {
        let mut cov = Covariance::default();
        for i in 0..NUM_STATES {
            cov.m[(i, i)] = 0.1;
        }
        cov
    }

    #[test]
    fn symmetrize_averages_off_diagonals() {
        let mut cov = Covariance::default();
        cov.m[(0, 5)] = 2.0;
        cov.m[(5, 0)] = 4.0;
        cov.symmetrize();
        assert_eq!(cov.m[(0, 5)], 3.0);
        assert_eq!(cov.m[(5, 0)], 3.0);
    }

    #[test]
    fn condition_is_noop_on_healthy_matrix() {
        let mut cov = seeded();
        let fault = cov.condition(&initial());
        assert!(!fault.any());
        assert_eq!(cov.var(4), 0.1);
    }

    #[test]
    fn nan_triggers_group_reset() {
        let mut cov = seeded();
        cov.m[(0, 0)] = f64::NAN;
        cov.m[(0, 7)] = 0.05;
        let fault = cov.condition(&initial());
        assert!(fault.quat);
        assert!(!fault.vel && !fault.pos);
        assert_eq!(cov.var(0), 0.01);
        // Cross terms to other groups zeroed
        assert_eq!(cov.m[(0, 7)], 0.0);
        // Untouched groups keep their variance
        assert_eq!(cov.var(7), 0.1);
    }

    #[test]
    fn ceiling_triggers_group_reset() {
        let mut cov = seeded();
        cov.m[(5, 5)] = 1.0e7;
        let fault = cov.condition(&initial());
        assert!(fault.vel);
        assert_eq!(cov.var(5), 0.25);
    }

    #[test]
    fn floors_are_enforced() {
        let mut cov = seeded();
        cov.m[(8, 8)] = -1.0;
        let fault = cov.condition(&initial());
        assert!(!fault.pos, "negative diag is floored, not reset");
        assert!(cov.var(8) >= POS_VAR_MIN);
    }

    #[test]
    fn rot_vec_variance_roundtrip_identity() {
        let mut cov = Covariance::default();
        let quat = UnitQuaternion::identity();
        let rot_var = Vector3::new(0.01, 0.02, 0.03);
        cov.init_quat_covariances(&quat, &rot_var);
        let recovered = cov.rot_vec_variances(&quat);
        assert_relative_eq!(recovered.x, 0.01, epsilon = 1e-12);
        assert_relative_eq!(recovered.y, 0.02, epsilon = 1e-12);
        assert_relative_eq!(recovered.z, 0.03, epsilon = 1e-12);
    }

    #[test]
    fn rot_vec_variance_roundtrip_rotated() {
        let mut cov = Covariance::default();
        let quat = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.0);
        let rot_var = Vector3::new(0.04, 0.01, 0.09);
        cov.init_quat_covariances(&quat, &rot_var);
        let recovered = cov.rot_vec_variances(&quat);
        assert_relative_eq!(recovered.x, 0.04, epsilon = 1e-10);
        assert_relative_eq!(recovered.y, 0.01, epsilon = 1e-10);
        assert_relative_eq!(recovered.z, 0.09, epsilon = 1e-10);
    }

    #[test]
    fn yaw_variance_increase_at_identity() {
        let mut cov = Covariance::default();
        let quat = UnitQuaternion::identity();
        cov.increase_quat_yaw_err_variance(&quat, 0.4);
        let rot_var = cov.rot_vec_variances(&quat);
        assert_relative_eq!(rot_var.z, 0.4, epsilon = 1e-12);
        assert_relative_eq!(rot_var.x, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn uncorrelate_quat_keeps_block() {
        let mut cov = seeded();
        cov.m[(0, 1)] = 0.05;
        cov.m[(1, 0)] = 0.05;
        cov.m[(2, 9)] = 0.07;
        cov.m[(9, 2)] = 0.07;
        cov.uncorrelate_quat_states();
        assert_eq!(cov.m[(0, 1)], 0.05);
        assert_eq!(cov.m[(2, 9)], 0.0);
        assert_eq!(cov.m[(9, 2)], 0.0);
    }

    #[test]
    fn mag_covariance_save_restore() {
        let mut cov = seeded();
        cov.m[(16, 17)] = 0.002;
        cov.m[(17, 16)] = 0.002;
        let saved = cov.save_mag_covariance();

        let mut fresh = Covariance::default();
        fresh.restore_mag_covariance(&saved);
        assert_eq!(fresh.m[(16, 17)], 0.002);
        assert_eq!(fresh.var(20), 0.1);
    }

    // The state-vector helper isn't exercised here but the conversion the
    // rotation-vector tests rely on must agree with how StateVector stores
    // the quaternion: w first.
    #[test]
    fn quat_layout_consistency() {
        let state = StateVector::default();
        assert_eq!(state.to_column()[0], 1.0);
    }
}
