//! Strapdown prediction and covariance propagation.
//!
//! Each tick consumes one downsampled IMU sample at the delayed horizon:
//! bias-corrected delta angles rotate the attitude quaternion, bias-corrected
//! delta velocities are rotated into NED and integrated into velocity and
//! position. The covariance is propagated through the closed-form discrete
//! transition built from the same quantities.

use nalgebra::{Matrix3, Matrix4x3, SMatrix, UnitQuaternion, Vector3};
use nav_types::ImuSample;

use crate::covariance::CovMatrix;
use crate::geo::EARTH_RATE;
use crate::state::idx;
use crate::{Ekf, GRAVITY_MSS};

impl Ekf {
    /// Runs filter initialization: accumulates reference samples and aligns
    /// tilt and yaw once enough data is available.
    pub(crate) fn initialise_filter(&mut self) -> bool {
        // Consume IMU data while waiting so the buffer cannot saturate with
        // pre-alignment samples.
        let Some(imu) = self.imu_buffer.pop_first_older_than(self.time_last_imu) else {
            return false;
        };
        self.imu_sample_delayed = imu;
        self.time_delayed = imu.time_us;
        self.delta_vel_sum += imu.delta_vel;

        if let Some(baro) = self.baro_buffer.pop_first_older_than(imu.time_us) {
            if self.hgt_counter == 0 {
                self.baro_filt_state = baro.hgt;
            } else {
                self.baro_filt_state = 0.9 * self.baro_filt_state + 0.1 * baro.hgt;
            }
            self.hgt_counter += 1;
        }

        if let Some(mag) = self.mag_buffer.pop_first_older_than(imu.time_us) {
            if self.mag_counter == 0 {
                self.mag_filt_state = mag.mag;
            } else {
                self.mag_filt_state = 0.9 * self.mag_filt_state + 0.1 * mag.mag;
            }
            self.mag_counter += 1;
        }

        if self.hgt_counter < self.params.hgt_init_count
            || self.mag_counter < self.params.mag_init_count
        {
            return false;
        }

        // Tilt alignment from the averaged specific force direction. A
        // stationary, level vehicle accumulates delta velocity along -Z.
        if self.delta_vel_sum.norm() < 0.001 {
            return false;
        }
        let dvel_unit = self.delta_vel_sum.normalize();
        let pitch = dvel_unit.x.clamp(-1.0, 1.0).asin();
        let roll = (-dvel_unit.y).atan2(-dvel_unit.z);
        self.state.quat = UnitQuaternion::from_euler_angles(roll, pitch, 0.0);
        self.r_to_earth = self.state.quat.to_rotation_matrix().into_inner();

        // Height datum: current filtered baro reading maps to zero down
        // position.
        self.height_control.baro_hgt_offset = self.baro_filt_state;
        self.state.pos.z = 0.0;
        self.select_height_source(self.params.height_source);

        self.initialise_covariance();

        // Yaw and magnetic field alignment from the filtered mag sample.
        let mag_init = self.mag_filt_state;
        self.reset_mag_heading(mag_init, false);
        self.control.tilt_align = true;

        self.terrain
            .init(self.state.pos.z, &self.params, self.range_sample_delayed.as_ref());
        self.output_predictor.reset(&self.state, self.time_delayed);
        self.time_last_hgt_fuse = self.time_delayed;
        self.time_last_vel_fuse = self.time_delayed;
        self.time_last_pos_fuse = self.time_delayed;

        tracing::info!(
            yaw = self.state.yaw(),
            "filter aligned from {} baro and {} mag samples",
            self.hgt_counter,
            self.mag_counter
        );
        true
    }

    /// Sets the covariance to its post-alignment initial values.
    pub(crate) fn initialise_covariance(&mut self) {
        let dt = self.dt_ekf_avg;
        let p = &self.params;
        self.cov = crate::covariance::Covariance::default();

        let tilt_var = p.initial_tilt_err.powi(2);
        self.cov.init_quat_covariances(
            &self.state.quat,
            &Vector3::new(tilt_var, tilt_var, tilt_var),
        );

        let m = self.cov.matrix_mut();
        let vel_var = p.gps_vel_noise.powi(2).max(0.01);
        m[(4, 4)] = vel_var;
        m[(5, 5)] = vel_var;
        m[(6, 6)] = 2.25 * vel_var;

        let pos_var = p.gps_pos_noise.powi(2).max(0.01);
        m[(7, 7)] = pos_var;
        m[(8, 8)] = pos_var;
        m[(9, 9)] = p.baro_noise.powi(2);

        let gyro_bias_var = (p.switch_on_gyro_bias * dt).powi(2);
        let accel_bias_var = (p.switch_on_accel_bias * dt).powi(2);
        for i in idx::GYRO_BIAS {
            m[(i, i)] = gyro_bias_var;
        }
        for i in idx::ACCEL_BIAS {
            m[(i, i)] = accel_bias_var;
        }
        for i in idx::MAG_EARTH.start..idx::MAG_BIAS.end {
            m[(i, i)] = 2.5e-3;
        }
        let wind_var = p.initial_wind_uncertainty.powi(2);
        m[(22, 22)] = wind_var;
        m[(23, 23)] = wind_var;
    }

    /// Strapdown integration of the delayed IMU sample.
    pub(crate) fn predict_state(&mut self) {
        let imu = self.imu_sample_delayed;

        // Earth rotation over the integration interval, seen in the body
        // frame. Zero until the origin provides a latitude.
        let earth_delta_ang =
            self.r_to_earth.transpose() * self.earth_rate_ned * imu.delta_ang_dt;
        let corrected_delta_ang = imu.delta_ang - self.state.delta_ang_bias - earth_delta_ang;

        self.state.quat *= UnitQuaternion::from_scaled_axis(corrected_delta_ang);
        self.state.quat.renormalize();
        self.r_to_earth = self.state.quat.to_rotation_matrix().into_inner();

        let corrected_delta_vel = imu.delta_vel - self.state.delta_vel_bias;
        let delta_vel_earth = self.r_to_earth * corrected_delta_vel
            + Vector3::new(0.0, 0.0, GRAVITY_MSS) * imu.delta_vel_dt;

        let vel_prev = self.state.vel;
        self.state.vel += delta_vel_earth;
        // Trapezoidal position integration.
        self.state.pos += (vel_prev + self.state.vel) * 0.5 * imu.delta_vel_dt;

        self.state
            .constrain(self.dt_ekf_avg, self.params.acc_bias_lim);

        self.bias_monitor
            .update(&imu, &self.params, self.faults.bad_vert_accel);
    }

    /// Discrete covariance propagation `P = F P F^T + Q`.
    pub(crate) fn predict_covariance(&mut self) {
        let imu = self.imu_sample_delayed;
        let dt = imu.delta_ang_dt.max(1e-4);
        let dt_vel = imu.delta_vel_dt.max(1e-4);
        let q = self.state.quat;

        let corrected_delta_vel = imu.delta_vel - self.state.delta_vel_bias;

        let mut f: CovMatrix = SMatrix::identity();

        // Attitude rows: q+ = q (x) dq(delta_ang - bias).
        let dq = UnitQuaternion::from_scaled_axis(imu.delta_ang - self.state.delta_ang_bias);
        f.fixed_view_mut::<4, 4>(0, 0)
            .copy_from(&quat_right_mul_matrix(&dq));
        let dq_dtheta = 0.5 * quat_vec_partial(&q);
        f.fixed_view_mut::<4, 3>(0, idx::GYRO_BIAS.start)
            .copy_from(&(-dq_dtheta));

        // Velocity rows: v+ = v + R(q) (delta_vel - bias) + g dt.
        let dv_dq = rotated_vector_partial(&q, &corrected_delta_vel);
        f.fixed_view_mut::<3, 4>(4, 0).copy_from(&dv_dq);
        f.fixed_view_mut::<3, 3>(4, idx::ACCEL_BIAS.start)
            .copy_from(&(-self.r_to_earth));

        // Position rows: p+ = p + v dt.
        f.fixed_view_mut::<3, 3>(7, 4)
            .copy_from(&(Matrix3::identity() * dt_vel));

        // Accel bias variances are frozen while learning is inhibited.
        let accel_bias_inhibited = self.bias_monitor.is_inhibited();
        if accel_bias_inhibited {
            self.bias_monitor.saved_bias_var = Vector3::new(
                self.cov.var(13),
                self.cov.var(14),
                self.cov.var(15),
            );
        }

        let p = self.cov.matrix_mut();
        let mut propagated = f * *p * f.transpose();

        // Process noise injection.
        let gyro_sigma = (self.params.gyro_noise * dt).clamp(0.0, 1.0);
        let gq = 0.5 * quat_vec_partial(&q);
        let q_quat = gq * Matrix3::from_diagonal_element(gyro_sigma * gyro_sigma) * gq.transpose();
        {
            let mut block = propagated.fixed_view_mut::<4, 4>(0, 0);
            block += q_quat;
        }

        let accel_sigma = (self.params.accel_noise * dt_vel).clamp(0.0, 10.0);
        let q_vel =
            self.r_to_earth * Matrix3::from_diagonal_element(accel_sigma * accel_sigma)
                * self.r_to_earth.transpose();
        {
            let mut block = propagated.fixed_view_mut::<3, 3>(4, 4);
            block += q_vel;
        }

        let gyro_bias_sigma = dt * dt * self.params.gyro_bias_p_noise;
        for i in idx::GYRO_BIAS {
            propagated[(i, i)] += gyro_bias_sigma * gyro_bias_sigma;
        }

        if !accel_bias_inhibited {
            let accel_bias_sigma = dt * dt * self.params.accel_bias_p_noise;
            for i in idx::ACCEL_BIAS {
                propagated[(i, i)] += accel_bias_sigma * accel_bias_sigma;
            }
        }

        // Magnetic field states only walk while 3-axis fusion estimates
        // them; likewise the wind states.
        if self.control.mag_3d {
            let mage_sigma = dt * self.params.mage_p_noise;
            for i in idx::MAG_EARTH {
                propagated[(i, i)] += mage_sigma * mage_sigma;
            }
            let magb_sigma = dt * self.params.magb_p_noise;
            for i in idx::MAG_BIAS {
                propagated[(i, i)] += magb_sigma * magb_sigma;
            }
        }

        if self.control.wind {
            let height_rate = self.state.vel.z.abs();
            let wind_sigma = dt
                * self.params.wind_vel_p_noise
                * (1.0 + self.params.wind_vel_p_noise_scaler * height_rate);
            for i in idx::WIND {
                propagated[(i, i)] += wind_sigma * wind_sigma;
            }
        }

        *p = propagated;

        if accel_bias_inhibited {
            let saved = self.bias_monitor.saved_bias_var;
            let p = self.cov.matrix_mut();
            p[(13, 13)] = saved.x;
            p[(14, 14)] = saved.y;
            p[(15, 15)] = saved.z;
        }

        self.condition_covariance();
    }

    /// Latches the Earth rotation vector once the origin latitude is known.
    pub(crate) fn set_earth_rate(&mut self, lat_rad: f64) {
        self.earth_rate_ned =
            EARTH_RATE * Vector3::new(lat_rad.cos(), 0.0, -lat_rad.sin());
    }
}

/// Right-multiplication matrix `M` such that `p (x) r = M(r) p`.
fn quat_right_mul_matrix(r: &UnitQuaternion<f64>) -> nalgebra::Matrix4<f64> {
    let r = r.quaternion();
    nalgebra::Matrix4::new(
        r.w, -r.i, -r.j, -r.k, //
        r.i, r.w, r.k, -r.j, //
        r.j, -r.k, r.w, r.i, //
        r.k, r.j, -r.i, r.w,
    )
}

/// The 4x3 partial of `q (x) dq` with respect to the vector part of a small
/// `dq` at identity.
fn quat_vec_partial(q: &UnitQuaternion<f64>) -> Matrix4x3<f64> {
    let q = q.quaternion();
    Matrix4x3::new(
        -q.i, -q.j, -q.k, //
        q.w, -q.k, q.j, //
        q.k, q.w, -q.i, //
        -q.j, q.i, q.w,
    )
}

/// The 3x4 partial of `R(q) a` with respect to the (unnormalized)
/// quaternion elements.
pub(crate) fn rotated_vector_partial(
    q: &UnitQuaternion<f64>,
    a: &Vector3<f64>,
) -> nalgebra::Matrix3x4<f64> {
    let qq = q.quaternion();
    let w = qq.w;
    let v = Vector3::new(qq.i, qq.j, qq.k);

    let col_w = 2.0 * (w * a + v.cross(a));
    let block = 2.0
        * (v * a.transpose() + Matrix3::from_diagonal_element(v.dot(a))
            - a * v.transpose()
            - w * skew(a));

    let mut out = nalgebra::Matrix3x4::zeros();
    out.set_column(0, &col_w);
    out.fixed_view_mut::<3, 3>(0, 1).copy_from(&block);
    out
}

pub(crate) fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Decaying-envelope monitor deciding when accelerometer bias learning must
/// be inhibited.
#[derive(Debug, Clone)]
pub(crate) struct AccelBiasMonitor {
    accel_mag_filt: f64,
    ang_rate_mag_filt: f64,
    inhibited: bool,
    /// Bias variances saved before a frozen prediction step.
    pub(crate) saved_bias_var: Vector3<f64>,
}

impl Default for AccelBiasMonitor {
    fn default() -> Self {
        Self {
            accel_mag_filt: 0.0,
            ang_rate_mag_filt: 0.0,
            inhibited: false,
            saved_bias_var: Vector3::zeros(),
        }
    }
}

impl AccelBiasMonitor {
    /// Updates the envelope filters from one delayed IMU sample.
    pub(crate) fn update(
        &mut self,
        imu: &ImuSample,
        params: &crate::EkfParams,
        bad_vert_accel: bool,
    ) {
        let dt = imu.delta_ang_dt.max(1e-4);
        let alpha = (dt / params.acc_bias_learn_tc).clamp(0.0, 1.0);
        let beta = 1.0 - alpha;

        let accel_mag = imu.delta_vel.norm() / imu.delta_vel_dt.max(1e-4);
        let ang_rate_mag = imu.delta_ang.norm() / dt;

        self.accel_mag_filt = accel_mag.max(beta * self.accel_mag_filt);
        self.ang_rate_mag_filt = ang_rate_mag.max(beta * self.ang_rate_mag_filt);

        self.inhibited = self.accel_mag_filt > params.acc_bias_learn_acc_lim
            || self.ang_rate_mag_filt > params.acc_bias_learn_gyr_lim
            || bad_vert_accel;
    }

    /// Returns `true` while bias learning is frozen.
    pub(crate) const fn is_inhibited(&self) -> bool {
        self.inhibited
    }
}

/// Filtered IMU vibration metrics: coning, gyro HF, accel HF.
#[derive(Debug, Clone, Default)]
pub(crate) struct VibrationMonitor {
    delta_ang_prev: Vector3<f64>,
    delta_vel_prev: Vector3<f64>,
    metrics: Vector3<f64>,
}

impl VibrationMonitor {
    /// Accumulates one sensor-rate IMU sample.
    pub(crate) fn update(&mut self, imu: &ImuSample) {
        let coning = imu.delta_ang.cross(&self.delta_ang_prev).norm();
        let gyro_hf = (imu.delta_ang - self.delta_ang_prev).norm();
        let accel_hf = (imu.delta_vel - self.delta_vel_prev).norm();

        self.metrics.x = 0.99 * self.metrics.x + 0.01 * coning;
        self.metrics.y = 0.99 * self.metrics.y + 0.01 * gyro_hf;
        self.metrics.z = 0.99 * self.metrics.z + 0.01 * accel_hf;

        self.delta_ang_prev = imu.delta_ang;
        self.delta_vel_prev = imu.delta_vel;
    }

    /// Current filtered metrics.
    pub(crate) const fn metrics(&self) -> Vector3<f64> {
        self.metrics
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::EkfParams;
    use approx::assert_relative_eq;
    use nav_types::Timestamp;

    #[test]
    fn quat_right_mul_matches_product() {
        let p = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let r = UnitQuaternion::from_euler_angles(-0.05, 0.4, 0.02);
        let product = p * r;

        let m = quat_right_mul_matrix(&r);
        let pv = nalgebra::Vector4::new(
            p.quaternion().w,
            p.quaternion().i,
            p.quaternion().j,
            p.quaternion().k,
        );
        let via_matrix = m * pv;

        assert_relative_eq!(via_matrix.x, product.quaternion().w, epsilon = 1e-12);
        assert_relative_eq!(via_matrix.y, product.quaternion().i, epsilon = 1e-12);
        assert_relative_eq!(via_matrix.z, product.quaternion().j, epsilon = 1e-12);
        assert_relative_eq!(via_matrix.w, product.quaternion().k, epsilon = 1e-12);
    }

    #[test]
    fn rotated_vector_partial_matches_finite_difference() {
        let q = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.7);
        let a = Vector3::new(0.3, -1.2, 9.6);
        let jac = rotated_vector_partial(&q, &a);

        let eps = 1e-7;
        let qq = q.quaternion();
        let base = [qq.w, qq.i, qq.j, qq.k];
        for col in 0..4 {
            let mut perturbed = base;
            perturbed[col] += eps;
            let qp = nalgebra::Quaternion::new(
                perturbed[0],
                perturbed[1],
                perturbed[2],
                perturbed[3],
            );
            // Evaluate R(q) a without normalizing, matching the Jacobian's
            // unconstrained-quaternion convention.
            let w = qp.w;
            let v = Vector3::new(qp.i, qp.j, qp.k);
            let rotated = (w * w - v.dot(&v)) * a + 2.0 * v * v.dot(&a) + 2.0 * w * v.cross(&a);

            let w0 = base[0];
            let v0 = Vector3::new(base[1], base[2], base[3]);
            let rotated0 =
                (w0 * w0 - v0.dot(&v0)) * a + 2.0 * v0 * v0.dot(&a) + 2.0 * w0 * v0.cross(&a);

            let fd = (rotated - rotated0) / eps;
            for row in 0..3 {
                assert_relative_eq!(jac[(row, col)], fd[row], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn bias_monitor_inhibits_on_high_accel() {
        let mut monitor = AccelBiasMonitor::default();
        let params = EkfParams::default();
        let violent = ImuSample::new(
            Timestamp::from_micros(8000),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.5, 0.0, 0.0), // 62.5 m/s^2 over 8 ms
            0.008,
        );
        monitor.update(&violent, &params, false);
        assert!(monitor.is_inhibited());

        // Envelope decays back below the limit eventually.
        let calm = ImuSample::new(
            Timestamp::from_micros(16000),
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, -9.81 * 0.008),
            0.008,
        );
        for _ in 0..2000 {
            monitor.update(&calm, &params, false);
        }
        assert!(!monitor.is_inhibited());
    }

    #[test]
    fn bias_monitor_tracks_bad_vert_accel() {
        let mut monitor = AccelBiasMonitor::default();
        let params = EkfParams::default();
        let calm = ImuSample::new(
            Timestamp::from_micros(8000),
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, -9.81 * 0.008),
            0.008,
        );
        monitor.update(&calm, &params, true);
        assert!(monitor.is_inhibited());
    }

    #[test]
    fn vibration_metrics_respond_to_oscillation() {
        let mut vibe = VibrationMonitor::default();
        for k in 0..200 {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            let imu = ImuSample::new(
                Timestamp::from_micros(k * 1000),
                Vector3::new(sign * 0.01, 0.0, 0.0),
                Vector3::new(0.0, 0.0, sign * 0.1),
                0.001,
            );
            vibe.update(&imu);
        }
        let metrics = vibe.metrics();
        assert!(metrics.y > 0.0, "gyro HF metric must respond");
        assert!(metrics.z > 0.0, "accel HF metric must respond");
    }
}
