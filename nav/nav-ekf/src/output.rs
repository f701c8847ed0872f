//! Real-time output predictor.
//!
//! The EKF corrects states at a delayed horizon; flight control needs them
//! now. The output predictor integrates every new IMU sample forward on top
//! of the delayed solution and keeps a buffer of its own history. Each tick
//! it replays its state at the delayed horizon against the EKF's corrected
//! state and feeds the difference back as small corrections, so the
//! present-time outputs converge to the EKF without steps.

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use nav_types::{ImuSample, Timestamp};

use crate::buffer::{SampleBuffer, Timestamped};
use crate::state::StateVector;
use crate::GRAVITY_MSS;

/// Correction time constant (s) for attitude, velocity and position
/// feedback.
const CORRECTION_TAU: f64 = 0.25;

/// One integrated output state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OutputSample {
    pub time_us: Timestamp,
    pub quat: UnitQuaternion<f64>,
    pub vel: Vector3<f64>,
    pub pos: Vector3<f64>,
}

impl Timestamped for OutputSample {
    fn time_us(&self) -> Timestamp {
        self.time_us
    }
}

impl Default for OutputSample {
    fn default() -> Self {
        Self {
            time_us: Timestamp::zero(),
            quat: UnitQuaternion::identity(),
            vel: Vector3::zeros(),
            pos: Vector3::zeros(),
        }
    }
}

/// Complementary forward-integrator tracking the delayed EKF solution.
#[derive(Debug)]
pub(crate) struct OutputPredictor {
    buffer: SampleBuffer<OutputSample>,
    output_new: OutputSample,
    delta_angle_corr: Vector3<f64>,
    vel_err_integ: Vector3<f64>,
    pos_err_integ: Vector3<f64>,
    tracking_error: Vector3<f64>,
}

impl OutputPredictor {
    /// Creates a predictor whose history covers the IMU buffer span.
    pub(crate) fn new(buffer_len: usize) -> Self {
        Self {
            buffer: SampleBuffer::new(buffer_len),
            output_new: OutputSample::default(),
            delta_angle_corr: Vector3::zeros(),
            vel_err_integ: Vector3::zeros(),
            pos_err_integ: Vector3::zeros(),
            tracking_error: Vector3::zeros(),
        }
    }

    /// Present-time attitude.
    pub(crate) const fn quaternion(&self) -> UnitQuaternion<f64> {
        self.output_new.quat
    }

    /// Present-time NED velocity (m/s).
    pub(crate) const fn velocity(&self) -> Vector3<f64> {
        self.output_new.vel
    }

    /// Present-time NED position (m).
    pub(crate) const fn position(&self) -> Vector3<f64> {
        self.output_new.pos
    }

    /// Residual angular, velocity and position tracking error magnitudes
    /// (rad, m/s, m).
    pub(crate) const fn tracking_error(&self) -> Vector3<f64> {
        self.tracking_error
    }

    /// Hard re-anchor of the output states onto the EKF state.
    pub(crate) fn reset(&mut self, state: &StateVector, time: Timestamp) {
        self.buffer.clear();
        self.output_new = OutputSample {
            time_us: time,
            quat: state.quat,
            vel: state.vel,
            pos: state.pos,
        };
        self.buffer.push(self.output_new);
        self.delta_angle_corr = Vector3::zeros();
        self.vel_err_integ = Vector3::zeros();
        self.pos_err_integ = Vector3::zeros();
        self.tracking_error = Vector3::zeros();
    }

    /// Integrates one new IMU sample at the present-time horizon.
    pub(crate) fn integrate(
        &mut self,
        imu: &ImuSample,
        delta_ang_bias: &Vector3<f64>,
        delta_vel_bias: &Vector3<f64>,
        _dt_ekf_avg: f64,
    ) {
        let delta_ang = imu.delta_ang - delta_ang_bias + self.delta_angle_corr;
        self.output_new.quat *= UnitQuaternion::from_scaled_axis(delta_ang);
        self.output_new.quat.renormalize();

        let delta_vel = imu.delta_vel - delta_vel_bias;
        let delta_vel_earth = self.output_new.quat * delta_vel
            + Vector3::new(0.0, 0.0, GRAVITY_MSS) * imu.delta_vel_dt;

        let vel_prev = self.output_new.vel;
        self.output_new.vel += delta_vel_earth;
        self.output_new.pos += (vel_prev + self.output_new.vel) * 0.5 * imu.delta_vel_dt;
        self.output_new.time_us = imu.time_us;

        self.buffer.push(self.output_new);
    }

    /// Computes the tracking error against the corrected EKF state at the
    /// delayed horizon and schedules feedback corrections.
    pub(crate) fn correct(&mut self, state: &StateVector, delayed_time: Timestamp, dt: f64) {
        // Replay: the buffered output sample at the delayed horizon is the
        // one the EKF state should be compared against.
        let mut delayed_output = None;
        while let Some(sample) = self.buffer.pop_first_older_than(delayed_time) {
            delayed_output = Some(sample);
        }
        let Some(delayed_output) = delayed_output else {
            return;
        };

        let q_error = (state.quat.inverse() * delayed_output.quat).into_inner();
        let sign = if q_error.w >= 0.0 { -2.0 } else { 2.0 };
        let delta_ang_error = sign * Vector3::new(q_error.i, q_error.j, q_error.k);

        let vel_err = state.vel - delayed_output.vel;
        let pos_err = state.pos - delayed_output.pos;

        self.tracking_error =
            Vector3::new(delta_ang_error.norm(), vel_err.norm(), pos_err.norm());

        // Attitude: a small corrective rotation folded into the next
        // integration steps.
        let att_gain = 0.5 * dt / CORRECTION_TAU;
        self.delta_angle_corr = delta_ang_error * att_gain;

        // Velocity and position: proportional plus a weak integral that
        // removes steady-state offsets.
        let gain = dt / CORRECTION_TAU;
        self.vel_err_integ += vel_err;
        self.pos_err_integ += pos_err;
        let vel_correction = vel_err * gain + self.vel_err_integ * gain * gain * 0.1;
        let pos_correction = pos_err * gain + self.pos_err_integ * gain * gain * 0.1;

        for sample in self.buffer.iter_mut() {
            sample.vel += vel_correction;
            sample.pos += pos_correction;
        }
        self.output_new.vel += vel_correction;
        self.output_new.pos += pos_correction;
    }

    /// Applies a quaternion reset delta (earth-frame, left-multiplied) to
    /// the present state and the whole history.
    pub(crate) fn apply_quat_reset(&mut self, delta: &UnitQuaternion<f64>) {
        for sample in self.buffer.iter_mut() {
            sample.quat = delta * sample.quat;
        }
        self.output_new.quat = delta * self.output_new.quat;
    }

    /// Applies a horizontal velocity reset delta.
    pub(crate) fn apply_vel_ne_reset(&mut self, delta: Vector2<f64>) {
        for sample in self.buffer.iter_mut() {
            sample.vel.x += delta.x;
            sample.vel.y += delta.y;
        }
        self.output_new.vel.x += delta.x;
        self.output_new.vel.y += delta.y;
    }

    /// Applies a vertical velocity reset delta.
    pub(crate) fn apply_vel_d_reset(&mut self, delta: f64) {
        for sample in self.buffer.iter_mut() {
            sample.vel.z += delta;
        }
        self.output_new.vel.z += delta;
    }

    /// Applies a horizontal position reset delta.
    pub(crate) fn apply_pos_ne_reset(&mut self, delta: Vector2<f64>) {
        for sample in self.buffer.iter_mut() {
            sample.pos.x += delta.x;
            sample.pos.y += delta.y;
        }
        self.output_new.pos.x += delta.x;
        self.output_new.pos.y += delta.y;
    }

    /// Applies a vertical position reset delta.
    pub(crate) fn apply_pos_d_reset(&mut self, delta: f64) {
        for sample in self.buffer.iter_mut() {
            sample.pos.z += delta;
        }
        self.output_new.pos.z += delta;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stationary_imu(k: u64, dt: f64) -> ImuSample {
        ImuSample::new(
            Timestamp::from_micros(k * 8_000),
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, -GRAVITY_MSS * dt),
            dt,
        )
    }

    #[test]
    fn stationary_integration_holds_position() {
        let mut predictor = OutputPredictor::new(16);
        predictor.reset(&StateVector::default(), Timestamp::zero());

        for k in 1..100 {
            predictor.integrate(
                &stationary_imu(k, 0.008),
                &Vector3::zeros(),
                &Vector3::zeros(),
                0.008,
            );
        }
        assert!(predictor.velocity().norm() < 1e-9);
        assert!(predictor.position().norm() < 1e-9);
    }

    #[test]
    fn correction_pulls_output_toward_state() {
        let mut predictor = OutputPredictor::new(16);
        predictor.reset(&StateVector::default(), Timestamp::zero());
        for k in 1..10 {
            predictor.integrate(
                &stationary_imu(k, 0.008),
                &Vector3::zeros(),
                &Vector3::zeros(),
                0.008,
            );
        }

        // The EKF has decided the vehicle is actually 1 m north.
        let state = StateVector {
            pos: Vector3::new(1.0, 0.0, 0.0),
            ..StateVector::default()
        };
        let before = predictor.position().x;
        for _ in 0..50 {
            predictor.correct(&state, Timestamp::from_micros(9 * 8_000), 0.008);
        }
        assert!(predictor.position().x > before);
        assert!(predictor.tracking_error().z > 0.0);
    }

    #[test]
    fn quat_reset_rotates_history() {
        let mut predictor = OutputPredictor::new(16);
        predictor.reset(&StateVector::default(), Timestamp::zero());
        for k in 1..5 {
            predictor.integrate(
                &stationary_imu(k, 0.008),
                &Vector3::zeros(),
                &Vector3::zeros(),
                0.008,
            );
        }

        let delta = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5);
        predictor.apply_quat_reset(&delta);
        assert_relative_eq!(
            predictor.quaternion().euler_angles().2,
            0.5,
            epsilon = 1e-10
        );
    }

    #[test]
    fn pos_reset_shifts_everything() {
        let mut predictor = OutputPredictor::new(16);
        predictor.reset(&StateVector::default(), Timestamp::zero());
        predictor.apply_pos_ne_reset(Vector2::new(10.0, -2.0));
        assert_relative_eq!(predictor.position().x, 10.0, epsilon = 1e-12);
        assert_relative_eq!(predictor.position().y, -2.0, epsilon = 1e-12);
    }
}
