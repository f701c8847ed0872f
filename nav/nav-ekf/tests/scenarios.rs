//! End-to-end estimator scenarios driven through the public API.
//!
//! Each scenario feeds synthetic sensor streams at realistic rates and
//! checks the filter's externally visible behavior: alignment, aiding
//! startup, innovation gating, source fallback and recovery from numerical
//! faults. Universal invariants (quaternion norm, covariance symmetry,
//! non-negative variances) are asserted after every tick.

#![allow(clippy::unwrap_used)]

use nalgebra::{UnitQuaternion, Vector3};
use nav_ekf::{Ekf, EkfParams, GRAVITY_MSS, NUM_STATES};
use nav_types::{BaroSample, GpsFixType, GpsMessage, ImuSample, MagSample, Timestamp};

const DT: f64 = 0.008;
const MAG_FIELD: [f64; 3] = [0.21, 0.0, 0.45];

/// Meters of northing per degree of latitude.
const M_PER_DEG: f64 = 111_194.93;

struct Sim {
    ekf: Ekf,
    now_us: u64,
    yaw_true: f64,
    baro_on: bool,
    gps_on: bool,
    gps_north_m: f64,
    mag_outlier_pending: bool,
}

impl Sim {
    fn new(params: EkfParams) -> Self {
        let mut ekf = Ekf::new(params);
        assert!(ekf.init(Timestamp::zero()));
        Self {
            ekf,
            now_us: 0,
            yaw_true: 0.0,
            baro_on: true,
            gps_on: false,
            gps_north_m: 0.0,
            mag_outlier_pending: false,
        }
    }

    fn body_mag(&self) -> Vector3<f64> {
        let field = Vector3::new(MAG_FIELD[0], MAG_FIELD[1], MAG_FIELD[2]);
        UnitQuaternion::from_euler_angles(0.0, 0.0, self.yaw_true).inverse() * field
    }

    fn gps_message(&self, t: Timestamp) -> GpsMessage {
        GpsMessage {
            time_us: t,
            lat: 47.0 + self.gps_north_m / M_PER_DEG,
            lon: 8.0,
            alt: 488.0,
            vel_ned: Vector3::zeros(),
            fix_type: GpsFixType::Fix3d,
            eph: 0.5,
            epv: 0.8,
            sacc: 0.2,
            n_sats: 14,
            pdop: 1.0,
            yaw: None,
            yaw_offset: 0.0,
        }
    }

    /// Advances one filter period with the given body rotation.
    fn step(&mut self, delta_ang: Vector3<f64>) {
        self.now_us += 8_000;
        let t = Timestamp::from_micros(self.now_us);
        self.yaw_true += delta_ang.z;

        let imu = ImuSample::new(
            t,
            delta_ang,
            Vector3::new(0.0, 0.0, -GRAVITY_MSS * DT),
            DT,
        );
        self.ekf.set_imu_data(imu);

        // Aiding sensors at 25 Hz.
        if self.now_us % 40_000 == 0 {
            if self.baro_on {
                self.ekf.set_baro_data(BaroSample::new(t, 0.0));
            }
            let mag = if self.mag_outlier_pending {
                self.mag_outlier_pending = false;
                // Field rotated a quarter turn: a gross heading outlier.
                UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2)
                    * self.body_mag()
            } else {
                self.body_mag()
            };
            self.ekf.set_mag_data(MagSample::new(t, mag));
        }

        // GNSS at 5 Hz.
        if self.gps_on && self.now_us % 200_000 == 0 {
            let msg = self.gps_message(t);
            self.ekf.set_gps_data(msg);
        }

        self.ekf.update();
        self.check_invariants();
    }

    fn run_secs(&mut self, secs: f64) {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let ticks = (secs / DT).round() as u64;
        for _ in 0..ticks {
            self.step(Vector3::zeros());
        }
    }

    /// Universal invariants that must hold after every tick.
    fn check_invariants(&self) {
        let q = self.ekf.state().quat;
        assert!(
            (q.norm() - 1.0).abs() < 1e-5,
            "quaternion norm drifted: {}",
            q.norm()
        );

        let p = self.ekf.covariances();
        for i in 0..NUM_STATES {
            let d = p[(i, i)];
            assert!(d.is_finite(), "P[{i},{i}] not finite");
            assert!(d >= 0.0, "P[{i},{i}] negative: {d}");
            for j in (i + 1)..NUM_STATES {
                let err = (p[(i, j)] - p[(j, i)]).abs();
                let scale = p[(i, j)].abs().max(p[(j, i)].abs()).max(1.0);
                assert!(err / scale < 1e-6, "P asymmetric at ({i},{j})");
            }
        }
    }
}

fn aligned_sim() -> Sim {
    let mut sim = Sim::new(EkfParams::default());
    sim.run_secs(3.0);
    assert!(sim.ekf.control_status().tilt_align, "tilt alignment");
    assert!(sim.ekf.control_status().yaw_align, "yaw alignment");
    sim
}

#[test]
fn s1_stationary_alignment() {
    let sim = aligned_sim();

    // Attitude converges to identity: level vehicle, field pointing north.
    let angle = sim.ekf.state().quat.angle();
    assert!(angle < 0.02, "attitude error {angle} rad");

    let vel = sim.ekf.state().vel.norm();
    assert!(vel < 0.05, "velocity drift {vel} m/s");

    let pos = sim.ekf.state().pos.norm();
    assert!(pos < 0.1, "position drift {pos} m");

    // Output predictor tracks the delayed solution tightly at rest.
    let track = sim.ekf.output_tracking_error();
    assert!(track.x < 0.01, "angular tracking error {}", track.x);
    assert!(track.y < 0.05, "velocity tracking error {}", track.y);
    assert!(track.z < 0.05, "position tracking error {}", track.z);
}

#[test]
fn s2_pure_yaw_spin() {
    let mut sim = aligned_sim();
    sim.ekf.set_vehicle_at_rest(false);

    let rate = std::f64::consts::FRAC_PI_4; // rad/s
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let ticks = (4.0 / DT).round() as u64;
    for _ in 0..ticks {
        sim.step(Vector3::new(0.0, 0.0, rate * DT));
    }
    // Let the delayed horizon catch up with the end of the spin.
    sim.run_secs(0.5);

    let expected = std::f64::consts::PI;
    let yaw = sim.ekf.state().yaw();
    let err = wrap_angle(yaw - expected).abs();
    assert!(err < 0.01 * expected, "yaw error {err} rad after spin");

    assert!(sim.ekf.state().vel.norm() < 0.1, "velocity drift during spin");
    assert!(sim.ekf.state().pos.norm() < 0.2, "position drift during spin");
}

#[test]
fn s3_gps_position_step_in() {
    let params = EkfParams {
        gps_good_duration_us: 1_000_000,
        reset_timeout_us: 1_000_000,
        ..EkfParams::default()
    };
    let mut sim = Sim::new(params);
    sim.gps_on = true;
    sim.run_secs(5.0);
    assert!(sim.ekf.control_status().gps, "GNSS aiding must be active");
    assert!(sim.ekf.origin().is_valid(), "origin latched");
    assert!(sim.ekf.state().pos.xy().norm() < 0.5);

    let (_, counter_before) = sim.ekf.pos_ne_reset();

    // The receiver jumps 10 m north; the vehicle did not move.
    sim.ekf.set_vehicle_at_rest(false);
    sim.gps_north_m = 10.0;
    sim.run_secs(2.5);

    let (delta, counter_after) = sim.ekf.pos_ne_reset();
    assert_eq!(
        counter_after,
        counter_before.wrapping_add(1),
        "exactly one position reset"
    );
    assert!(delta.x > 5.0, "reset delta covers the step, got {}", delta.x);

    let (eph, _) = sim.ekf.local_position_accuracy();
    let err = (sim.ekf.state().pos.x - 10.0).abs();
    assert!(err < (3.0 * eph).max(1.0), "converged to the step, err {err}");

    // The output predictor was re-anchored by the same reset delta.
    let track = sim.ekf.output_tracking_error();
    assert!(track.z < 0.5, "position tracking error {}", track.z);
}

#[test]
fn s4_height_source_fallback() {
    let params = EkfParams {
        gps_good_duration_us: 1_000_000,
        ..EkfParams::default()
    };
    let mut sim = Sim::new(params);
    sim.gps_on = true;
    sim.run_secs(10.0);
    assert!(sim.ekf.control_status().baro_hgt);
    assert!(sim.ekf.origin().is_valid());

    let (_, counter_before) = sim.ekf.pos_d_reset();

    // Barometer dies at t = 10 s.
    sim.baro_on = false;
    sim.run_secs(7.0);

    assert!(sim.ekf.fault_status().bad_baro_hgt, "baro marked faulty");
    assert!(sim.ekf.control_status().gps_hgt, "fell back to GNSS height");
    assert!(!sim.ekf.control_status().baro_hgt);

    let (_, counter_after) = sim.ekf.pos_d_reset();
    assert_eq!(
        counter_after,
        counter_before.wrapping_add(1),
        "exactly one height reset"
    );

    assert!(
        sim.ekf.state().vel.z.abs() < 1.0,
        "vertical velocity stays bounded: {}",
        sim.ekf.state().vel.z
    );
}

#[test]
fn s5_innovation_gate_rejection() {
    let mut sim = aligned_sim();
    // Active heading fusion requires the on-ground mag inhibit released.
    sim.ekf.set_vehicle_at_rest(false);
    sim.run_secs(1.0);

    let yaw_before = sim.ekf.state().yaw();
    sim.mag_outlier_pending = true;

    let mut saw_rejection = false;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let ticks = (0.7 / DT).round() as u64;
    for _ in 0..ticks {
        sim.step(Vector3::zeros());
        if sim.ekf.innovations().heading_test_ratio > 1.0 {
            saw_rejection = true;
        }
    }
    assert!(saw_rejection, "outlier must fail the innovation gate");

    let yaw_after = sim.ekf.state().yaw();
    assert!(
        wrap_angle(yaw_after - yaw_before).abs() < 0.02,
        "rejected outlier must not move the heading"
    );
}

#[test]
fn s6_covariance_reset_on_overflow() {
    let mut sim = aligned_sim();

    let (_, vel_counter_before) = sim.ekf.vel_ne_reset();
    let (_, quat_counter_before) = sim.ekf.quat_reset();

    // One absurd delta velocity: the covariance propagation overflows the
    // velocity group, which must reset rather than poison the filter.
    sim.now_us += 8_000;
    let poison = ImuSample::new(
        Timestamp::from_micros(sim.now_us),
        Vector3::zeros(),
        Vector3::new(1.0e160, 0.0, -GRAVITY_MSS * DT),
        DT,
    );
    sim.ekf.set_imu_data(poison);
    sim.ekf.update();

    // Keep running: every tick must stay finite.
    sim.run_secs(1.0);

    let (_, vel_counter_after) = sim.ekf.vel_ne_reset();
    let (_, quat_counter_after) = sim.ekf.quat_reset();
    assert_ne!(
        vel_counter_after, vel_counter_before,
        "velocity group reset recorded"
    );
    assert_eq!(
        quat_counter_after, quat_counter_before,
        "attitude group untouched"
    );

    let solution = sim.ekf.solution_status();
    assert!(solution & nav_ekf::solution_status::ATTITUDE != 0);
}

#[test]
fn unaided_drift_stays_bounded() {
    // With no aiding beyond baro and at-rest constraints, a stationary
    // vehicle must not wander.
    let mut sim = aligned_sim();
    sim.run_secs(30.0);

    assert!(sim.ekf.state().vel.norm() < 0.1);
    assert!(sim.ekf.state().pos.xy().norm() < 1.0);
    assert!(!sim.ekf.global_position_is_valid(), "no origin, no global fix");
}

#[test]
fn gps_checks_block_bad_receiver() {
    let params = EkfParams {
        gps_good_duration_us: 1_000_000,
        ..EkfParams::default()
    };
    let mut sim = Sim::new(params);
    sim.run_secs(3.0);

    // A receiver with too few satellites never starts aiding.
    for _ in 0..50 {
        let t = Timestamp::from_micros(sim.now_us + 1);
        let mut msg = sim.gps_message(t);
        msg.n_sats = 3;
        sim.ekf.set_gps_data(msg);
        sim.run_secs(0.2);
    }

    assert!(!sim.ekf.control_status().gps);
    assert!(sim.ekf.gps_check_fail_status() & nav_ekf::gps_check_fail::NSATS != 0);
}

fn wrap_angle(angle: f64) -> f64 {
    let mut wrapped = angle % std::f64::consts::TAU;
    if wrapped > std::f64::consts::PI {
        wrapped -= std::f64::consts::TAU;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += std::f64::consts::TAU;
    }
    wrapped
}
