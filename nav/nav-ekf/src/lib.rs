//! 24-state extended Kalman filter for inertial navigation.
//!
//! This crate fuses integrated inertial data (delta angles and delta
//! velocities) with GNSS, magnetometer, barometer, range finder, optical
//! flow, airspeed, synthetic sideslip, external vision and multirotor drag
//! observations into a continuous estimate of:
//!
//! - attitude quaternion (body to NED)
//! - NED velocity and position
//! - IMU delta-angle and delta-velocity biases
//! - Earth magnetic field and body magnetometer bias
//! - North-East wind velocity
//!
//! # Architecture
//!
//! The filter runs at a *delayed fusion horizon*: observations are buffered
//! until they fall behind `t_now - delay`, so slow sensors are fused against
//! the state valid at their own measurement time. A complementary output
//! predictor re-integrates the newest IMU data forward from the delayed
//! state each tick, producing present-time outputs for the flight
//! controller.
//!
//! - [`buffer`] - Time-ordered sample buffers and IMU downsampling
//! - [`state`] - State vector, index layout, reset bookkeeping
//! - [`covariance`] - Covariance storage and conditioning
//! - [`params`] - Tuning parameters
//! - [`geo`] - Local NED origin and map projection
//!
//! # Scheduling
//!
//! Single-threaded and tick-driven: the host calls a setter per sensor
//! sample and [`Ekf::update`] once per IMU sample. Nothing blocks, nothing
//! allocates after construction, and identical input streams produce
//! bit-identical outputs.
//!
//! # Example
//!
//! ```
//! use nav_ekf::{Ekf, EkfParams};
//! use nav_types::{ImuSample, Timestamp};
//! use nalgebra::Vector3;
//!
//! let mut ekf = Ekf::new(EkfParams::default());
//! assert!(ekf.init(Timestamp::zero()));
//!
//! // Feed level, stationary IMU data.
//! let dt = 0.008;
//! for k in 1..1000u64 {
//!     let imu = ImuSample::new(
//!         Timestamp::from_micros(k * 8_000),
//!         Vector3::zeros(),
//!         Vector3::new(0.0, 0.0, -9.81 * dt),
//!         dt,
//!     );
//!     ekf.set_imu_data(imu);
//!     ekf.update();
//! }
//! ```

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Covariance and Jacobian arithmetic is index-heavy by nature.
#![allow(clippy::many_single_char_names)]
#![allow(clippy::similar_names)]

pub mod buffer;
mod control;
pub mod covariance;
mod fusion;
pub mod geo;
mod output;
mod params;
mod prediction;
mod resets;
pub mod state;

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use nav_types::{
    AirspeedSample, BaroSample, Duration, FlowSample, GpsMessage, ImuSample, MagSample,
    RangeSample, Timestamp, VisionSample,
};

use buffer::{ImuDownSampler, SampleBuffer};
use control::gps::GpsQualityMonitor;
use control::height::HeightControl;
use control::mag::MagControl;
use covariance::{Covariance, InitialVariances, MagCovarianceSnapshot};
use fusion::flow::FlowCompensator;
use fusion::terrain::TerrainEstimator;
use fusion::vision::EvAlignment;
use output::OutputPredictor;
use prediction::{AccelBiasMonitor, VibrationMonitor};
use state::{ResetStatus, StateVector};

pub use params::{gps_check, EkfParams, HeightSource, MagFuseMode};
pub use state::{gps_check_fail, innovation_fault, solution_status, NUM_STATES};

/// Gravity magnitude used by the process model (m/s^2).
pub const GRAVITY_MSS: f64 = 9.80665;

/// Filter update period the IMU stream is downsampled to (s).
pub const FILTER_UPDATE_PERIOD_S: f64 = 0.008;

/// Innovations and innovation variances for every observation class.
///
/// Values persist after fusion (or rejection) for telemetry; a rejected
/// observation still records its innovation and test ratio.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Innovations {
    /// NED velocity and position innovations: 0-2 vel (m/s), 3-5 pos (m).
    pub vel_pos: [f64; 6],
    /// Velocity and position innovation variances.
    pub vel_pos_var: [f64; 6],
    /// Velocity and position innovation test ratios.
    pub vel_pos_test_ratio: [f64; 6],

    /// Magnetometer innovations per body axis (Gauss).
    pub mag: Vector3<f64>,
    /// Magnetometer innovation variances (Gauss^2).
    pub mag_var: Vector3<f64>,
    /// Magnetometer innovation test ratios.
    pub mag_test_ratio: Vector3<f64>,

    /// Heading innovation (rad).
    pub heading: f64,
    /// Heading innovation variance (rad^2).
    pub heading_var: f64,
    /// Heading innovation test ratio.
    pub heading_test_ratio: f64,

    /// True airspeed innovation (m/s).
    pub airspeed: f64,
    /// True airspeed innovation variance ((m/s)^2).
    pub airspeed_var: f64,
    /// True airspeed innovation test ratio.
    pub airspeed_test_ratio: f64,

    /// Synthetic sideslip innovation (rad).
    pub beta: f64,
    /// Synthetic sideslip innovation variance (rad^2).
    pub beta_var: f64,
    /// Synthetic sideslip innovation test ratio.
    pub beta_test_ratio: f64,

    /// Drag specific force innovations, body X/Y (m/s^2).
    pub drag: Vector2<f64>,
    /// Drag innovation variances ((m/s^2)^2).
    pub drag_var: Vector2<f64>,

    /// Optical flow innovations about body X/Y (rad/s).
    pub flow: Vector2<f64>,
    /// Optical flow innovation variances ((rad/s)^2).
    pub flow_var: Vector2<f64>,
    /// Optical flow innovation test ratio (max over axes).
    pub flow_test_ratio: f64,

    /// Height above ground innovation (m).
    pub hagl: f64,
    /// Height above ground innovation variance (m^2).
    pub hagl_var: f64,
    /// Height above ground innovation test ratio.
    pub hagl_test_ratio: f64,
}

/// Aiding and alignment state the fusion-mode controller maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ControlStatus {
    /// Tilt alignment complete.
    pub tilt_align: bool,
    /// Yaw alignment complete.
    pub yaw_align: bool,
    /// GNSS aiding of velocity and position active.
    pub gps: bool,
    /// Optical flow aiding active.
    pub opt_flow: bool,
    /// Magnetic heading fusion active.
    pub mag_hdg: bool,
    /// 3-axis magnetometer fusion active.
    pub mag_3d: bool,
    /// Declination fusion active.
    pub mag_dec: bool,
    /// Magnetometer fusion is faulted.
    pub mag_fault: bool,
    /// In-flight magnetic alignment has completed.
    pub mag_aligned_in_flight: bool,
    /// Barometer is the active height reference.
    pub baro_hgt: bool,
    /// GNSS is the active height reference.
    pub gps_hgt: bool,
    /// Range finder is the active height reference.
    pub rng_hgt: bool,
    /// External vision is the active height reference.
    pub ev_hgt: bool,
    /// External vision position aiding active.
    pub ev_pos: bool,
    /// External vision yaw aiding active.
    pub ev_yaw: bool,
    /// GNSS dual-antenna yaw fusion active.
    pub gps_yaw: bool,
    /// Wind states are being estimated.
    pub wind: bool,
    /// Airspeed fusion active.
    pub fuse_aspd: bool,
    /// Synthetic sideslip fusion active.
    pub fuse_beta: bool,
    /// Vehicle is airborne (host supplied).
    pub in_air: bool,
    /// Vehicle is a fixed-wing (affects sideslip fusion; host supplied).
    pub fixed_wing: bool,
    /// Using synthetic position observations to constrain drift.
    pub synthetic_pos: bool,
    /// Inertial dead reckoning (no aiding source constrains drift).
    pub inertial_dead_reckoning: bool,
}

/// Sensor fault flags the estimator maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct FaultStatus {
    /// Barometer height unusable.
    pub bad_baro_hgt: bool,
    /// GNSS height unusable.
    pub bad_gps_hgt: bool,
    /// Range finder height unusable.
    pub bad_rng_hgt: bool,
    /// Bad vertical accelerometer data detected.
    pub bad_vert_accel: bool,
    /// Range data is not arriving continuously.
    pub rng_not_continuous: bool,
    /// Range finder output appears frozen.
    pub rng_stuck: bool,
}

/// Control limits the host should apply to stay inside sensor envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CtrlLimits {
    /// Maximum horizontal speed (m/s), if limited.
    pub vxy_max: Option<f64>,
    /// Maximum vertical speed (m/s), if limited.
    pub vz_max: Option<f64>,
    /// Minimum height above ground (m), if limited.
    pub hagl_min: Option<f64>,
    /// Maximum height above ground (m), if limited.
    pub hagl_max: Option<f64>,
}

/// The 24-state extended Kalman filter.
///
/// See the crate documentation for the architecture overview. Construct with
/// [`Ekf::new`], call [`Ekf::init`] once, then feed sensor data through the
/// setters and call [`Ekf::update`] once per IMU sample.
#[derive(Debug)]
pub struct Ekf {
    pub(crate) params: EkfParams,

    // -- timing --
    pub(crate) time_last_imu: Timestamp,
    pub(crate) time_delayed: Timestamp,
    pub(crate) dt_ekf_avg: f64,
    pub(crate) filter_initialised: bool,

    // -- buffers --
    pub(crate) imu_down_sampler: ImuDownSampler,
    pub(crate) imu_buffer: SampleBuffer<ImuSample>,
    pub(crate) gps_buffer: SampleBuffer<GpsMessage>,
    pub(crate) mag_buffer: SampleBuffer<MagSample>,
    pub(crate) baro_buffer: SampleBuffer<BaroSample>,
    pub(crate) range_buffer: SampleBuffer<RangeSample>,
    pub(crate) flow_buffer: SampleBuffer<FlowSample>,
    pub(crate) airspeed_buffer: SampleBuffer<AirspeedSample>,
    pub(crate) ev_buffer: SampleBuffer<VisionSample>,

    // -- samples dequeued at the fusion horizon this tick --
    pub(crate) imu_sample_delayed: ImuSample,
    pub(crate) gps_sample_delayed: Option<GpsMessage>,
    pub(crate) mag_sample_delayed: Option<MagSample>,
    pub(crate) baro_sample_delayed: Option<BaroSample>,
    pub(crate) range_sample_delayed: Option<RangeSample>,
    pub(crate) flow_sample_delayed: Option<FlowSample>,
    pub(crate) airspeed_sample_delayed: Option<AirspeedSample>,
    pub(crate) ev_sample_delayed: Option<VisionSample>,

    // -- state and covariance at the delayed horizon --
    pub(crate) state: StateVector,
    pub(crate) cov: Covariance,
    pub(crate) reset_status: ResetStatus,
    pub(crate) r_to_earth: Matrix3<f64>,
    pub(crate) earth_rate_ned: Vector3<f64>,
    pub(crate) origin: geo::Origin,

    // -- controller outputs --
    pub(crate) control: ControlStatus,
    pub(crate) faults: FaultStatus,
    pub(crate) innovations: Innovations,
    pub(crate) innovation_fault_status: u16,
    pub(crate) cov_reset_this_tick: bool,

    // vel/pos kernel inputs staged by the controllers
    pub(crate) fuse_hor_vel: bool,
    pub(crate) fuse_vert_vel: bool,
    pub(crate) fuse_pos: bool,
    pub(crate) fuse_height: bool,
    pub(crate) vel_pos_obs: [f64; 6],
    pub(crate) vel_obs_var: Vector3<f64>,
    pub(crate) pos_obs_var_ne: f64,
    pub(crate) hgt_obs_var: f64,
    pub(crate) pos_innov_gate_ne: f64,
    pub(crate) hgt_innov_gate: f64,

    // -- last successful fusion times --
    pub(crate) time_last_pos_fuse: Timestamp,
    pub(crate) time_last_vel_fuse: Timestamp,
    pub(crate) time_last_hgt_fuse: Timestamp,
    pub(crate) time_last_of_fuse: Timestamp,
    pub(crate) time_last_arsp_fuse: Timestamp,
    pub(crate) time_last_beta_fuse: Timestamp,
    pub(crate) time_last_mag_fuse: Timestamp,
    pub(crate) time_last_fake_pos: Timestamp,
    pub(crate) time_ins_deadreckon_start: Option<Timestamp>,
    pub(crate) last_known_pos_ne: Vector2<f64>,

    // -- sub-controllers --
    pub(crate) gps_monitor: GpsQualityMonitor,
    pub(crate) mag_control: MagControl,
    pub(crate) height_control: HeightControl,
    pub(crate) bias_monitor: AccelBiasMonitor,
    pub(crate) vibe_monitor: VibrationMonitor,
    pub(crate) terrain: TerrainEstimator,
    pub(crate) flow_comp: FlowCompensator,
    pub(crate) ev_align: EvAlignment,
    pub(crate) output_predictor: OutputPredictor,

    // -- initialization accumulators --
    pub(crate) hgt_counter: u32,
    pub(crate) mag_counter: u32,
    pub(crate) baro_filt_state: f64,
    pub(crate) mag_filt_state: Vector3<f64>,
    pub(crate) delta_vel_sum: Vector3<f64>,

    // -- host-supplied flags --
    pub(crate) vehicle_at_rest: bool,

    pub(crate) last_imu_bias_cov_reset: Timestamp,
}

impl Ekf {
    /// Creates a filter with the given parameters.
    ///
    /// All buffers are allocated here; no code path after this allocates.
    #[must_use]
    pub fn new(params: EkfParams) -> Self {
        let delay_s = params.fusion_delay_s();
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let imu_len = ((delay_s / FILTER_UPDATE_PERIOD_S).ceil() as usize + 4).max(8);
        // Aiding sensors arrive far slower than the IMU; a fixed margin of
        // slots covers the worst-case delay at typical rates.
        let aiding_len = 20;

        Self {
            imu_down_sampler: ImuDownSampler::new(FILTER_UPDATE_PERIOD_S),
            imu_buffer: SampleBuffer::new(imu_len),
            gps_buffer: SampleBuffer::new(aiding_len),
            mag_buffer: SampleBuffer::new(aiding_len),
            baro_buffer: SampleBuffer::new(aiding_len),
            range_buffer: SampleBuffer::new(aiding_len),
            flow_buffer: SampleBuffer::new(aiding_len),
            airspeed_buffer: SampleBuffer::new(aiding_len),
            ev_buffer: SampleBuffer::new(aiding_len),

            time_last_imu: Timestamp::zero(),
            time_delayed: Timestamp::zero(),
            dt_ekf_avg: FILTER_UPDATE_PERIOD_S,
            filter_initialised: false,

            imu_sample_delayed: ImuSample::default(),
            gps_sample_delayed: None,
            mag_sample_delayed: None,
            baro_sample_delayed: None,
            range_sample_delayed: None,
            flow_sample_delayed: None,
            airspeed_sample_delayed: None,
            ev_sample_delayed: None,

            state: StateVector::default(),
            cov: Covariance::default(),
            reset_status: ResetStatus::default(),
            r_to_earth: Matrix3::identity(),
            earth_rate_ned: Vector3::zeros(),
            origin: geo::Origin::default(),

            control: ControlStatus::default(),
            faults: FaultStatus::default(),
            innovations: Innovations::default(),
            innovation_fault_status: 0,
            cov_reset_this_tick: false,

            fuse_hor_vel: false,
            fuse_vert_vel: false,
            fuse_pos: false,
            fuse_height: false,
            vel_pos_obs: [0.0; 6],
            vel_obs_var: Vector3::zeros(),
            pos_obs_var_ne: 0.0,
            hgt_obs_var: 0.0,
            pos_innov_gate_ne: 1.0,
            hgt_innov_gate: 1.0,

            time_last_pos_fuse: Timestamp::zero(),
            time_last_vel_fuse: Timestamp::zero(),
            time_last_hgt_fuse: Timestamp::zero(),
            time_last_of_fuse: Timestamp::zero(),
            time_last_arsp_fuse: Timestamp::zero(),
            time_last_beta_fuse: Timestamp::zero(),
            time_last_mag_fuse: Timestamp::zero(),
            time_last_fake_pos: Timestamp::zero(),
            time_ins_deadreckon_start: None,
            last_known_pos_ne: Vector2::zeros(),

            gps_monitor: GpsQualityMonitor::default(),
            mag_control: MagControl::default(),
            height_control: HeightControl::default(),
            bias_monitor: AccelBiasMonitor::default(),
            vibe_monitor: VibrationMonitor::default(),
            terrain: TerrainEstimator::default(),
            flow_comp: FlowCompensator::default(),
            ev_align: EvAlignment::default(),
            output_predictor: OutputPredictor::new(imu_len),

            hgt_counter: 0,
            mag_counter: 0,
            baro_filt_state: 0.0,
            mag_filt_state: Vector3::zeros(),
            delta_vel_sum: Vector3::zeros(),

            vehicle_at_rest: true,

            last_imu_bias_cov_reset: Timestamp::zero(),

            params,
        }
    }

    /// Resets the filter to its uninitialized state at the given time.
    ///
    /// Returns `false` when the parameters fail validation; the filter stays
    /// unusable until `init` succeeds.
    pub fn init(&mut self, time: Timestamp) -> bool {
        if let Err(field) = self.params.validate() {
            tracing::warn!("invalid parameter {field}, filter not initialized");
            return false;
        }

        self.time_last_imu = time;
        self.time_delayed = time;
        self.filter_initialised = false;
        self.state = StateVector::default();
        self.cov = Covariance::default();
        self.reset_status = ResetStatus::default();
        self.control = ControlStatus::default();
        self.faults = FaultStatus::default();
        self.innovations = Innovations::default();
        self.hgt_counter = 0;
        self.mag_counter = 0;
        self.baro_filt_state = 0.0;
        self.mag_filt_state = Vector3::zeros();
        self.delta_vel_sum = Vector3::zeros();
        self.imu_down_sampler.reset();
        self.imu_buffer.clear();
        self.gps_buffer.clear();
        self.mag_buffer.clear();
        self.baro_buffer.clear();
        self.range_buffer.clear();
        self.flow_buffer.clear();
        self.airspeed_buffer.clear();
        self.ev_buffer.clear();
        self.output_predictor.reset(&self.state, time);
        true
    }

    // -- sensor ingest ----------------------------------------------------

    /// Feeds one sensor-rate IMU sample.
    ///
    /// Samples are downsampled to the filter period before buffering.
    /// Returns `true` when a combined sample was enqueued.
    pub fn set_imu_data(&mut self, imu: ImuSample) -> bool {
        if imu.time_us <= self.time_last_imu && !self.time_last_imu.is_zero() {
            return false;
        }
        if imu.validate().is_err() {
            return false;
        }
        self.time_last_imu = imu.time_us;
        self.vibe_monitor.update(&imu);

        if let Some(combined) = self.imu_down_sampler.update(&imu) {
            let dt = combined.delta_ang_dt;
            // Slow moving average of the achieved update interval.
            self.dt_ekf_avg = 0.99 * self.dt_ekf_avg + 0.01 * dt;
            self.imu_buffer.push(combined);
            self.output_predictor.integrate(
                &combined,
                &self.state.delta_ang_bias,
                &self.state.delta_vel_bias,
                self.dt_ekf_avg,
            );
            return true;
        }
        false
    }

    /// Feeds a GNSS message. Quality monitoring runs on receipt.
    ///
    /// The configured receiver delay is subtracted so the buffered
    /// timestamp refers to the measurement time on the IMU clock.
    pub fn set_gps_data(&mut self, mut gps: GpsMessage) {
        self.gps_monitor
            .update(&gps, &self.params, self.vehicle_at_rest, self.time_last_imu);
        gps.time_us = gps
            .time_us
            .saturating_sub(Duration::from_millis(self.params.gps_delay_ms));
        self.gps_buffer.push(gps);
    }

    /// Feeds a magnetometer sample.
    pub fn set_mag_data(&mut self, mut mag: MagSample) {
        mag.time_us = mag
            .time_us
            .saturating_sub(Duration::from_millis(self.params.mag_delay_ms));
        self.mag_buffer.push(mag);
    }

    /// Feeds a barometric altitude sample.
    pub fn set_baro_data(&mut self, mut baro: BaroSample) {
        baro.time_us = baro
            .time_us
            .saturating_sub(Duration::from_millis(self.params.baro_delay_ms));
        self.baro_buffer.push(baro);
    }

    /// Feeds a range finder sample.
    pub fn set_range_data(&mut self, mut range: RangeSample) {
        self.height_control.note_range_arrival(range.time_us);
        range.time_us = range
            .time_us
            .saturating_sub(Duration::from_millis(self.params.range_delay_ms));
        self.range_buffer.push(range);
    }

    /// Feeds an optical flow sample.
    pub fn set_optflow_data(&mut self, mut flow: FlowSample) {
        if flow.quality >= self.params.flow_qual_min && flow.dt > 0.0 {
            flow.time_us = flow
                .time_us
                .saturating_sub(Duration::from_millis(self.params.flow_delay_ms));
            self.flow_buffer.push(flow);
        }
    }

    /// Feeds an airspeed sample.
    pub fn set_airspeed_data(&mut self, mut airspeed: AirspeedSample) {
        airspeed.time_us = airspeed
            .time_us
            .saturating_sub(Duration::from_millis(self.params.airspeed_delay_ms));
        self.airspeed_buffer.push(airspeed);
    }

    /// Feeds an external vision sample.
    pub fn set_ev_data(&mut self, mut ev: VisionSample) {
        ev.time_us = ev
            .time_us
            .saturating_sub(Duration::from_millis(self.params.ev_delay_ms));
        self.ev_buffer.push(ev);
    }

    /// Host report of the airborne state.
    pub fn set_in_air_status(&mut self, in_air: bool) {
        if !in_air {
            self.height_control.last_on_ground_pos_d = self.state.pos.z;
        }
        self.control.in_air = in_air;
    }

    /// Host report that the vehicle is at rest on the ground.
    pub fn set_vehicle_at_rest(&mut self, at_rest: bool) {
        self.vehicle_at_rest = at_rest;
    }

    /// Host report of the airframe type.
    pub fn set_is_fixed_wing(&mut self, fixed_wing: bool) {
        self.control.fixed_wing = fixed_wing;
    }

    // -- main loop --------------------------------------------------------

    /// Runs one filter tick.
    ///
    /// Returns `true` when a prediction-fusion cycle ran, `false` while the
    /// filter is still accumulating alignment data or no IMU sample has
    /// reached the fusion horizon.
    pub fn update(&mut self) -> bool {
        if !self.filter_initialised {
            self.filter_initialised = self.initialise_filter();
            if !self.filter_initialised {
                return false;
            }
        }

        let horizon = self
            .time_last_imu
            .saturating_sub(Duration::from_secs_f64(self.params.fusion_delay_s()));

        let mut updated = false;
        if let Some(imu) = self.imu_buffer.pop_first_older_than(horizon) {
            self.imu_sample_delayed = imu;
            self.time_delayed = imu.time_us;
            self.cov_reset_this_tick = false;

            self.predict_state();
            self.predict_covariance();

            self.poll_aiding_data();
            self.control_fusion_modes();
            self.run_terrain_estimator();

            updated = true;
        }

        self.output_predictor
            .correct(&self.state, self.time_delayed, self.dt_ekf_avg);
        updated
    }

    /// Dequeues aiding samples that have crossed the fusion horizon.
    fn poll_aiding_data(&mut self) {
        let horizon = self.time_delayed;
        self.gps_sample_delayed = self.gps_buffer.pop_first_older_than(horizon);
        self.mag_sample_delayed = self.mag_buffer.pop_first_older_than(horizon);
        self.baro_sample_delayed = self.baro_buffer.pop_first_older_than(horizon);
        self.range_sample_delayed = self.range_buffer.pop_first_older_than(horizon);
        self.flow_sample_delayed = self.flow_buffer.pop_first_older_than(horizon);
        self.airspeed_sample_delayed = self.airspeed_buffer.pop_first_older_than(horizon);
        self.ev_sample_delayed = self.ev_buffer.pop_first_older_than(horizon);
    }

    // -- getters ----------------------------------------------------------

    /// State estimate at the delayed fusion horizon.
    #[must_use]
    pub const fn state(&self) -> &StateVector {
        &self.state
    }

    /// Present-time attitude quaternion.
    #[must_use]
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.output_predictor.quaternion()
    }

    /// Present-time NED velocity (m/s).
    #[must_use]
    pub fn velocity(&self) -> Vector3<f64> {
        self.output_predictor.velocity()
    }

    /// Present-time NED position (m).
    #[must_use]
    pub fn position(&self) -> Vector3<f64> {
        self.output_predictor.position()
    }

    /// Gyro bias estimate (rad/s).
    #[must_use]
    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.state.delta_ang_bias / self.dt_ekf_avg
    }

    /// Accelerometer bias estimate (m/s^2).
    #[must_use]
    pub fn accel_bias(&self) -> Vector3<f64> {
        self.state.delta_vel_bias / self.dt_ekf_avg
    }

    /// Wind velocity estimate, North-East (m/s).
    #[must_use]
    pub const fn wind_velocity(&self) -> Vector2<f64> {
        self.state.wind
    }

    /// Wind velocity variances ((m/s)^2).
    #[must_use]
    pub fn wind_velocity_var(&self) -> Vector2<f64> {
        Vector2::new(self.cov.var(22), self.cov.var(23))
    }

    /// True airspeed derived from the state estimate (m/s).
    #[must_use]
    pub fn true_airspeed(&self) -> f64 {
        let rel = Vector3::new(
            self.state.vel.x - self.state.wind.x,
            self.state.vel.y - self.state.wind.y,
            self.state.vel.z,
        );
        rel.norm()
    }

    /// Full covariance matrix.
    #[must_use]
    pub const fn covariances(&self) -> &covariance::CovMatrix {
        self.cov.matrix()
    }

    /// Covariance matrix diagonal.
    #[must_use]
    pub fn covariances_diagonal(&self) -> nalgebra::SVector<f64, NUM_STATES> {
        self.cov.matrix().diagonal()
    }

    /// Velocity state variances ((m/s)^2).
    #[must_use]
    pub fn velocity_variance(&self) -> Vector3<f64> {
        Vector3::new(self.cov.var(4), self.cov.var(5), self.cov.var(6))
    }

    /// Position state variances (m^2).
    #[must_use]
    pub fn position_variance(&self) -> Vector3<f64> {
        Vector3::new(self.cov.var(7), self.cov.var(8), self.cov.var(9))
    }

    /// 1-sigma horizontal and vertical local position accuracy (m).
    #[must_use]
    pub fn local_position_accuracy(&self) -> (f64, f64) {
        let eph = (self.cov.var(7) + self.cov.var(8)).sqrt();
        let epv = self.cov.var(9).sqrt();
        (eph, epv)
    }

    /// 1-sigma horizontal and vertical global position accuracy (m).
    ///
    /// Matches the local accuracy while aided; once the filter is
    /// dead-reckoning the horizontal term is floored at the unaided
    /// position noise.
    #[must_use]
    pub fn global_position_accuracy(&self) -> (f64, f64) {
        let (eph, epv) = self.local_position_accuracy();
        if self.control.inertial_dead_reckoning {
            (eph.max(self.params.pos_noaid_noise), epv)
        } else {
            (eph, epv)
        }
    }

    /// 1-sigma horizontal and vertical velocity accuracy (m/s).
    #[must_use]
    pub fn velocity_accuracy(&self) -> (f64, f64) {
        let evh = (self.cov.var(4) + self.cov.var(5)).sqrt();
        let evv = self.cov.var(6).sqrt();
        (evh, evv)
    }

    /// Innovations and variances for every observation class.
    #[must_use]
    pub const fn innovations(&self) -> &Innovations {
        &self.innovations
    }

    /// Innovation consistency fault bitmask (see [`innovation_fault`]).
    #[must_use]
    pub const fn innovation_fault_status(&self) -> u16 {
        self.innovation_fault_status
    }

    /// Controller aiding status.
    #[must_use]
    pub const fn control_status(&self) -> &ControlStatus {
        &self.control
    }

    /// Sensor fault flags.
    #[must_use]
    pub const fn fault_status(&self) -> &FaultStatus {
        &self.faults
    }

    /// Vertical position change and counter of the last height reset.
    #[must_use]
    pub const fn pos_d_reset(&self) -> (f64, u8) {
        (self.reset_status.pos_d_change, self.reset_status.pos_d_counter)
    }

    /// Vertical velocity change and counter of the last reset.
    #[must_use]
    pub const fn vel_d_reset(&self) -> (f64, u8) {
        (self.reset_status.vel_d_change, self.reset_status.vel_d_counter)
    }

    /// Horizontal position change and counter of the last reset.
    #[must_use]
    pub const fn pos_ne_reset(&self) -> (Vector2<f64>, u8) {
        (
            self.reset_status.pos_ne_change,
            self.reset_status.pos_ne_counter,
        )
    }

    /// Horizontal velocity change and counter of the last reset.
    #[must_use]
    pub const fn vel_ne_reset(&self) -> (Vector2<f64>, u8) {
        (
            self.reset_status.vel_ne_change,
            self.reset_status.vel_ne_counter,
        )
    }

    /// Quaternion delta and counter of the last attitude reset.
    #[must_use]
    pub const fn quat_reset(&self) -> (UnitQuaternion<f64>, u8) {
        (self.reset_status.quat_change, self.reset_status.quat_counter)
    }

    /// Output predictor angular, velocity and position tracking error
    /// magnitudes (rad, m/s, m).
    #[must_use]
    pub const fn output_tracking_error(&self) -> Vector3<f64> {
        self.output_predictor.tracking_error()
    }

    /// IMU vibration metrics: coning, gyro HF, accel HF.
    #[must_use]
    pub const fn imu_vibration_metrics(&self) -> Vector3<f64> {
        self.vibe_monitor.metrics()
    }

    /// GNSS drift metrics (horizontal m/s, vertical m/s, filtered speed
    /// m/s) and whether IMU movement blocked the measurement. Returns
    /// `None` when no new metrics have been computed since the last call.
    pub fn gps_drift_metrics(&mut self) -> Option<(Vector3<f64>, bool)> {
        self.gps_monitor.take_drift_metrics()
    }

    /// GNSS pre-flight check failure bitmask (see [`gps_check_fail`]).
    #[must_use]
    pub const fn gps_check_fail_status(&self) -> u16 {
        self.gps_monitor.check_fail_status()
    }

    /// The latched NED origin.
    #[must_use]
    pub const fn origin(&self) -> &geo::Origin {
        &self.origin
    }

    /// Estimated terrain vertical position in NED (m).
    #[must_use]
    pub const fn terrain_vertical_position(&self) -> f64 {
        self.terrain.vpos()
    }

    /// Terrain state variance (m^2).
    #[must_use]
    pub const fn terrain_variance(&self) -> f64 {
        self.terrain.variance()
    }

    /// Returns `true` when the terrain estimate is usable.
    #[must_use]
    pub const fn terrain_valid(&self) -> bool {
        self.terrain.is_valid()
    }

    /// Returns `true` while the global position estimate is usable.
    #[must_use]
    pub fn global_position_is_valid(&self) -> bool {
        self.origin.is_valid()
            && !self.control.inertial_dead_reckoning
            && !self.control.synthetic_pos
    }

    /// Returns `true` when position is propagated from inertial data only.
    #[must_use]
    pub const fn is_dead_reckoning(&self) -> bool {
        self.control.inertial_dead_reckoning
    }

    /// Solution status bitmask (see [`solution_status`]).
    #[must_use]
    pub fn solution_status(&self) -> u16 {
        let mut status = 0;
        if self.control.tilt_align && self.control.yaw_align {
            status |= solution_status::ATTITUDE;
        }
        let horiz_aiding = self.control.gps || self.control.opt_flow || self.control.ev_pos;
        if horiz_aiding {
            status |= solution_status::VELOCITY_HORIZ | solution_status::POS_HORIZ_REL;
        }
        if self.filter_initialised {
            status |= solution_status::VELOCITY_VERT | solution_status::POS_VERT_ABS;
        }
        if self.global_position_is_valid() && self.control.gps {
            status |= solution_status::POS_HORIZ_ABS;
        }
        if self.terrain.is_valid() {
            status |= solution_status::POS_VERT_AGL;
        }
        if self.control.synthetic_pos {
            status |= solution_status::CONST_POS_MODE;
        }
        if self.cov_reset_this_tick {
            status |= solution_status::COV_RESET;
        }
        if self.faults.bad_vert_accel {
            status |= solution_status::BAD_ACC_VERTICAL;
        }
        status
    }

    /// Control limits required to keep the filter inside sensor envelopes.
    #[must_use]
    pub fn ctrl_limits(&self) -> CtrlLimits {
        const FLOW_MAX_RATE: f64 = 2.5; // rad/s, typical sensor limit
        const RNG_MAX_DISTANCE: f64 = 30.0;

        let mut limits = CtrlLimits::default();
        if self.control.opt_flow {
            let hagl = (self.terrain.vpos() - self.state.pos.z).max(0.1);
            limits.vxy_max = Some(FLOW_MAX_RATE * hagl);
        }
        if self.control.rng_hgt {
            limits.hagl_min = Some(self.params.rng_gnd_clearance);
            limits.hagl_max = Some(RNG_MAX_DISTANCE * 0.9);
        }
        limits
    }

    /// Saves the magnetic field covariance for reuse after a power cycle.
    #[must_use]
    pub fn save_mag_covariance(&self) -> MagCovarianceSnapshot {
        self.cov.save_mag_covariance()
    }

    /// Restores a previously saved magnetic field covariance.
    pub fn restore_mag_covariance(&mut self, saved: &MagCovarianceSnapshot) {
        self.cov.restore_mag_covariance(saved);
    }

    /// Present-time quaternion computed from the newest unfused IMU data.
    #[must_use]
    pub fn calculate_quaternion(&self) -> UnitQuaternion<f64> {
        let delta_ang = self.imu_sample_delayed.delta_ang - self.state.delta_ang_bias;
        self.state.quat * UnitQuaternion::from_scaled_axis(delta_ang)
    }

    /// Resets all IMU bias states and covariances to initial values.
    ///
    /// Rejected (returns `false`) within 10 seconds of the previous reset so
    /// a glitching host cannot hold the biases at zero.
    pub fn reset_imu_bias(&mut self) -> bool {
        if self
            .time_delayed
            .since(self.last_imu_bias_cov_reset)
            .as_secs_f64()
            < 10.0
            && !self.last_imu_bias_cov_reset.is_zero()
        {
            return false;
        }
        self.reset_imu_bias_states();
        true
    }

    // -- internal helpers shared by the fusion modules --------------------

    /// Applies the standard conditioning pass and records group resets.
    pub(crate) fn condition_covariance(&mut self) {
        let initial = self.initial_variances();
        let fault = self.cov.condition(&initial);
        if fault.any() {
            self.cov_reset_this_tick = true;
            tracing::warn!(?fault, "covariance group reset");
        }
        if fault.quat {
            self.reset_status.quat_counter = self.reset_status.quat_counter.wrapping_add(1);
            self.reset_status.quat_change = UnitQuaternion::identity();
        }
        if fault.vel {
            self.reset_status.vel_ne_counter = self.reset_status.vel_ne_counter.wrapping_add(1);
            self.reset_status.vel_d_counter = self.reset_status.vel_d_counter.wrapping_add(1);
        }
        if fault.pos {
            self.reset_status.pos_ne_counter = self.reset_status.pos_ne_counter.wrapping_add(1);
            self.reset_status.pos_d_counter = self.reset_status.pos_d_counter.wrapping_add(1);
        }
    }

    /// Per-group reset variances derived from the current parameters.
    pub(crate) fn initial_variances(&self) -> InitialVariances {
        let dt = self.dt_ekf_avg;
        InitialVariances {
            quat: 0.01,
            vel: self.params.gps_vel_noise.powi(2).max(0.01),
            pos: self.params.gps_pos_noise.powi(2).max(0.01),
            gyro_bias: (self.params.switch_on_gyro_bias * dt).powi(2),
            gyro_bias_max: (0.349 * dt).powi(2),
            accel_bias: (self.params.switch_on_accel_bias * dt).powi(2),
            accel_bias_max: (self.params.acc_bias_lim * dt).powi(2),
            mag: 2.5e-3,
            wind: self.params.initial_wind_uncertainty.powi(2),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn new_filter_is_uninitialized() {
        let ekf = Ekf::new(EkfParams::default());
        assert!(!ekf.filter_initialised);
        assert_eq!(ekf.state().vel, Vector3::zeros());
    }

    #[test]
    fn init_rejects_invalid_params() {
        let params = EkfParams {
            baro_noise: f64::NAN,
            ..EkfParams::default()
        };
        let mut ekf = Ekf::new(params);
        assert!(!ekf.init(Timestamp::zero()));
    }

    #[test]
    fn update_without_data_returns_false() {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        assert!(!ekf.update());
    }

    #[test]
    fn imu_rejects_stale_timestamps() {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        let imu = ImuSample::new(
            Timestamp::from_micros(1000),
            Vector3::zeros(),
            Vector3::zeros(),
            0.001,
        );
        ekf.set_imu_data(imu);
        // Same timestamp again must be ignored.
        assert!(!ekf.set_imu_data(imu));
    }

    #[test]
    fn reset_imu_bias_is_rate_limited() {
        let mut ekf = Ekf::new(EkfParams::default());
        assert!(ekf.init(Timestamp::zero()));
        ekf.time_delayed = Timestamp::from_secs_f64(100.0);
        assert!(ekf.reset_imu_bias());
        ekf.time_delayed = Timestamp::from_secs_f64(105.0);
        assert!(!ekf.reset_imu_bias(), "second reset within 10 s rejected");
        ekf.time_delayed = Timestamp::from_secs_f64(111.0);
        assert!(ekf.reset_imu_bias());
    }
}
