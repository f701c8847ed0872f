//! Estimator configuration.
//!
//! All tuning lives in one flat block read at initialization and at the top
//! of each update tick; nothing re-reads configuration mid-fusion, so a host
//! changing values between ticks can never split a single fusion step across
//! two configurations.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Selects the primary source of height data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HeightSource {
    /// Barometric altitude (default).
    #[default]
    Baro,
    /// GNSS altitude.
    Gps,
    /// Range finder.
    Range,
    /// External vision.
    Vision,
}

/// Selects how magnetometer data is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MagFuseMode {
    /// Automatic selection between heading and 3-axis fusion.
    #[default]
    Auto,
    /// Always fuse a single heading observation.
    Heading,
    /// Always fuse the full 3-axis field.
    ThreeAxis,
    /// Magnetometer unused.
    None,
}

/// GNSS pre-flight check selection mask bits.
pub mod gps_check {
    /// Require a minimum fix type.
    pub const FIX: u16 = 1 << 0;
    /// Check reported horizontal accuracy.
    pub const EPH: u16 = 1 << 1;
    /// Check reported vertical accuracy.
    pub const EPV: u16 = 1 << 2;
    /// Check reported speed accuracy.
    pub const SACC: u16 = 1 << 3;
    /// Check satellite count.
    pub const NSATS: u16 = 1 << 4;
    /// Check position dilution of precision.
    pub const PDOP: u16 = 1 << 5;
    /// Check horizontal drift while stationary.
    pub const HDRIFT: u16 = 1 << 6;
    /// Check vertical drift while stationary.
    pub const VDRIFT: u16 = 1 << 7;
    /// All checks enabled.
    pub const ALL: u16 = FIX | EPH | EPV | SACC | NSATS | PDOP | HDRIFT | VDRIFT;
}

/// Estimator tuning parameters.
///
/// Defaults are flight-proven values for a small multirotor with a
/// consumer-grade IMU. Units are noted per field; all delays are in
/// milliseconds relative to IMU time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[allow(clippy::struct_excessive_bools)]
pub struct EkfParams {
    // -- time delays relative to IMU --
    /// Fusion horizon delay: the minimum time observations are buffered
    /// before fusion (ms). Must cover the slowest aiding sensor delay.
    pub min_delay_ms: u64,
    /// Magnetometer measurement delay (ms).
    pub mag_delay_ms: u64,
    /// Barometer measurement delay (ms).
    pub baro_delay_ms: u64,
    /// GNSS measurement delay (ms).
    pub gps_delay_ms: u64,
    /// Optical flow measurement delay, mid-integration (ms).
    pub flow_delay_ms: u64,
    /// Range finder measurement delay (ms).
    pub range_delay_ms: u64,
    /// Airspeed measurement delay (ms).
    pub airspeed_delay_ms: u64,
    /// External vision measurement delay (ms).
    pub ev_delay_ms: u64,

    // -- process noise --
    /// IMU gyro noise density (rad/s).
    pub gyro_noise: f64,
    /// IMU accelerometer noise density (m/s^2).
    pub accel_noise: f64,
    /// Delta-angle bias random walk (rad/s^2).
    pub gyro_bias_p_noise: f64,
    /// Delta-velocity bias random walk (m/s^3).
    pub accel_bias_p_noise: f64,
    /// Earth magnetic field random walk (Gauss/s).
    pub mage_p_noise: f64,
    /// Body magnetic bias random walk (Gauss/s).
    pub magb_p_noise: f64,
    /// Wind velocity random walk (m/s^2).
    pub wind_vel_p_noise: f64,
    /// Scales wind process noise with vertical speed to track wind shear.
    pub wind_vel_p_noise_scaler: f64,

    // -- observation noise (1-sigma) and gates (sigma) --
    /// GNSS horizontal velocity observation noise (m/s).
    pub gps_vel_noise: f64,
    /// GNSS position observation noise (m).
    pub gps_pos_noise: f64,
    /// Position observation noise while dead-reckoning (m).
    pub pos_noaid_noise: f64,
    /// Barometric height observation noise (m).
    pub baro_noise: f64,
    /// Magnetometer 3-axis observation noise (Gauss).
    pub mag_noise: f64,
    /// Magnetic heading observation noise (rad).
    pub mag_heading_noise: f64,
    /// Equivalent airspeed observation noise (m/s).
    pub eas_noise: f64,
    /// Synthetic sideslip observation noise (rad).
    pub beta_noise: f64,
    /// Range finder observation noise (m).
    pub range_noise: f64,
    /// Optical flow observation noise at best quality (rad/s).
    pub flow_noise: f64,
    /// Optical flow observation noise at the minimum usable quality (rad/s).
    pub flow_noise_qual_min: f64,
    /// Minimum usable optical flow quality, 0-255.
    pub flow_qual_min: u8,

    /// Velocity fusion innovation gate (sigma).
    pub vel_innov_gate: f64,
    /// Horizontal position fusion innovation gate (sigma).
    pub pos_innov_gate: f64,
    /// Height fusion innovation gate (sigma).
    pub hgt_innov_gate: f64,
    /// Magnetometer 3-axis fusion innovation gate (sigma).
    pub mag_innov_gate: f64,
    /// Heading fusion innovation gate (sigma).
    pub heading_innov_gate: f64,
    /// Airspeed fusion innovation gate (sigma).
    pub tas_innov_gate: f64,
    /// Sideslip fusion innovation gate (sigma).
    pub beta_innov_gate: f64,
    /// Range finder fusion innovation gate (sigma).
    pub range_innov_gate: f64,
    /// Optical flow fusion innovation gate (sigma).
    pub flow_innov_gate: f64,

    // -- magnetometer control --
    /// Magnetometer fusion mode.
    pub mag_fusion_mode: MagFuseMode,
    /// Magnetic declination (rad). Used until GNSS provides a location-based
    /// value through the host.
    pub mag_declination: f64,
    /// Declination fusion uncertainty (rad).
    pub mag_declination_sigma: f64,
    /// Yaw rate above which mag bias states become observable (rad/s).
    pub mag_yaw_rate_gate: f64,
    /// Horizontal acceleration above which yaw becomes observable (m/s^2).
    pub mag_acc_gate: f64,

    // -- height control --
    /// Primary height source.
    pub height_source: HeightSource,
    /// No-fusion timeout on the active height source before fallback (us).
    pub hgt_fuse_timeout_us: u64,
    /// Enables opportunistic range-aid height fusion at low altitude.
    pub range_aid: bool,
    /// Maximum height for range-aid operation (m).
    pub max_hagl_for_range_aid: f64,
    /// Maximum horizontal speed for range-aid operation (m/s).
    pub max_vel_for_range_aid: f64,
    /// Maximum height-above-ground innovation test ratio for range-aid
    /// operation.
    pub range_aid_innov_gate: f64,
    /// Expected range finder reading on ground (m).
    pub rng_gnd_clearance: f64,
    /// Range sensor pitch offset from body down axis (rad).
    pub rng_sens_pitch: f64,

    // -- GNSS quality gate --
    /// Bitmask of enabled pre-flight GNSS checks (see [`gps_check`]).
    pub gps_check_mask: u16,
    /// Maximum reported horizontal accuracy (m).
    pub req_hacc: f64,
    /// Maximum reported vertical accuracy (m).
    pub req_vacc: f64,
    /// Maximum reported speed accuracy (m/s).
    pub req_sacc: f64,
    /// Minimum satellite count.
    pub req_nsats: u8,
    /// Maximum position dilution of precision.
    pub req_pdop: f64,
    /// Maximum horizontal drift rate while stationary (m/s).
    pub req_hdrift: f64,
    /// Maximum vertical drift rate while stationary (m/s).
    pub req_vdrift: f64,

    // -- aiding timeouts --
    /// No-aiding timeout before velocity/position reset (us).
    pub reset_timeout_us: u64,
    /// Continuous pass duration required before GNSS aiding starts (us).
    pub gps_good_duration_us: u64,
    /// Dead-reckoning horizon after which the global position is reported
    /// invalid (us).
    pub valid_timeout_us: u64,

    // -- accelerometer bias learning --
    /// Magnitude limit on the learned delta-velocity bias (m/s^2).
    pub acc_bias_lim: f64,
    /// Acceleration magnitude above which bias learning is inhibited (m/s^2).
    pub acc_bias_learn_acc_lim: f64,
    /// Angular rate magnitude above which bias learning is inhibited (rad/s).
    pub acc_bias_learn_gyr_lim: f64,
    /// Time constant of the inhibit decision filters (s).
    pub acc_bias_learn_tc: f64,

    // -- drag fusion (multirotor wind estimation) --
    /// Ballistic coefficient along body X (kg/m^2).
    pub bcoef_x: f64,
    /// Ballistic coefficient along body Y (kg/m^2).
    pub bcoef_y: f64,
    /// Momentum drag coefficient from rotor inflow (1/s).
    pub mcoef: f64,
    /// Drag specific force observation noise (m/s^2).
    pub drag_noise: f64,

    // -- terrain estimator --
    /// Terrain height process noise (m/s).
    pub terrain_p_noise: f64,
    /// Terrain gradient magnitude coupling process noise to horizontal
    /// speed (m/m).
    pub terrain_gradient: f64,

    // -- external vision --
    /// Minimum external vision observation noise floor (m).
    pub ev_pos_noise_floor: f64,
    /// Minimum external vision angular noise floor (rad).
    pub ev_ang_noise_floor: f64,
    /// Innovation gate for external vision position fusion (sigma).
    pub ev_innov_gate: f64,

    // -- initialization --
    /// 1-sigma tilt uncertainty after gravity alignment (rad).
    pub initial_tilt_err: f64,
    /// 1-sigma gyro bias uncertainty at switch-on (rad/s).
    pub switch_on_gyro_bias: f64,
    /// 1-sigma accel bias uncertainty at switch-on (m/s^2).
    pub switch_on_accel_bias: f64,
    /// 1-sigma wind uncertainty when wind estimation starts (m/s).
    pub initial_wind_uncertainty: f64,
    /// Samples of barometer data filtered before alignment.
    pub hgt_init_count: u32,
    /// Samples of magnetometer data filtered before alignment.
    pub mag_init_count: u32,
}

impl Default for EkfParams {
    fn default() -> Self {
        Self {
            min_delay_ms: 0,
            mag_delay_ms: 0,
            baro_delay_ms: 0,
            gps_delay_ms: 110,
            flow_delay_ms: 5,
            range_delay_ms: 5,
            airspeed_delay_ms: 100,
            ev_delay_ms: 175,

            gyro_noise: 1.5e-2,
            accel_noise: 3.5e-1,
            gyro_bias_p_noise: 1.0e-3,
            accel_bias_p_noise: 3.0e-3,
            mage_p_noise: 1.0e-3,
            magb_p_noise: 1.0e-4,
            wind_vel_p_noise: 1.0e-1,
            wind_vel_p_noise_scaler: 0.5,

            gps_vel_noise: 0.5,
            gps_pos_noise: 0.5,
            pos_noaid_noise: 10.0,
            baro_noise: 2.0,
            mag_noise: 5.0e-2,
            mag_heading_noise: 3.0e-1,
            eas_noise: 1.4,
            beta_noise: 0.3,
            range_noise: 0.1,
            flow_noise: 0.15,
            flow_noise_qual_min: 0.5,
            flow_qual_min: 1,

            vel_innov_gate: 5.0,
            pos_innov_gate: 5.0,
            hgt_innov_gate: 5.0,
            mag_innov_gate: 3.0,
            heading_innov_gate: 2.6,
            tas_innov_gate: 3.0,
            beta_innov_gate: 5.0,
            range_innov_gate: 5.0,
            flow_innov_gate: 3.0,

            mag_fusion_mode: MagFuseMode::Auto,
            mag_declination: 0.0,
            mag_declination_sigma: 0.5,
            mag_yaw_rate_gate: 0.25,
            mag_acc_gate: 0.5,

            height_source: HeightSource::Baro,
            hgt_fuse_timeout_us: 5_000_000,
            range_aid: false,
            max_hagl_for_range_aid: 5.0,
            max_vel_for_range_aid: 1.0,
            range_aid_innov_gate: 1.0,
            rng_gnd_clearance: 0.1,
            rng_sens_pitch: 0.0,

            gps_check_mask: gps_check::ALL,
            req_hacc: 5.0,
            req_vacc: 8.0,
            req_sacc: 1.0,
            req_nsats: 6,
            req_pdop: 2.5,
            req_hdrift: 0.3,
            req_vdrift: 0.5,

            reset_timeout_us: 5_000_000,
            gps_good_duration_us: 10_000_000,
            valid_timeout_us: 5_000_000,

            acc_bias_lim: 0.4,
            acc_bias_learn_acc_lim: 25.0,
            acc_bias_learn_gyr_lim: 3.0,
            acc_bias_learn_tc: 0.5,

            bcoef_x: 25.0,
            bcoef_y: 25.0,
            mcoef: 0.15,
            drag_noise: 2.5,

            terrain_p_noise: 5.0,
            terrain_gradient: 0.5,

            ev_pos_noise_floor: 0.05,
            ev_ang_noise_floor: 0.05,
            ev_innov_gate: 5.0,

            initial_tilt_err: 0.1,
            switch_on_gyro_bias: 0.1,
            switch_on_accel_bias: 0.2,
            initial_wind_uncertainty: 1.0,
            hgt_init_count: 10,
            mag_init_count: 10,
        }
    }
}

impl EkfParams {
    /// Returns the fusion horizon delay: the longest enabled sensor delay
    /// plus the configured minimum (s).
    #[must_use]
    pub fn fusion_delay_s(&self) -> f64 {
        let max_delay_ms = self
            .min_delay_ms
            .max(self.mag_delay_ms)
            .max(self.baro_delay_ms)
            .max(self.gps_delay_ms)
            .max(self.flow_delay_ms)
            .max(self.range_delay_ms)
            .max(self.airspeed_delay_ms)
            .max(self.ev_delay_ms);
        #[allow(clippy::cast_precision_loss)]
        let delay = max_delay_ms as f64 * 1e-3;
        // Margin so late-arriving samples still land inside the buffers.
        delay * 1.5
    }

    /// Validates that all noise values and gates are positive and finite.
    ///
    /// # Errors
    ///
    /// Returns the name of the first offending field.
    pub fn validate(&self) -> Result<(), &'static str> {
        let positives = [
            (self.gyro_noise, "gyro_noise"),
            (self.accel_noise, "accel_noise"),
            (self.gps_vel_noise, "gps_vel_noise"),
            (self.gps_pos_noise, "gps_pos_noise"),
            (self.baro_noise, "baro_noise"),
            (self.mag_noise, "mag_noise"),
            (self.mag_heading_noise, "mag_heading_noise"),
            (self.range_noise, "range_noise"),
            (self.vel_innov_gate, "vel_innov_gate"),
            (self.pos_innov_gate, "pos_innov_gate"),
            (self.hgt_innov_gate, "hgt_innov_gate"),
            (self.mag_innov_gate, "mag_innov_gate"),
            (self.heading_innov_gate, "heading_innov_gate"),
            (self.bcoef_x, "bcoef_x"),
            (self.bcoef_y, "bcoef_y"),
        ];
        for (value, name) in positives {
            if !(value.is_finite() && value > 0.0) {
                return Err(name);
            }
        }
        Ok(())
    }
}
