//! GNSS quality gating and aiding control.
//!
//! Aiding never starts on a single good fix: every enabled receiver check
//! must pass continuously for a configured duration before the origin is
//! latched and GNSS observations reach the filter.

use nalgebra::{Vector2, Vector3};
use nav_types::{GpsMessage, Timestamp};

use crate::geo::MapProjection;
use crate::params::gps_check;
use crate::state::gps_check_fail;
use crate::{Ekf, EkfParams};

/// Low-pass coefficient for the drift-rate filters.
const DRIFT_FILT_ALPHA: f64 = 0.1;

/// Per-receiver quality monitor run on message receipt.
#[derive(Debug, Clone)]
pub(crate) struct GpsQualityMonitor {
    check_fail_status: u16,
    time_last_fail: Timestamp,
    time_last_pass: Timestamp,
    prev_msg: Option<GpsMessage>,
    horiz_drift_rate: Vector2<f64>,
    vert_drift_rate: f64,
    speed_filt: f64,
    drift_metrics: Option<(Vector3<f64>, bool)>,
}

impl Default for GpsQualityMonitor {
    fn default() -> Self {
        Self {
            check_fail_status: 0,
            time_last_fail: Timestamp::zero(),
            time_last_pass: Timestamp::zero(),
            prev_msg: None,
            horiz_drift_rate: Vector2::zeros(),
            vert_drift_rate: 0.0,
            speed_filt: 0.0,
            drift_metrics: None,
        }
    }
}

impl GpsQualityMonitor {
    /// Runs the receiver checks on a new message.
    pub(crate) fn update(
        &mut self,
        msg: &GpsMessage,
        params: &EkfParams,
        at_rest: bool,
        now: Timestamp,
    ) {
        let mut fail = 0u16;
        let mask = params.gps_check_mask;

        if mask & gps_check::FIX != 0 && !msg.has_3d_fix() {
            fail |= gps_check_fail::FIX;
        }
        if mask & gps_check::EPH != 0 && msg.eph > params.req_hacc {
            fail |= gps_check_fail::EPH;
        }
        if mask & gps_check::EPV != 0 && msg.epv > params.req_vacc {
            fail |= gps_check_fail::EPV;
        }
        if mask & gps_check::SACC != 0 && msg.sacc > params.req_sacc {
            fail |= gps_check_fail::SACC;
        }
        if mask & gps_check::NSATS != 0 && msg.n_sats < params.req_nsats {
            fail |= gps_check_fail::NSATS;
        }
        if mask & gps_check::PDOP != 0 && msg.pdop > params.req_pdop {
            fail |= gps_check_fail::PDOP;
        }

        self.update_drift(msg, at_rest);
        if at_rest {
            if mask & gps_check::HDRIFT != 0 && self.horiz_drift_rate.norm() > params.req_hdrift {
                fail |= gps_check_fail::HDRIFT;
            }
            if mask & gps_check::VDRIFT != 0 && self.vert_drift_rate.abs() > params.req_vdrift {
                fail |= gps_check_fail::VDRIFT;
            }
        }

        self.check_fail_status = fail;
        if fail == 0 {
            self.time_last_pass = now;
        } else {
            self.time_last_fail = now;
        }
        self.prev_msg = Some(*msg);
    }

    fn update_drift(&mut self, msg: &GpsMessage, at_rest: bool) {
        let Some(prev) = self.prev_msg else {
            return;
        };
        let dt = msg.time_us.since(prev.time_us).as_secs_f64();
        if dt <= 0.0 || dt > 10.0 {
            return;
        }

        if at_rest {
            // Position delta in meters from consecutive fixes.
            let proj = MapProjection::new(prev.lat, prev.lon);
            let (dn, de) = proj.project(msg.lat, msg.lon);
            let rate = Vector2::new(dn / dt, de / dt);
            self.horiz_drift_rate += DRIFT_FILT_ALPHA * (rate - self.horiz_drift_rate);

            let vert_rate = (msg.alt - prev.alt) / dt;
            self.vert_drift_rate += DRIFT_FILT_ALPHA * (vert_rate - self.vert_drift_rate);

            let speed = msg.vel_ned.xy().norm();
            self.speed_filt += DRIFT_FILT_ALPHA * (speed - self.speed_filt);
            self.drift_metrics = Some((
                Vector3::new(
                    self.horiz_drift_rate.norm(),
                    self.vert_drift_rate,
                    self.speed_filt,
                ),
                false,
            ));
        } else {
            // Vehicle motion makes the static drift measurement meaningless;
            // decay the filters so stale values cannot block a later check.
            self.horiz_drift_rate *= 1.0 - DRIFT_FILT_ALPHA;
            self.vert_drift_rate *= 1.0 - DRIFT_FILT_ALPHA;
            self.drift_metrics = Some((
                Vector3::new(
                    self.horiz_drift_rate.norm(),
                    self.vert_drift_rate,
                    self.speed_filt,
                ),
                true,
            ));
        }
    }

    /// Bitmask of currently failing checks.
    pub(crate) const fn check_fail_status(&self) -> u16 {
        self.check_fail_status
    }

    /// Returns `true` when every enabled check has passed continuously for
    /// `duration_us`.
    pub(crate) fn passed_continuously(&self, now: Timestamp, duration_us: u64) -> bool {
        if self.check_fail_status != 0 || self.time_last_pass.is_zero() {
            return false;
        }
        // A zero fail time means "never failed"; measuring from boot keeps
        // the proving window in force even for a receiver that was clean
        // from its first message.
        now.since(self.time_last_fail).as_micros() >= duration_us
    }

    /// Returns new drift metrics once, or `None` until the next update.
    pub(crate) fn take_drift_metrics(&mut self) -> Option<(Vector3<f64>, bool)> {
        self.drift_metrics.take()
    }
}

impl Ekf {
    /// GNSS aiding state machine: origin latching, aiding start, fusion
    /// staging, and timeout handling.
    pub(crate) fn control_gps_fusion(&mut self) {
        let checks_ok = self
            .gps_monitor
            .passed_continuously(self.time_last_imu, self.params.gps_good_duration_us);

        // Start aiding once aligned and the receiver has proven itself.
        if !self.control.gps
            && checks_ok
            && self.control.tilt_align
            && self.control.yaw_align
        {
            if let Some(gps) = self.gps_sample_delayed {
                if !self.origin.is_valid() {
                    self.latch_origin(&gps);
                }
                self.control.gps = true;
                let (north, east) = self.project_gps(&gps);
                let pos_var = self.params.gps_pos_noise.powi(2).max(gps.eph * gps.eph);
                self.reset_pos_ne_to(Vector2::new(north, east), pos_var);
                let vel_var = self.params.gps_vel_noise.powi(2).max(gps.sacc * gps.sacc);
                self.reset_vel_ne_to(gps.vel_ned.xy(), vel_var);
                self.reset_vel_d_to(gps.vel_ned.z, 1.5 * vel_var);
                tracing::info!("starting GNSS aiding");
            }
        }

        if !self.control.gps {
            return;
        }

        // Stage observations when a sample reached the horizon this tick.
        if let Some(gps) = self.gps_sample_delayed {
            if self.origin.is_valid() {
                let (north, east) = self.project_gps(&gps);
                self.fuse_hor_vel = true;
                self.fuse_vert_vel = true;
                self.fuse_pos = true;
                self.vel_pos_obs[0] = gps.vel_ned.x;
                self.vel_pos_obs[1] = gps.vel_ned.y;
                self.vel_pos_obs[2] = gps.vel_ned.z;
                self.vel_pos_obs[3] = north;
                self.vel_pos_obs[4] = east;

                let vel_var = self.params.gps_vel_noise.powi(2).max(gps.sacc * gps.sacc);
                self.vel_obs_var = Vector3::new(vel_var, vel_var, 2.25 * vel_var);
                self.pos_obs_var_ne = self.params.gps_pos_noise.powi(2).max(gps.eph * gps.eph);
                self.pos_innov_gate_ne = self.params.pos_innov_gate;
                self.control.synthetic_pos = false;

                // Dual-antenna yaw arrives with the same message.
                if let Some(yaw) = gps.yaw {
                    self.control.gps_yaw = true;
                    self.fuse_gps_yaw(yaw, gps.yaw_offset);
                } else {
                    self.control.gps_yaw = false;
                }
            }
        }

        // Fusion timeouts are handled per channel: persistent gate failure
        // on one channel resets that channel onto fresh data; losing both
        // with no fresh data stops aiding entirely.
        let timeout = self.params.reset_timeout_us;
        let vel_timed_out = self.time_delayed.since(self.time_last_vel_fuse).as_micros() > timeout;
        let pos_timed_out = self.time_delayed.since(self.time_last_pos_fuse).as_micros() > timeout;
        if !vel_timed_out && !pos_timed_out {
            return;
        }

        let recent_gps = self
            .time_delayed
            .since(self.gps_buffer.newest_time())
            .as_micros()
            < timeout;
        let fresh = self
            .gps_sample_delayed
            .or(self.gps_buffer.newest().copied());

        if recent_gps && self.gps_monitor.check_fail_status() == 0 {
            if let Some(gps) = fresh {
                if pos_timed_out {
                    let (north, east) = self.project_gps(&gps);
                    let pos_var = self.params.gps_pos_noise.powi(2).max(gps.eph * gps.eph);
                    self.reset_pos_ne_to(Vector2::new(north, east), pos_var);
                    tracing::warn!("GNSS position fusion timeout, reset onto fresh data");
                }
                if vel_timed_out {
                    let vel_var = self.params.gps_vel_noise.powi(2).max(gps.sacc * gps.sacc);
                    self.reset_vel_ne_to(gps.vel_ned.xy(), vel_var);
                    self.reset_vel_d_to(gps.vel_ned.z, 1.5 * vel_var);
                    tracing::warn!("GNSS velocity fusion timeout, reset onto fresh data");
                }
            }
        } else if vel_timed_out && pos_timed_out {
            self.control.gps = false;
            self.last_known_pos_ne = self.state.pos.xy();
            tracing::warn!("GNSS fusion timeout, aiding stopped");
        }
    }

    /// Latches the NED origin at a GNSS fix and derives the Earth rotation.
    pub(crate) fn latch_origin(&mut self, gps: &GpsMessage) {
        let projection = MapProjection::new(gps.lat, gps.lon);
        self.set_earth_rate(projection.lat_rad());
        self.origin = crate::geo::Origin {
            time_set: self.time_delayed,
            projection: Some(projection),
            // Compensate for the distance already descended from the datum.
            alt_ref: gps.alt + self.state.pos.z,
        };
        tracing::info!(lat = gps.lat, lon = gps.lon, "NED origin latched");
    }

    fn project_gps(&self, gps: &GpsMessage) -> (f64, f64) {
        self.origin
            .projection
            .map_or((0.0, 0.0), |proj| proj.project(gps.lat, gps.lon))
    }
}

/// Message builders shared with other controller tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::{GpsMessage, Timestamp, Vector3};
    use nav_types::GpsFixType;

    pub(crate) fn good_msg_at(time_s: f64) -> GpsMessage {
        GpsMessage {
            time_us: Timestamp::from_secs_f64(time_s),
            lat: 47.3977,
            lon: 8.5456,
            alt: 488.0,
            vel_ned: Vector3::zeros(),
            fix_type: GpsFixType::Fix3d,
            eph: 0.8,
            epv: 1.2,
            sacc: 0.3,
            n_sats: 14,
            pdop: 1.2,
            yaw: None,
            yaw_offset: 0.0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use nav_types::GpsFixType;

    fn good_msg(time_s: f64) -> GpsMessage {
        tests_support::good_msg_at(time_s)
    }

    #[test]
    fn good_message_passes_all_checks() {
        let mut monitor = GpsQualityMonitor::default();
        monitor.update(
            &good_msg(1.0),
            &EkfParams::default(),
            true,
            Timestamp::from_secs_f64(1.0),
        );
        assert_eq!(monitor.check_fail_status(), 0);
    }

    #[test]
    fn each_check_sets_its_bit() {
        let params = EkfParams::default();
        let mut monitor = GpsQualityMonitor::default();
        let now = Timestamp::from_secs_f64(1.0);

        let mut msg = good_msg(1.0);
        msg.fix_type = GpsFixType::Fix2d;
        monitor.update(&msg, &params, true, now);
        assert!(monitor.check_fail_status() & gps_check_fail::FIX != 0);

        let mut msg = good_msg(2.0);
        msg.eph = 50.0;
        monitor.update(&msg, &params, true, now);
        assert!(monitor.check_fail_status() & gps_check_fail::EPH != 0);

        let mut msg = good_msg(3.0);
        msg.n_sats = 3;
        monitor.update(&msg, &params, true, now);
        assert!(monitor.check_fail_status() & gps_check_fail::NSATS != 0);

        let mut msg = good_msg(4.0);
        msg.pdop = 9.0;
        monitor.update(&msg, &params, true, now);
        assert!(monitor.check_fail_status() & gps_check_fail::PDOP != 0);
    }

    #[test]
    fn disabled_checks_are_skipped() {
        let params = EkfParams {
            gps_check_mask: gps_check::FIX,
            ..EkfParams::default()
        };
        let mut monitor = GpsQualityMonitor::default();
        let mut msg = good_msg(1.0);
        msg.eph = 100.0;
        monitor.update(&msg, &params, true, Timestamp::from_secs_f64(1.0));
        assert_eq!(monitor.check_fail_status(), 0);
    }

    #[test]
    fn continuous_pass_requires_duration() {
        let params = EkfParams::default();
        let mut monitor = GpsQualityMonitor::default();

        // Fail at t=1, then pass at t=2: the window restarts.
        let mut bad = good_msg(1.0);
        bad.n_sats = 2;
        monitor.update(&bad, &params, true, Timestamp::from_secs_f64(1.0));
        monitor.update(&good_msg(2.0), &params, true, Timestamp::from_secs_f64(2.0));

        assert!(!monitor.passed_continuously(Timestamp::from_secs_f64(5.0), 10_000_000));
        assert!(monitor.passed_continuously(Timestamp::from_secs_f64(12.0), 10_000_000));
    }

    #[test]
    fn stationary_drift_is_measured() {
        let params = EkfParams::default();
        let mut monitor = GpsQualityMonitor::default();

        // A receiver walking north at ~1.1 m/s while "stationary".
        for k in 0..20 {
            let mut msg = good_msg(1.0 + f64::from(k));
            msg.lat += f64::from(k) * 1e-5;
            monitor.update(
                &msg,
                &params,
                true,
                Timestamp::from_secs_f64(1.0 + f64::from(k)),
            );
        }
        assert!(
            monitor.check_fail_status() & gps_check_fail::HDRIFT != 0,
            "drift rate {:?}",
            monitor.horiz_drift_rate
        );
    }

    #[test]
    fn drift_metrics_returned_once() {
        let params = EkfParams::default();
        let mut monitor = GpsQualityMonitor::default();
        monitor.update(&good_msg(1.0), &params, true, Timestamp::from_secs_f64(1.0));
        monitor.update(&good_msg(2.0), &params, true, Timestamp::from_secs_f64(2.0));

        assert!(monitor.take_drift_metrics().is_some());
        assert!(monitor.take_drift_metrics().is_none());
    }
}
