//! Height reference selection and fallback.
//!
//! One of {baro, GNSS, range finder, external vision} is the active height
//! reference. A timeout on the active source marks it faulty and falls back
//! through a fixed cascade, resetting the height state onto the replacement
//! so the vertical channel never free-runs.

use nav_types::Timestamp;

use crate::{Ekf, HeightSource};

/// Tolerated variation of a "stuck" range reading (m).
const RNG_STUCK_THRESHOLD: f64 = 0.1;

/// Seconds of unchanged readings before the range finder counts as stuck.
const RNG_STUCK_TIMEOUT_S: f64 = 10.0;

/// Per-source bookkeeping for the height reference.
#[derive(Debug, Clone)]
pub(crate) struct HeightControl {
    /// Barometer reading mapped to the height datum (m).
    pub(crate) baro_hgt_offset: f64,
    /// Offset applied to a replacement source to keep height continuous (m).
    pub(crate) hgt_sensor_offset: f64,
    /// Vertical position last seen on ground (m).
    pub(crate) last_on_ground_pos_d: f64,
    /// Last time a bad vertical accelerometer signature was seen.
    pub(crate) time_bad_vert_accel: Timestamp,
    /// Range-aid is currently substituting for the primary source.
    pub(crate) range_aid_selected: bool,

    // Range health tracking.
    stuck_min: f64,
    stuck_max: f64,
    stuck_since: Timestamp,
    last_range_arrival: Timestamp,
    range_interval_filt: f64,
}

impl Default for HeightControl {
    fn default() -> Self {
        Self {
            baro_hgt_offset: 0.0,
            hgt_sensor_offset: 0.0,
            last_on_ground_pos_d: 0.0,
            time_bad_vert_accel: Timestamp::zero(),
            range_aid_selected: false,
            stuck_min: f64::MAX,
            stuck_max: f64::MIN,
            stuck_since: Timestamp::zero(),
            last_range_arrival: Timestamp::zero(),
            range_interval_filt: 0.5,
        }
    }
}

impl HeightControl {
    /// Tracks range sample arrival intervals for the continuity check.
    pub(crate) fn note_range_arrival(&mut self, time: Timestamp) {
        if !self.last_range_arrival.is_zero() {
            let dt = time.since(self.last_range_arrival).as_secs_f64();
            self.range_interval_filt = 0.9 * self.range_interval_filt + 0.1 * dt;
        }
        self.last_range_arrival = time;
    }

    /// Returns `true` while range data arrives faster than ~2 Hz.
    pub(crate) fn range_data_continuous(&self) -> bool {
        self.range_interval_filt < 0.5
    }

    /// Updates the stuck-sensor window with a new reading. Returns `true`
    /// when the output has been frozen for too long.
    pub(crate) fn update_range_stuck(&mut self, rng: f64, time: Timestamp) -> bool {
        self.stuck_min = self.stuck_min.min(rng);
        self.stuck_max = self.stuck_max.max(rng);

        if self.stuck_max - self.stuck_min > RNG_STUCK_THRESHOLD {
            // Healthy variation: restart the window.
            self.stuck_min = rng;
            self.stuck_max = rng;
            self.stuck_since = time;
            return false;
        }
        if self.stuck_since.is_zero() {
            self.stuck_since = time;
            return false;
        }
        time.since(self.stuck_since).as_secs_f64() > RNG_STUCK_TIMEOUT_S
    }
}

impl Ekf {
    /// Fallback cascade after the active height source stops fusing.
    pub(crate) fn control_height_sensor_timeouts(&mut self) {
        let elapsed = self.time_delayed.since(self.time_last_hgt_fuse).as_micros();
        if elapsed <= self.params.hgt_fuse_timeout_us {
            return;
        }

        // Mark the active source faulty, then walk the cascade.
        if self.control.baro_hgt {
            self.faults.bad_baro_hgt = true;
        } else if self.control.gps_hgt {
            self.faults.bad_gps_hgt = true;
        } else if self.control.rng_hgt {
            self.faults.bad_rng_hgt = true;
        }

        let timeout = self.params.hgt_fuse_timeout_us;
        let baro_fresh = self
            .time_delayed
            .since(self.baro_buffer.newest_time())
            .as_micros()
            < timeout;
        let gps_fresh = self
            .time_delayed
            .since(self.gps_buffer.newest_time())
            .as_micros()
            < timeout
            && self.origin.is_valid();
        let range_fresh = self
            .time_delayed
            .since(self.range_buffer.newest_time())
            .as_micros()
            < timeout;
        let ev_fresh = self
            .time_delayed
            .since(self.ev_buffer.newest_time())
            .as_micros()
            < timeout;

        let next = if baro_fresh && !self.faults.bad_baro_hgt {
            Some(HeightSource::Baro)
        } else if gps_fresh && !self.faults.bad_gps_hgt {
            Some(HeightSource::Gps)
        } else if range_fresh && !self.faults.bad_rng_hgt {
            Some(HeightSource::Range)
        } else if ev_fresh {
            Some(HeightSource::Vision)
        } else {
            None
        };

        let Some(next) = next else {
            // Nothing fresh to fall back on; try again next tick.
            return;
        };

        tracing::warn!(?next, "height fusion timeout, switching reference");
        self.select_height_source(next);

        // Reset the height state onto the replacement source.
        let variance = match next {
            HeightSource::Baro => {
                if let Some(baro) = self.baro_buffer.newest().copied() {
                    self.height_control.baro_hgt_offset = baro.hgt + self.state.pos.z;
                }
                self.params.baro_noise.powi(2)
            }
            HeightSource::Gps => {
                if let Some(gps) = self.gps_buffer.newest().copied() {
                    let new_pos_d = -(gps.alt - self.origin.alt_ref);
                    let var = gps.epv.max(self.params.baro_noise).powi(2);
                    self.reset_height_to(new_pos_d, var);
                    return;
                }
                self.params.baro_noise.powi(2)
            }
            HeightSource::Range => {
                if let Some(range) = self.range_buffer.newest().copied() {
                    let r22 = self.r_to_earth[(2, 2)].max(0.7);
                    let new_pos_d = self.terrain.vpos() - range.rng * r22;
                    self.reset_height_to(new_pos_d, self.params.range_noise.powi(2));
                    return;
                }
                self.params.range_noise.powi(2)
            }
            HeightSource::Vision => {
                if let Some(ev) = self.ev_buffer.newest().copied() {
                    let (pos_ned, _) = self.ev_to_ned(&ev);
                    self.reset_height_to(pos_ned.z, ev.pos_err.powi(2).max(0.01));
                    return;
                }
                self.params.baro_noise.powi(2)
            }
        };

        if let Some(baro) = self.baro_buffer.newest().copied() {
            let new_pos_d = -(baro.hgt - self.height_control.baro_hgt_offset);
            self.reset_height_to(new_pos_d, variance);
        }
    }

    /// Switches the active height reference flags.
    pub(crate) fn select_height_source(&mut self, source: HeightSource) {
        self.control.baro_hgt = matches!(source, HeightSource::Baro);
        self.control.gps_hgt = matches!(source, HeightSource::Gps);
        self.control.rng_hgt = matches!(source, HeightSource::Range);
        self.control.ev_hgt = matches!(source, HeightSource::Vision);
    }

    /// Stages the height observation for this tick from the active source.
    pub(crate) fn control_height_fusion(&mut self) {
        self.check_range_health();
        self.control_range_aid();

        if self.control.baro_hgt {
            if let Some(baro) = self.baro_sample_delayed {
                if !self.faults.bad_baro_hgt {
                    self.fuse_height = true;
                    self.vel_pos_obs[5] = -(baro.hgt - self.height_control.baro_hgt_offset);
                    self.hgt_obs_var = self.params.baro_noise.powi(2);
                    self.hgt_innov_gate = self.params.hgt_innov_gate;
                }
            }
        } else if self.control.gps_hgt {
            if let Some(gps) = self.gps_sample_delayed {
                if self.origin.is_valid() {
                    self.fuse_height = true;
                    self.vel_pos_obs[5] = -(gps.alt - self.origin.alt_ref);
                    self.hgt_obs_var = gps.epv.max(self.params.gps_pos_noise).powi(2);
                    self.hgt_innov_gate = self.params.hgt_innov_gate;
                }
            }
            // Track the baro offset so a later fallback is seamless.
            if let Some(baro) = self.baro_sample_delayed {
                let implied_offset = baro.hgt + self.state.pos.z;
                self.height_control.baro_hgt_offset +=
                    0.01 * (implied_offset - self.height_control.baro_hgt_offset);
            }
        } else if self.control.rng_hgt {
            if let Some(range) = self.range_sample_delayed {
                if range.is_usable() && !self.faults.rng_stuck {
                    let r22 = self.r_to_earth[(2, 2)];
                    if r22 > 0.7 {
                        self.fuse_height = true;
                        self.vel_pos_obs[5] = self.height_control.hgt_sensor_offset
                            - range.rng * r22;
                        self.hgt_obs_var = self.params.range_noise.powi(2);
                        self.hgt_innov_gate = self.params.hgt_innov_gate;
                    }
                }
            }
        } else if self.control.ev_hgt {
            if let Some(ev) = self.ev_sample_delayed {
                let (pos_ned, _) = self.ev_to_ned(&ev);
                self.fuse_height = true;
                self.vel_pos_obs[5] = pos_ned.z;
                self.hgt_obs_var = ev.pos_err.powi(2).max(self.params.ev_pos_noise_floor.powi(2));
                self.hgt_innov_gate = self.params.hgt_innov_gate;
            }
        }
    }

    /// Opportunistically substitutes the range finder for the primary
    /// height source during low, slow flight over measured terrain.
    fn control_range_aid(&mut self) {
        if !self.params.range_aid || !self.control.in_air {
            if self.height_control.range_aid_selected {
                self.height_control.range_aid_selected = false;
                self.select_height_source(self.params.height_source);
            }
            return;
        }

        let hagl = self.height_above_ground();
        let horiz_speed = self.state.vel.xy().norm();
        let conditions_met = hagl < self.params.max_hagl_for_range_aid
            && horiz_speed < self.params.max_vel_for_range_aid
            && self.terrain.is_fresh(self.time_delayed)
            && self.innovations.hagl_test_ratio < self.params.range_aid_innov_gate
            && self.height_control.range_data_continuous()
            && !self.faults.rng_stuck;

        if conditions_met && !self.height_control.range_aid_selected {
            self.height_control.range_aid_selected = true;
            // Keep the reported height continuous across the switch.
            if let Some(range) = self.range_buffer.newest().copied() {
                let r22 = self.r_to_earth[(2, 2)].max(0.7);
                self.height_control.hgt_sensor_offset =
                    self.state.pos.z + range.rng * r22;
            }
            self.select_height_source(HeightSource::Range);
            tracing::debug!("range-aid height reference selected");
        } else if !conditions_met && self.height_control.range_aid_selected {
            self.height_control.range_aid_selected = false;
            self.select_height_source(self.params.height_source);
            tracing::debug!("range-aid height reference released");
        }
    }

    /// Range finder continuity and stuck-output checks.
    fn check_range_health(&mut self) {
        self.faults.rng_not_continuous = !self.height_control.range_data_continuous();
        if let Some(range) = self.range_sample_delayed {
            self.faults.rng_stuck = self
                .height_control
                .update_range_stuck(range.rng, range.time_us);
        }
    }
}
