//! Fusion-mode control.
//!
//! One coupled state machine per measurement class decides each tick whether
//! its kernel initializes, fuses, stays inhibited, or resets states. The
//! call order is fixed: attitude-affecting decisions (magnetometer, yaw
//! resets) run before the height timeout handling, and the velocity/position
//! kernel runs last so every controller has staged its observations.

pub(crate) mod gps;
pub(crate) mod height;
pub(crate) mod mag;

use nalgebra::Vector3;
use nav_types::Duration;

use crate::Ekf;

/// Fake position observation period while unaided at rest (us).
const FAKE_POS_INTERVAL_US: u64 = 200_000;

impl Ekf {
    /// Runs every per-class controller for this tick, then the staged
    /// velocity/position fusion.
    pub(crate) fn control_fusion_modes(&mut self) {
        // Clear the staging area; controllers re-arm what they need.
        self.fuse_hor_vel = false;
        self.fuse_vert_vel = false;
        self.fuse_pos = false;
        self.fuse_height = false;

        self.check_tilt_alignment();

        self.control_external_vision_fusion();
        self.control_optical_flow_fusion();
        self.control_gps_fusion();
        self.control_mag_fusion();
        self.control_height_sensor_timeouts();
        self.control_height_fusion();
        self.control_air_data_fusion();
        self.control_beta_fusion();
        self.control_drag_fusion();
        self.control_vel_pos_fusion();

        self.update_deadreckoning_status();
    }

    /// Tilt alignment completes once the attitude error variance has
    /// collapsed enough for aiding to start.
    fn check_tilt_alignment(&mut self) {
        if self.control.tilt_align {
            return;
        }
        let angle_err_var = self.cov.rot_vec_variances(&self.state.quat);
        if angle_err_var.x + angle_err_var.y < 0.002 {
            self.control.tilt_align = true;
        }
    }

    /// External vision aiding: alignment filtering, position/velocity
    /// staging, yaw fusion.
    fn control_external_vision_fusion(&mut self) {
        let Some(ev) = self.ev_sample_delayed else {
            // Vision dropout: stop aiding after the reset timeout.
            if self.control.ev_pos
                && self
                    .time_delayed
                    .since(self.ev_buffer.newest_time())
                    .as_micros()
                    > self.params.reset_timeout_us
            {
                self.control.ev_pos = false;
                self.control.ev_yaw = false;
                self.last_known_pos_ne = self.state.pos.xy();
                tracing::warn!("external vision timeout, aiding stopped");
            }
            return;
        };

        if !self.control.tilt_align {
            return;
        }

        // Without a magnetometer the vision yaw is the only heading
        // reference; align to it before using vision positions.
        if !self.control.yaw_align {
            if self.params.mag_fusion_mode == crate::MagFuseMode::None {
                self.ev_align
                    .reset(&self.state.quat, &ev.quat, self.time_delayed);
                self.control.ev_yaw = true;
                self.control.yaw_align = true;
            } else {
                return;
            }
        }

        self.ev_align
            .update(&self.state.quat, &ev.quat, self.time_delayed);

        let (pos_ned, vel_ned) = self.ev_to_ned(&ev);

        if !self.control.ev_pos {
            self.control.ev_pos = true;
            let var = ev.pos_err.powi(2).max(self.params.ev_pos_noise_floor.powi(2));
            self.reset_pos_ne_to(pos_ned.xy(), var);
            tracing::info!("starting external vision aiding");
        }

        self.fuse_pos = true;
        self.vel_pos_obs[3] = pos_ned.x;
        self.vel_pos_obs[4] = pos_ned.y;
        self.pos_obs_var_ne = ev.pos_err.powi(2).max(self.params.ev_pos_noise_floor.powi(2));
        self.pos_innov_gate_ne = self.params.ev_innov_gate;
        self.control.synthetic_pos = false;

        // Vision velocity is optional; a zero-variance report means the
        // pipeline does not produce one.
        if ev.vel_err > 0.0 && !self.control.gps {
            self.fuse_hor_vel = true;
            self.fuse_vert_vel = true;
            self.vel_pos_obs[0] = vel_ned.x;
            self.vel_pos_obs[1] = vel_ned.y;
            self.vel_pos_obs[2] = vel_ned.z;
            let var = ev.vel_err.powi(2);
            self.vel_obs_var = Vector3::new(var, var, var);
        }

        if self.control.ev_yaw {
            let obs_var = ev.ang_err.powi(2).max(self.params.ev_ang_noise_floor.powi(2));
            // The vision yaw arrives in the vision frame; rotate through
            // the alignment before comparing.
            let aligned_quat = nalgebra::UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(
                    self.ev_align.rot_mat() * ev.quat.to_rotation_matrix().into_inner(),
                ),
            );
            let obs_yaw = aligned_quat.euler_angles().2;
            self.fuse_heading(obs_yaw, obs_var);
        }
    }

    /// Optical flow aiding control.
    fn control_optical_flow_fusion(&mut self) {
        // Body rotation accumulates every tick so the compensator can cover
        // whatever interval the next flow sample reports.
        let imu = self.imu_sample_delayed;
        self.flow_comp.accumulate(
            imu.delta_ang - self.state.delta_ang_bias,
            imu.delta_ang_dt,
        );

        let Some(flow) = self.flow_sample_delayed else {
            if self.control.opt_flow
                && self
                    .time_delayed
                    .since(self.time_last_of_fuse)
                    .as_micros()
                    > self.params.reset_timeout_us
            {
                self.control.opt_flow = false;
                self.last_known_pos_ne = self.state.pos.xy();
            }
            return;
        };

        if !self.control.tilt_align || !self.control.yaw_align {
            return;
        }

        // On ground the flow sees its own airframe and dust; require
        // takeoff or an explicit motion-free state.
        if !self.control.in_air && !self.vehicle_at_rest {
            return;
        }

        if !self.control.opt_flow {
            self.control.opt_flow = true;
            tracing::info!("starting optical flow aiding");
        }

        self.fuse_opt_flow(&flow);
    }

    /// Airspeed fusion control, including wind state activation.
    fn control_air_data_fusion(&mut self) {
        let Some(airspeed) = self.airspeed_sample_delayed else {
            if self.control.fuse_aspd
                && self
                    .time_delayed
                    .since(self.time_last_arsp_fuse)
                    .as_micros()
                    > 10_000_000
            {
                self.control.fuse_aspd = false;
            }
            return;
        };

        if !self.control.in_air {
            return;
        }

        if !self.control.wind {
            self.control.wind = true;
            self.reset_wind_states(Some(airspeed.true_airspeed));
            tracing::info!("wind estimation started from airspeed");
        }
        self.control.fuse_aspd = true;
        self.fuse_airspeed(airspeed.true_airspeed, airspeed.eas2tas);
    }

    /// Synthetic sideslip fusion for fixed-wing airframes.
    fn control_beta_fusion(&mut self) {
        const BETA_INTERVAL_US: u64 = 300_000;

        if !self.control.fixed_wing || !self.control.in_air {
            self.control.fuse_beta = false;
            return;
        }
        if self
            .time_delayed
            .since(self.time_last_beta_fuse)
            .as_micros()
            < BETA_INTERVAL_US
        {
            return;
        }

        if !self.control.wind {
            self.control.wind = true;
            self.reset_wind_states(None);
        }
        self.control.fuse_beta = true;
        self.fuse_sideslip();
    }

    /// Multirotor drag fusion for wind estimation without an airspeed
    /// sensor.
    fn control_drag_fusion(&mut self) {
        if self.control.fixed_wing || !self.control.in_air || self.control.fuse_aspd {
            return;
        }
        if self.params.bcoef_x <= 0.0 || self.params.bcoef_y <= 0.0 {
            return;
        }
        if !self.control.wind {
            self.control.wind = true;
            self.reset_wind_states(None);
        }
        self.fuse_drag();
    }

    /// Final velocity/position staging: synthetic observations while
    /// unaided, then the shared kernel.
    fn control_vel_pos_fusion(&mut self) {
        let horiz_aided = self.control.gps || self.control.ev_pos || self.control.opt_flow;

        if !horiz_aided {
            // Remember where aiding stopped so the synthetic position holds
            // the map in place rather than recentering on zero.
            if !self.control.synthetic_pos {
                self.last_known_pos_ne = self.state.pos.xy();
                self.control.synthetic_pos = true;
            }

            let due = self
                .time_delayed
                .since(self.time_last_fake_pos)
                .as_micros()
                >= FAKE_POS_INTERVAL_US;
            if due {
                self.time_last_fake_pos = self.time_delayed;
                self.fuse_pos = true;
                self.vel_pos_obs[3] = self.last_known_pos_ne.x;
                self.vel_pos_obs[4] = self.last_known_pos_ne.y;
                self.pos_obs_var_ne = if self.vehicle_at_rest {
                    0.25
                } else {
                    self.params.pos_noaid_noise.powi(2)
                };
                self.pos_innov_gate_ne = 3.0;

                // At rest the vehicle is also not moving: a zero-velocity
                // observation keeps tilt drift bounded.
                if self.vehicle_at_rest {
                    self.fuse_hor_vel = true;
                    self.fuse_vert_vel = true;
                    self.vel_pos_obs[0] = 0.0;
                    self.vel_pos_obs[1] = 0.0;
                    self.vel_pos_obs[2] = 0.0;
                    self.vel_obs_var = Vector3::new(0.25, 0.25, 0.25);
                }
            }
        } else {
            self.control.synthetic_pos = false;
        }

        if self.fuse_hor_vel || self.fuse_vert_vel || self.fuse_pos || self.fuse_height {
            self.fuse_vel_pos_height();
        }
    }

    /// Dead-reckoning bookkeeping and the global-position validity horizon.
    pub(crate) fn update_deadreckoning_status(&mut self) {
        let aiding_fresh = [
            self.time_last_pos_fuse,
            self.time_last_vel_fuse,
            self.time_last_of_fuse,
        ]
        .iter()
        .any(|t| {
            !t.is_zero()
                && self.time_delayed.since(*t) < Duration::from_micros(1_000_000)
        });

        let aided = (self.control.gps || self.control.ev_pos || self.control.opt_flow)
            && aiding_fresh
            && !self.control.synthetic_pos;

        if aided {
            self.time_ins_deadreckon_start = None;
            self.control.inertial_dead_reckoning = false;
        } else {
            let start = *self
                .time_ins_deadreckon_start
                .get_or_insert(self.time_delayed);
            let elapsed = self.time_delayed.since(start).as_micros();
            self.control.inertial_dead_reckoning = elapsed > self.params.valid_timeout_us;
        }
    }
}
