//! External vision alignment and fusion support.
//!
//! A vision system navigates in its own arbitrarily-rotated frame. The
//! filter estimates the misalignment between that frame and NED as a slowly
//! filtered rotation vector, and rotates vision observations through it
//! before handing them to the velocity/position and heading kernels.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use nav_types::{Timestamp, VisionSample};

use crate::Ekf;

/// Time constant of the misalignment filter (s).
const EV_ROT_TC: f64 = 10.0;

/// Filtered rotation from the vision navigation frame to NED.
#[derive(Debug, Clone)]
pub(crate) struct EvAlignment {
    rot_vec_filt: Vector3<f64>,
    rot_mat: Matrix3<f64>,
    last_time: Timestamp,
    aligned: bool,
}

impl Default for EvAlignment {
    fn default() -> Self {
        Self {
            rot_vec_filt: Vector3::zeros(),
            rot_mat: Matrix3::identity(),
            last_time: Timestamp::zero(),
            aligned: false,
        }
    }
}

impl EvAlignment {
    /// Returns `true` once an initial alignment has been computed.
    pub(crate) const fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Rotation matrix from the vision frame into NED.
    pub(crate) const fn rot_mat(&self) -> &Matrix3<f64> {
        &self.rot_mat
    }

    /// Alignment quaternion from the EKF navigation frame to the vision
    /// frame, for telemetry.
    pub(crate) fn quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_scaled_axis(self.rot_vec_filt).inverse()
    }

    /// Hard reset of the alignment from simultaneous attitude estimates.
    pub(crate) fn reset(
        &mut self,
        ekf_quat: &UnitQuaternion<f64>,
        ev_quat: &UnitQuaternion<f64>,
        time: Timestamp,
    ) {
        let misalignment = *ekf_quat * ev_quat.inverse();
        self.rot_vec_filt = misalignment.scaled_axis();
        self.rot_mat = misalignment.to_rotation_matrix().into_inner();
        self.last_time = time;
        self.aligned = true;
    }

    /// Low-pass update of the alignment from the current attitude pair.
    pub(crate) fn update(
        &mut self,
        ekf_quat: &UnitQuaternion<f64>,
        ev_quat: &UnitQuaternion<f64>,
        time: Timestamp,
    ) {
        if !self.aligned {
            self.reset(ekf_quat, ev_quat, time);
            return;
        }
        let dt = time.since(self.last_time).as_secs_f64().min(1.0);
        self.last_time = time;
        let alpha = (dt / EV_ROT_TC).clamp(0.0, 1.0);

        let misalignment = (*ekf_quat * ev_quat.inverse()).scaled_axis();
        self.rot_vec_filt += alpha * (misalignment - self.rot_vec_filt);
        self.rot_mat = UnitQuaternion::from_scaled_axis(self.rot_vec_filt)
            .to_rotation_matrix()
            .into_inner();
    }
}

impl Ekf {
    /// Quaternion rotating the EKF navigation frame into the external
    /// vision frame, for telemetry.
    #[must_use]
    pub fn ekf_to_ev_quaternion(&self) -> UnitQuaternion<f64> {
        self.ev_align.quaternion()
    }

    /// Rotates a vision sample's position and velocity into NED using the
    /// filtered alignment.
    pub(crate) fn ev_to_ned(&self, ev: &VisionSample) -> (Vector3<f64>, Vector3<f64>) {
        let rot = self.ev_align.rot_mat();
        (rot * ev.pos, rot * ev.vel)
    }
}
