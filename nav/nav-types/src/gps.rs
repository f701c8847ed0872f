//! GNSS message types.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// GNSS fix quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GpsFixType {
    /// No fix available.
    #[default]
    NoFix,
    /// 2D fix (latitude/longitude only).
    Fix2d,
    /// 3D fix (latitude/longitude/altitude).
    Fix3d,
    /// Differential GPS fix.
    Dgps,
    /// Real-time kinematic float solution.
    RtkFloat,
    /// Real-time kinematic fixed solution (highest accuracy).
    RtkFixed,
}

impl GpsFixType {
    /// Returns `true` if the fix includes altitude.
    #[must_use]
    pub const fn has_altitude(self) -> bool {
        matches!(
            self,
            Self::Fix3d | Self::Dgps | Self::RtkFloat | Self::RtkFixed
        )
    }
}

/// A GNSS receiver report.
///
/// Combines the geodetic position solution, the NED velocity solution and
/// the receiver's own quality metadata. Quality fields feed the estimator's
/// pre-flight checks; they are reported by the receiver, not derived.
///
/// # Example
///
/// ```
/// use nav_types::{GpsFixType, GpsMessage, Timestamp};
/// use nalgebra::Vector3;
///
/// let msg = GpsMessage {
///     time_us: Timestamp::from_secs_f64(1.0),
///     lat: 47.3977, // Zurich
///     lon: 8.5456,
///     alt: 488.0,
///     vel_ned: Vector3::zeros(),
///     fix_type: GpsFixType::Fix3d,
///     eph: 0.8,
///     epv: 1.2,
///     sacc: 0.3,
///     n_sats: 14,
///     pdop: 1.1,
///     yaw: None,
///     yaw_offset: 0.0,
/// };
///
/// assert!(msg.fix_type.has_altitude());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GpsMessage {
    /// Timestamp of the solution.
    pub time_us: Timestamp,

    /// Latitude in degrees, positive North.
    pub lat: f64,

    /// Longitude in degrees, positive East.
    pub lon: f64,

    /// Altitude above WGS-84 ellipsoid (m).
    pub alt: f64,

    /// Velocity in the local NED frame (m/s).
    pub vel_ned: Vector3<f64>,

    /// Fix quality.
    pub fix_type: GpsFixType,

    /// 1-sigma horizontal position accuracy (m).
    pub eph: f64,

    /// 1-sigma vertical position accuracy (m).
    pub epv: f64,

    /// 1-sigma speed accuracy (m/s).
    pub sacc: f64,

    /// Number of satellites used in the solution.
    pub n_sats: u8,

    /// Position dilution of precision.
    pub pdop: f64,

    /// Yaw angle from a dual-antenna receiver (rad), if available.
    pub yaw: Option<f64>,

    /// Heading offset of the antenna baseline from the body X axis (rad).
    pub yaw_offset: f64,
}

impl GpsMessage {
    /// Returns `true` when the receiver reports a usable 3D solution.
    #[must_use]
    pub const fn has_3d_fix(&self) -> bool {
        self.fix_type.has_altitude()
    }
}
