//! Local NED origin and map projection.
//!
//! The estimator works in a local North-East-Down frame anchored at a
//! latched WGS-84 origin. The projection here is the azimuthal equidistant
//! approximation used by the host flight stack; full geodesy stays with the
//! host.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use nav_types::Timestamp;

/// Mean Earth radius (m).
const EARTH_RADIUS: f64 = 6_371_000.0;

/// Earth rotation rate (rad/s).
pub const EARTH_RATE: f64 = 7.292_115e-5;

/// An azimuthal equidistant projection anchored at a reference location.
///
/// # Example
///
/// ```
/// use nav_ekf::geo::MapProjection;
///
/// let proj = MapProjection::new(47.0, 8.0);
/// let (n, e) = proj.project(47.0, 8.0);
/// assert!(n.abs() < 1e-9 && e.abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MapProjection {
    lat_ref_rad: f64,
    lon_ref_rad: f64,
    cos_lat_ref: f64,
    sin_lat_ref: f64,
}

impl MapProjection {
    /// Creates a projection anchored at the given latitude/longitude (deg).
    #[must_use]
    pub fn new(lat_deg: f64, lon_deg: f64) -> Self {
        let lat_ref_rad = lat_deg.to_radians();
        Self {
            lat_ref_rad,
            lon_ref_rad: lon_deg.to_radians(),
            cos_lat_ref: lat_ref_rad.cos(),
            sin_lat_ref: lat_ref_rad.sin(),
        }
    }

    /// Reference latitude (deg).
    #[must_use]
    pub fn lat_deg(&self) -> f64 {
        self.lat_ref_rad.to_degrees()
    }

    /// Reference longitude (deg).
    #[must_use]
    pub fn lon_deg(&self) -> f64 {
        self.lon_ref_rad.to_degrees()
    }

    /// Reference latitude (rad).
    #[must_use]
    pub const fn lat_rad(&self) -> f64 {
        self.lat_ref_rad
    }

    /// Projects a WGS-84 location (deg) onto local (north, east) meters.
    #[must_use]
    pub fn project(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        let lat = lat_deg.to_radians();
        let lon = lon_deg.to_radians();

        let sin_lat = lat.sin();
        let cos_lat = lat.cos();
        let cos_dlon = (lon - self.lon_ref_rad).cos();

        let arg = (self.sin_lat_ref * sin_lat + self.cos_lat_ref * cos_lat * cos_dlon)
            .clamp(-1.0, 1.0);
        let c = arg.acos();
        let k = if c.abs() > 1e-9 { c / c.sin() } else { 1.0 };

        let north =
            k * (self.cos_lat_ref * sin_lat - self.sin_lat_ref * cos_lat * cos_dlon) * EARTH_RADIUS;
        let east = k * cos_lat * (lon - self.lon_ref_rad).sin() * EARTH_RADIUS;
        (north, east)
    }

    /// Inverse projection from local (north, east) meters back to WGS-84
    /// degrees.
    #[must_use]
    pub fn reproject(&self, north: f64, east: f64) -> (f64, f64) {
        let x_rad = north / EARTH_RADIUS;
        let y_rad = east / EARTH_RADIUS;
        let c = x_rad.hypot(y_rad);

        if c < 1e-12 {
            return (self.lat_deg(), self.lon_deg());
        }

        let sin_c = c.sin();
        let cos_c = c.cos();
        let lat = (cos_c * self.sin_lat_ref + x_rad * sin_c * self.cos_lat_ref / c).asin();
        let lon = self.lon_ref_rad
            + (y_rad * sin_c).atan2(c * self.cos_lat_ref * cos_c - x_rad * self.sin_lat_ref * sin_c);
        (lat.to_degrees(), lon.to_degrees())
    }
}

/// The latched NED origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Origin {
    /// Time the origin was last set.
    pub time_set: Timestamp,

    /// Projection anchored at the origin, if set.
    pub projection: Option<MapProjection>,

    /// WGS-84 altitude of the origin (m).
    pub alt_ref: f64,
}

impl Origin {
    /// Returns `true` when the origin has been latched.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.projection.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn project_reference_is_zero() {
        let proj = MapProjection::new(47.3977, 8.5456);
        let (n, e) = proj.project(47.3977, 8.5456);
        assert_relative_eq!(n, 0.0, epsilon = 1e-6);
        assert_relative_eq!(e, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn project_one_degree_north() {
        let proj = MapProjection::new(0.0, 0.0);
        let (n, e) = proj.project(1.0, 0.0);
        // One degree of latitude is ~111.2 km.
        assert_relative_eq!(n, 111_194.9, epsilon = 10.0);
        assert_relative_eq!(e, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn project_roundtrip() {
        let proj = MapProjection::new(47.3977, 8.5456);
        let (n, e) = proj.project(47.4100, 8.5600);
        let (lat, lon) = proj.reproject(n, e);
        assert_relative_eq!(lat, 47.4100, epsilon = 1e-7);
        assert_relative_eq!(lon, 8.5600, epsilon = 1e-7);
    }

    #[test]
    fn origin_validity() {
        let mut origin = Origin::default();
        assert!(!origin.is_valid());
        origin.projection = Some(MapProjection::new(0.0, 0.0));
        assert!(origin.is_valid());
    }
}
