//! Hardware-agnostic navigation sensor sample types.
//!
//! This crate provides the foundational measurement types consumed by the
//! `nav-ekf` estimator:
//!
//! - [`ImuSample`] - Integrated inertial increments (delta angle, delta velocity)
//! - [`GpsMessage`] - GNSS position, velocity and quality metadata
//! - [`MagSample`] - Three-axis magnetometer field measurement
//! - [`BaroSample`] - Barometric altitude
//! - [`RangeSample`] - Range finder distance with quality
//! - [`FlowSample`] - Optical flow integrated angles with gyro snapshot
//! - [`AirspeedSample`] - True airspeed with scale factor
//! - [`VisionSample`] - External vision pose and velocity
//!
//! # Layer 0 Crate
//!
//! This is a Layer 0 crate with no estimator dependencies. It can be used in:
//! - Sensor drivers feeding the estimator
//! - Log replay and analysis tools
//! - Simulation environments generating synthetic streams
//!
//! # Time
//!
//! All samples carry a [`Timestamp`] with microsecond precision. Timestamps
//! are monotonic and externally supplied; the estimator never reads a wall
//! clock.
//!
//! # Example
//!
//! ```
//! use nav_types::{ImuSample, Timestamp};
//! use nalgebra::Vector3;
//!
//! let imu = ImuSample {
//!     time_us: Timestamp::from_micros(8_000),
//!     delta_ang: Vector3::zeros(),
//!     delta_vel: Vector3::new(0.0, 0.0, -9.81 * 0.008),
//!     delta_ang_dt: 0.008,
//!     delta_vel_dt: 0.008,
//! };
//!
//! assert!(imu.delta_vel.z < 0.0);
//! ```

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod airspeed;
mod baro;
mod error;
mod flow;
mod gps;
mod imu;
mod mag;
mod range;
mod time;
mod vision;

pub use airspeed::AirspeedSample;
pub use baro::BaroSample;
pub use error::SampleError;
pub use flow::FlowSample;
pub use gps::{GpsFixType, GpsMessage};
pub use imu::ImuSample;
pub use mag::MagSample;
pub use range::RangeSample;
pub use time::{Duration, Timestamp};
pub use vision::VisionSample;

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        AirspeedSample, BaroSample, Duration, FlowSample, GpsFixType, GpsMessage, ImuSample,
        MagSample, RangeSample, SampleError, Timestamp, VisionSample,
    };
}
