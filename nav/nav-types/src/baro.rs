//! Barometric altitude sample type.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A barometric altitude measurement.
///
/// The altitude is relative to the pressure reference the barometer driver
/// chose at power-up; the estimator tracks its own offset to the NED origin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BaroSample {
    /// Timestamp of the measurement.
    pub time_us: Timestamp,

    /// Barometric altitude, positive up (m).
    pub hgt: f64,
}

impl BaroSample {
    /// Creates a new barometric sample.
    #[must_use]
    pub const fn new(time_us: Timestamp, hgt: f64) -> Self {
        Self { time_us, hgt }
    }
}
