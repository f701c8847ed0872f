//! Airspeed sample type.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A true airspeed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AirspeedSample {
    /// Timestamp of the measurement.
    pub time_us: Timestamp,

    /// True airspeed (m/s).
    pub true_airspeed: f64,

    /// Equivalent-to-true airspeed conversion factor at the current density
    /// altitude.
    pub eas2tas: f64,
}

impl AirspeedSample {
    /// Creates a new airspeed sample.
    #[must_use]
    pub const fn new(time_us: Timestamp, true_airspeed: f64, eas2tas: f64) -> Self {
        Self {
            time_us,
            true_airspeed,
            eas2tas,
        }
    }
}
