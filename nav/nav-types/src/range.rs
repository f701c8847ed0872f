//! Range finder sample type.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A range finder measurement along the sensor boresight.
///
/// The sensor is assumed to point along the body Z axis (down) with a small
/// fixed tilt; the estimator projects the slant range onto the vertical using
/// its attitude estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RangeSample {
    /// Timestamp of the measurement.
    pub time_us: Timestamp,

    /// Slant range to the target (m).
    pub rng: f64,

    /// Sensor-reported signal quality, 0 (invalid) to 255 (best).
    pub quality: u8,
}

impl RangeSample {
    /// Creates a new range sample.
    #[must_use]
    pub const fn new(time_us: Timestamp, rng: f64, quality: u8) -> Self {
        Self {
            time_us,
            rng,
            quality,
        }
    }

    /// Returns `true` when the sensor reports usable signal quality.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.quality > 0
    }
}
