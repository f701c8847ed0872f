//! Time types for sensor samples.
//!
//! Provides microsecond-precision timing for measurement alignment.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Microsecond-precision monotonic timestamp.
///
/// Used for all sensor samples to enable alignment at the delayed fusion
/// horizon. The epoch is arbitrary (typically boot time); only differences
/// are meaningful.
///
/// # Example
///
/// ```
/// use nav_types::Timestamp;
///
/// let ts = Timestamp::from_secs_f64(1.5);
/// assert_eq!(ts.as_micros(), 1_500_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Timestamp {
    /// Microseconds since an arbitrary monotonic epoch.
    micros: u64,
}

impl Timestamp {
    /// Creates a timestamp from microseconds.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    /// Creates a timestamp from seconds (floating point).
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self {
            micros: (secs * 1e6).max(0.0) as u64,
        }
    }

    /// Returns the timestamp as microseconds.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.micros
    }

    /// Returns the timestamp as seconds (floating point).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.micros as f64 / 1e6
    }

    /// Returns the zero timestamp.
    #[must_use]
    pub const fn zero() -> Self {
        Self { micros: 0 }
    }

    /// Checks if this is the zero timestamp.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.micros == 0
    }

    /// Adds a duration, saturating at the numeric range.
    #[must_use]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Self {
            micros: self.micros.saturating_add(duration.as_micros()),
        }
    }

    /// Subtracts a duration, saturating at zero.
    #[must_use]
    pub const fn saturating_sub(self, duration: Duration) -> Self {
        Self {
            micros: self.micros.saturating_sub(duration.as_micros()),
        }
    }

    /// Returns the duration elapsed since `earlier`, or zero if `earlier`
    /// is in the future.
    #[must_use]
    pub const fn since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }
}

/// Microsecond-precision duration between two timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Duration {
    micros: u64,
}

impl Duration {
    /// Creates a duration from microseconds.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Creates a duration from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    /// Creates a duration from seconds (floating point).
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self {
            micros: (secs * 1e6).max(0.0) as u64,
        }
    }

    /// Returns the duration as microseconds.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.micros
    }

    /// Returns the duration as seconds (floating point).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.micros as f64 / 1e6
    }

    /// Returns the zero duration.
    #[must_use]
    pub const fn zero() -> Self {
        Self { micros: 0 }
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}

impl core::ops::Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        self.saturating_sub(rhs)
    }
}

impl core::ops::Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.since(rhs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_micros_roundtrip() {
        let ts = Timestamp::from_micros(1_234_567);
        assert_eq!(ts.as_micros(), 1_234_567);
        assert!((ts.as_secs_f64() - 1.234_567).abs() < 1e-9);
    }

    #[test]
    fn timestamp_from_secs() {
        let ts = Timestamp::from_secs_f64(0.5);
        assert_eq!(ts.as_micros(), 500_000);
    }

    #[test]
    fn timestamp_negative_secs_clamps_to_zero() {
        let ts = Timestamp::from_secs_f64(-1.0);
        assert!(ts.is_zero());
    }

    #[test]
    fn timestamp_since() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b.since(a).as_micros(), 150_000);
        // Saturates rather than wrapping
        assert_eq!(a.since(b).as_micros(), 0);
    }

    #[test]
    fn timestamp_arithmetic() {
        let ts = Timestamp::from_millis(10) + Duration::from_millis(5);
        assert_eq!(ts.as_micros(), 15_000);

        let back = ts - Duration::from_millis(20);
        assert!(back.is_zero());
    }

    #[test]
    fn duration_ordering() {
        assert!(Duration::from_millis(1) < Duration::from_millis(2));
        assert_eq!(Duration::zero().as_micros(), 0);
    }
}
