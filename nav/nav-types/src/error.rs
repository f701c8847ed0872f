//! Error types for sample validation.

use thiserror::Error;

use crate::Timestamp;

/// Errors raised when a sample cannot be accepted.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The sample's timestamp is older than the newest buffered sample.
    #[error("timestamp regression: {sample:?} is older than {newest:?}")]
    TimestampRegression {
        /// Timestamp of the rejected sample.
        sample: Timestamp,
        /// Newest timestamp already accepted.
        newest: Timestamp,
    },

    /// A field holds a non-finite value.
    #[error("non-finite value in field {0}")]
    NonFinite(&'static str),

    /// The integration interval is not usable.
    #[error("invalid integration interval: {0} s")]
    InvalidInterval(f64),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SampleError::NonFinite("delta_vel");
        assert!(err.to_string().contains("delta_vel"));

        let err = SampleError::InvalidInterval(-0.1);
        assert!(err.to_string().contains("invalid integration interval"));
    }
}
