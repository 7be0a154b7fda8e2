//! Polling system error types.

use thiserror::Error;

/// Errors surfaced when constructing a polling system.
///
/// Runtime protocol violations (double-start of the run loop, a stop
/// signal before any production, a double park) are programmer errors
/// and panic instead of returning a variant; see the `# Panics` sections
/// on the operations concerned.
#[derive(Debug, Error)]
pub enum PollingError {
    /// The watermark pair cannot express hysteresis.
    #[error("invalid watermarks: low {low} must be at least 1 and less than high {high}")]
    InvalidWatermarks {
        /// The configured low watermark.
        low: usize,
        /// The configured high watermark.
        high: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_watermarks_display() {
        let err = PollingError::InvalidWatermarks { low: 10, high: 5 };
        assert_eq!(
            err.to_string(),
            "invalid watermarks: low 10 must be at least 1 and less than high 5"
        );
    }
}
