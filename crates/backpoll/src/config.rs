//! Polling system configuration.

use crate::error::PollingError;

/// Watermark configuration for the delivery queue.
///
/// The queue signals pause when its buffer reaches `high_watermark`
/// elements and signals ready again once the consumer drains it below
/// `low_watermark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Buffer level below which production resumes.
    pub low_watermark: usize,
    /// Buffer level at which production pauses.
    pub high_watermark: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            low_watermark: 5,
            high_watermark: 10,
        }
    }
}

impl PollingConfig {
    /// Creates a configuration with the given watermark pair.
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            low_watermark,
            high_watermark,
        }
    }

    /// Validates the watermark pair.
    ///
    /// The low watermark must be at least 1 and strictly below the high
    /// watermark; anything else cannot express hysteresis (and would
    /// allow a pause signal before any produce signal).
    ///
    /// # Errors
    ///
    /// Returns [`PollingError::InvalidWatermarks`] when the pair is
    /// unusable.
    pub fn validate(&self) -> Result<(), PollingError> {
        if self.low_watermark < 1 || self.low_watermark >= self.high_watermark {
            return Err(PollingError::InvalidWatermarks {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        Ok(())
    }
}
