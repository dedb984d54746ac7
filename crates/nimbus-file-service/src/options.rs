//! Tunables for the file service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default gap below which neighbouring ranges are merged.
pub const DEFAULT_MINIMUM_RANGE_DISTANCE: u64 = 256 * 1024;

/// Default minimum length of a download.
pub const DEFAULT_MINIMUM_RANGE_SIZE: u64 = 256 * 1024;

/// Default number of retries for a failed range download.
pub const DEFAULT_MAXIMUM_RANGE_RETRIES: u32 = 3;

/// Default delay between range download retries.
pub const DEFAULT_RANGE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default time a file must go unaccessed before it may be reclaimed.
pub const DEFAULT_RECLAIM_AGE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default interval between periodic reclaims.
pub const DEFAULT_RECLAIM_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Default delay before the first periodic reclaim.
pub const DEFAULT_RECLAIM_DELAY: Duration = Duration::from_secs(15 * 60);

/// Options controlling downloads and storage reclamation.
///
/// A `reclaim_size_threshold` of zero disables reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileServiceOptions {
    /// Ranges separated by fewer bytes than this are merged.
    pub minimum_range_distance: u64,
    /// Downloads are extended to at least this many bytes.
    pub minimum_range_size: u64,
    /// How many times a transiently failed download is retried.
    pub maximum_range_retries: u32,
    /// Delay before retrying a failed download.
    #[serde(with = "humantime_serde")]
    pub range_retry_backoff: Duration,
    /// Files accessed more recently than this are never reclaimed.
    #[serde(with = "humantime_serde")]
    pub reclaim_age_threshold: Duration,
    /// Reclaim until storage use is at or below this many bytes.
    pub reclaim_size_threshold: u64,
    /// Interval between periodic reclaims.
    #[serde(with = "humantime_serde")]
    pub reclaim_period: Duration,
    /// Delay before the first periodic reclaim.
    #[serde(with = "humantime_serde")]
    pub reclaim_delay: Duration,
}

impl Default for FileServiceOptions {
    fn default() -> Self {
        Self {
            minimum_range_distance: DEFAULT_MINIMUM_RANGE_DISTANCE,
            minimum_range_size: DEFAULT_MINIMUM_RANGE_SIZE,
            maximum_range_retries: DEFAULT_MAXIMUM_RANGE_RETRIES,
            range_retry_backoff: DEFAULT_RANGE_RETRY_BACKOFF,
            reclaim_age_threshold: DEFAULT_RECLAIM_AGE_THRESHOLD,
            reclaim_size_threshold: 0,
            reclaim_period: DEFAULT_RECLAIM_PERIOD,
            reclaim_delay: DEFAULT_RECLAIM_DELAY,
        }
    }
}

impl FileServiceOptions {
    #[must_use]
    pub fn with_minimum_range_distance(mut self, distance: u64) -> Self {
        self.minimum_range_distance = distance;
        self
    }

    #[must_use]
    pub fn with_minimum_range_size(mut self, size: u64) -> Self {
        self.minimum_range_size = size;
        self
    }

    #[must_use]
    pub fn with_range_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.maximum_range_retries = retries;
        self.range_retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_reclaim(mut self, size_threshold: u64, age_threshold: Duration) -> Self {
        self.reclaim_size_threshold = size_threshold;
        self.reclaim_age_threshold = age_threshold;
        self
    }

    #[must_use]
    pub fn with_reclaim_schedule(mut self, delay: Duration, period: Duration) -> Self {
        self.reclaim_delay = delay;
        self.reclaim_period = period;
        self
    }

    /// Whether periodic reclamation is enabled.
    pub fn reclaim_enabled(&self) -> bool {
        self.reclaim_size_threshold > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: FileServiceOptions =
            serde_json::from_str(r#"{"maximum_range_retries": 7, "range_retry_backoff": "250ms"}"#)
                .unwrap();
        assert_eq!(options.maximum_range_retries, 7);
        assert_eq!(options.range_retry_backoff, Duration::from_millis(250));
        assert_eq!(options.minimum_range_size, DEFAULT_MINIMUM_RANGE_SIZE);
        assert!(!options.reclaim_enabled());
    }
}
