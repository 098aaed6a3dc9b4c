use std::time::Duration;

use serde::Deserialize;

/// Configuration for the tracking registry and its slow-op sweep.
///
/// Durations are carried as milliseconds so the struct deserializes from
/// flat config files; use the accessor methods to get `Duration`s.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Number of lock shards timelines are spread over. Clamped to at least 1.
    pub shard_count: usize,
    /// Age after which an in-flight operation is reported as slow.
    /// Zero disables slow-op reporting.
    pub complaint_time_ms: u64,
    /// Maximum number of slow ops warned about per sweep.
    pub log_threshold: usize,
    /// Factor by which the re-warn interval of a single op grows after each
    /// warning.
    pub warn_backoff_multiplier: u32,
    /// Maximum number of completed ops kept for `dump_historic_ops`.
    pub history_size: usize,
    /// Completed ops older than this are dropped from history.
    pub history_duration_ms: u64,
    /// Interval between background sweeps.
    pub sweep_interval_ms: u64,
}

impl TrackerConfig {
    #[must_use]
    pub fn complaint_time(&self) -> Duration {
        Duration::from_millis(self.complaint_time_ms)
    }

    #[must_use]
    pub fn history_duration(&self) -> Duration {
        Duration::from_millis(self.history_duration_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            shard_count: 32,
            complaint_time_ms: 30_000,
            log_threshold: 5,
            warn_backoff_multiplier: 2,
            history_size: 20,
            history_duration_ms: 600_000,
            sweep_interval_ms: 1_000,
        }
    }
}
