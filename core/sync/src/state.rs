//! Sync manager state tracking.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the sync manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLifecycle {
    #[default]
    Stopped,
    /// Running the initial pass before the timer is scheduled.
    Starting,
    /// Timer scheduled.
    Running,
}

/// Bookkeeping across sync passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub lifecycle: SyncLifecycle,
    /// Last pass that completed without error.
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub passes: u64,
    pub skipped_passes: u64,
}

impl SyncState {
    /// Create a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded with a previously recorded success.
    pub fn with_last_success(last_success: Option<DateTime<Utc>>) -> Self {
        Self {
            last_success,
            ..Self::default()
        }
    }

    /// Record a successful pass.
    pub fn record_success(&mut self, at: DateTime<Utc>, duration_ms: u64) {
        self.last_success = Some(at);
        self.last_attempt = Some(at);
        self.last_error = None;
        self.last_duration_ms = Some(duration_ms);
        self.consecutive_failures = 0;
        self.passes += 1;
    }

    /// Record a failed pass.
    pub fn record_failure(&mut self, at: DateTime<Utc>, duration_ms: u64, error: impl Into<String>) {
        self.last_attempt = Some(at);
        self.last_error = Some(error.into());
        self.last_duration_ms = Some(duration_ms);
        self.consecutive_failures += 1;
        self.passes += 1;
    }

    /// Record a tick skipped because a pass was still in flight.
    pub fn record_skip(&mut self) {
        self.skipped_passes += 1;
    }

    /// Time since the last success, if there was one.
    pub fn offline_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_success.map(|last| now - last)
    }

    /// Whether the node has been out of sync longer than `threshold`.
    ///
    /// A node with no recorded success counts as long offline.
    pub fn is_long_offline(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.offline_duration(now) {
            Some(offline) => offline > threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_failures() {
        let mut state = SyncState::new();
        let now = Utc::now();
        state.record_failure(now, 10, "replica unreachable");
        state.record_failure(now, 12, "replica unreachable");
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_success, None);

        state.record_success(now, 8);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(state.passes, 3);
        assert_eq!(state.last_success, Some(now));
    }

    #[test]
    fn test_long_offline_threshold() {
        let now = Utc::now();
        let threshold = Duration::hours(24);

        assert!(SyncState::new().is_long_offline(now, threshold));

        let recent = SyncState::with_last_success(Some(now - Duration::hours(2)));
        assert!(!recent.is_long_offline(now, threshold));
        assert_eq!(recent.offline_duration(now), Some(Duration::hours(2)));

        let stale = SyncState::with_last_success(Some(now - Duration::hours(25)));
        assert!(stale.is_long_offline(now, threshold));

        let exact = SyncState::with_last_success(Some(now - threshold));
        assert!(!exact.is_long_offline(now, threshold));
    }
}
