//! Run statistics and point-in-time snapshots.

use schedwatch_common::config::NS_PER_SEC;
use std::fmt;

/// Name used in human-readable diagnostics.
pub const PROGRAM_NAME: &str = "schedwatch";

/// Counters kept for the process lifetime.
///
/// Only the probe loop mutates this; the overrun count never decreases.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    start_ns: u64,
    overrun_count: u64,
}

impl RunStatistics {
    /// Start counting from the given monotonic timestamp.
    #[must_use]
    pub fn new(start_ns: u64) -> Self {
        Self {
            start_ns,
            overrun_count: 0,
        }
    }

    /// Count one detected overrun.
    pub fn record_overrun(&mut self) {
        self.overrun_count += 1;
    }

    /// Overruns detected since start.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Monotonic timestamp captured at loop entry.
    #[must_use]
    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    /// Build a snapshot as of `now_ns`. Pure read.
    #[must_use]
    pub fn snapshot(&self, now_ns: u64) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_ns: now_ns.saturating_sub(self.start_ns),
            overrun_count: self.overrun_count,
        }
    }
}

/// Elapsed run time and overrun count at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Nanoseconds since loop entry.
    pub elapsed_ns: u64,
    /// Overruns detected so far.
    pub overrun_count: u64,
}

impl StatsSnapshot {
    /// Elapsed run time in fractional seconds.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_ns as f64 / NS_PER_SEC as f64
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "During {:.4}s runtime {} was {}x not scheduled on time",
            self.elapsed_secs(),
            PROGRAM_NAME,
            self.overrun_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_statistics_are_empty() {
        let stats = RunStatistics::new(5_000);
        assert_eq!(stats.overrun_count(), 0);
        assert_eq!(stats.start_ns(), 5_000);
    }

    #[test]
    fn test_record_overrun_increments_by_one() {
        let mut stats = RunStatistics::new(0);
        stats.record_overrun();
        assert_eq!(stats.overrun_count(), 1);
        stats.record_overrun();
        assert_eq!(stats.overrun_count(), 2);
    }

    #[test]
    fn test_snapshot_is_pure() {
        let mut stats = RunStatistics::new(1_000_000_000);
        stats.record_overrun();

        let a = stats.snapshot(3_500_000_000);
        let b = stats.snapshot(3_500_000_000);
        assert_eq!(a, b);
        assert_eq!(a.elapsed_ns, 2_500_000_000);
        assert_eq!(a.overrun_count, 1);
        assert_eq!(stats.overrun_count(), 1);
    }

    #[test]
    fn test_snapshot_before_start_saturates() {
        let stats = RunStatistics::new(10);
        assert_eq!(stats.snapshot(5).elapsed_ns, 0);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = StatsSnapshot {
            elapsed_ns: 12_345_600_000,
            overrun_count: 3,
        };
        assert_eq!(
            snapshot.to_string(),
            "During 12.3456s runtime schedwatch was 3x not scheduled on time"
        );
    }
}
