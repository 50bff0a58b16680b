//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Writing `/proc/stat`-style fixtures with a controllable steal column
//! - Wrapping the real `poll(2)` wait with test-driven side effects

use schedwatch_common::config::{StealSourceKind, ThresholdConfig};
use schedwatch_common::error::WatchResult;
use schedwatch_probe::probe::{PollWaiter, Waiter};
use schedwatch_probe::steal::KernelStealSource;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Tick rate used for fixtures, so one steal tick is 10 ms.
pub const FIXTURE_HZ: u64 = 100;

/// Nanoseconds per fixture tick.
pub const TICK_NS: u64 = 10_000_000;

/// A `/proc/stat` lookalike whose steal column can be rewritten.
pub struct StatFixture {
    file: NamedTempFile,
}

impl StatFixture {
    /// Create a fixture with the given aggregate steal ticks.
    pub fn new(steal_ticks: u64) -> Self {
        let fixture = Self {
            file: NamedTempFile::new().expect("create stat fixture"),
        };
        fixture.set_steal(steal_ticks);
        fixture
    }

    /// Rewrite the fixture with a new steal counter.
    pub fn set_steal(&self, steal_ticks: u64) {
        let mut file = self.file.reopen().expect("reopen stat fixture");
        file.set_len(0).expect("truncate stat fixture");
        write!(
            file,
            "cpu  1000 20 300 90000 40 0 10 {steal_ticks} 0 0\n\
             cpu0 500 10 150 45000 20 0 5 {steal_ticks} 0 0\n\
             intr 12345\n\
             ctxt 67890\n"
        )
        .expect("write stat fixture");
    }

    /// Path of the fixture file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Kernel steal source reading this fixture.
    pub fn source(&self) -> KernelStealSource {
        KernelStealSource::with_path(self.path(), FIXTURE_HZ)
    }
}

/// Kernel-source thresholds with the given gap.
pub fn kernel_thresholds(max_gap_ms: u64) -> ThresholdConfig {
    ThresholdConfig::new(max_gap_ms, 10.0, StealSourceKind::Kernel).expect("valid thresholds")
}

/// Real `poll(2)` wait preceded by a per-call hook.
///
/// The hook receives the 1-based call number.
pub struct HookedWaiter<F: FnMut(usize)> {
    inner: PollWaiter,
    calls: usize,
    hook: F,
}

impl<F: FnMut(usize)> HookedWaiter<F> {
    pub fn new(hook: F) -> Self {
        Self {
            inner: PollWaiter,
            calls: 0,
            hook,
        }
    }
}

impl<F: FnMut(usize)> Waiter for HookedWaiter<F> {
    fn wait(&mut self, timeout_ms: i32) -> WatchResult<()> {
        self.calls += 1;
        (self.hook)(self.calls);
        self.inner.wait(timeout_ms)
    }
}
