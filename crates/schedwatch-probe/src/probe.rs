//! Self-scheduling probe loop.
//!
//! Each iteration suspends the thread for a third of the maximum allowed
//! gap and measures how much monotonic time and steal time actually
//! passed:
//! 1. Sample steal time, then the monotonic clock
//! 2. Emit a statistics snapshot if one was requested
//! 3. Suspend with `poll(2)` for the poll quantum
//! 4. Sample the monotonic clock, then steal time
//! 5. Classify: overrun if elapsed > max gap; blame the host if the steal
//!    share of the window also exceeds the alarm threshold
//!
//! Steal sampling can block, so it sits outside the two clock reads that
//! bracket the suspend.

use crate::clock::Clock;
use crate::control::ControlFlags;
use crate::stats::{RunStatistics, StatsSnapshot};
use crate::steal::StealTimeSource;
use nix::errno::Errno;
use schedwatch_common::config::{ThresholdConfig, NS_PER_MS, NS_PER_SEC};
use schedwatch_common::error::{WatchError, WatchResult};
use schedwatch_common::state::{ProbeState, StateMachine};
use tracing::{debug, error, info, trace, warn};

/// Bounded suspend primitive.
pub trait Waiter {
    /// Block for up to `timeout_ms` milliseconds.
    ///
    /// Returning early because a signal arrived is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Wait`] for any other failure.
    fn wait(&mut self, timeout_ms: i32) -> WatchResult<()>;
}

/// Suspends with `poll(2)` on an empty descriptor set.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollWaiter;

impl Waiter for PollWaiter {
    #[allow(unsafe_code)]
    fn wait(&mut self, timeout_ms: i32) -> WatchResult<()> {
        // SAFETY: no descriptors are passed, poll only sleeps
        let res = unsafe { libc::poll(std::ptr::null_mut(), 0, timeout_ms.max(0)) };
        match Errno::result(res) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(WatchError::Wait(e)),
        }
    }
}

/// Steal share of a window, in percent.
///
/// `None` when the window is empty, so a stalled clock never divides by
/// zero.
#[must_use]
pub fn steal_percent(steal_delta_ns: u64, elapsed_ns: u64) -> Option<f64> {
    if elapsed_ns == 0 {
        return None;
    }
    Some(100.0 * steal_delta_ns as f64 / elapsed_ns as f64)
}

/// Outcome of classifying one measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Elapsed time strictly exceeded the maximum gap.
    pub overrun: bool,
    /// Steal share of the window, if the window was non-empty.
    pub steal_percent: Option<f64>,
    /// Overrun with steal share above the alarm threshold.
    pub steal_alarm: bool,
}

/// Classify a window against the frozen thresholds.
#[must_use]
pub fn classify(elapsed_ns: u64, steal_delta_ns: u64, thresholds: &ThresholdConfig) -> Classification {
    let overrun = elapsed_ns > thresholds.max_gap_ns();
    let steal_percent = steal_percent(steal_delta_ns, elapsed_ns);
    let steal_alarm = overrun && steal_percent.is_some_and(|p| p > thresholds.steal_threshold());

    Classification {
        overrun,
        steal_percent,
        steal_alarm,
    }
}

/// One suspend-and-measure cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Monotonic time across the suspend (0 if the clock did not advance).
    pub elapsed_ns: u64,
    /// Steal time accumulated across the suspend.
    pub steal_delta_ns: u64,
    /// Classification of the window.
    pub classification: Classification,
}

fn secs(ns: u64) -> f64 {
    ns as f64 / NS_PER_SEC as f64
}

/// The measurement loop.
pub struct Probe<C: Clock, S: StealTimeSource, W: Waiter> {
    clock: C,
    steal: S,
    waiter: W,
    thresholds: ThresholdConfig,
    state: StateMachine,
    stats: RunStatistics,
    reports_emitted: u64,
}

impl<C: Clock, S: StealTimeSource, W: Waiter> Probe<C, S, W> {
    /// Build a probe and capture the start timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Clock`] if the start time cannot be read.
    pub fn new(clock: C, steal: S, waiter: W, thresholds: ThresholdConfig) -> WatchResult<Self> {
        let start_ns = clock.now()?;
        Ok(Self {
            clock,
            steal,
            waiter,
            thresholds,
            state: StateMachine::new(),
            stats: RunStatistics::new(start_ns),
            reports_emitted: 0,
        })
    }

    /// Current loop state.
    pub fn state(&self) -> ProbeState {
        self.state.state()
    }

    /// Counters accumulated so far.
    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    /// Thresholds in force.
    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    /// Number of statistics snapshots logged so far.
    pub fn reports_emitted(&self) -> u64 {
        self.reports_emitted
    }

    /// Snapshot of the statistics as of now, without logging.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Clock`] if the clock cannot be read.
    pub fn snapshot(&self) -> WatchResult<StatsSnapshot> {
        Ok(self.stats.snapshot(self.clock.now()?))
    }

    fn report(&mut self) -> WatchResult<StatsSnapshot> {
        let snapshot = self.snapshot()?;
        info!(
            elapsed_ns = snapshot.elapsed_ns,
            overruns = snapshot.overrun_count,
            "{snapshot}"
        );
        self.reports_emitted += 1;
        Ok(snapshot)
    }

    /// Run one suspend-and-measure cycle.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Wait`] if the suspend fails for a reason other
    /// than interruption, or [`WatchError::Clock`] if the clock fails.
    pub fn iterate(&mut self, flags: &ControlFlags) -> WatchResult<Measurement> {
        let steal_prev = self.steal.sample();
        let prev_ns = self.clock.now()?;

        if flags.take_report_request() {
            self.report()?;
        }

        let poll_timeout_ms = self.thresholds.poll_timeout_ms();
        debug!(
            "now = {:.4}s, max_diff = {:.4}s, poll_timeout = {:.4}s, steal_time = {:.4}s",
            secs(prev_ns),
            secs(self.thresholds.max_gap_ns()),
            secs(u64::try_from(poll_timeout_ms).unwrap_or(0) * NS_PER_MS),
            secs(steal_prev)
        );

        self.waiter.wait(poll_timeout_ms)?;

        let now_ns = self.clock.now()?;
        let steal_now = self.steal.sample();

        let elapsed_ns = now_ns.checked_sub(prev_ns).unwrap_or_else(|| {
            warn!(prev_ns, now_ns, "Monotonic clock went backward, skipping classification");
            0
        });
        let steal_delta_ns = steal_now.saturating_sub(steal_prev);

        let classification = classify(elapsed_ns, steal_delta_ns, &self.thresholds);

        if classification.overrun {
            let percent = classification.steal_percent.unwrap_or(0.0);
            error!(
                elapsed_ns,
                max_gap_ns = self.thresholds.max_gap_ns(),
                steal_delta_ns,
                "Not scheduled for {:.4}s (threshold is {:.4}s), steal time is {:.4}s ({:.2}%)",
                secs(elapsed_ns),
                secs(self.thresholds.max_gap_ns()),
                secs(steal_delta_ns),
                percent
            );

            if classification.steal_alarm {
                warn!(
                    "Steal time is > {:.1}%, this is usually because of overloaded host machine",
                    self.thresholds.steal_threshold()
                );
            }

            self.stats.record_overrun();
        } else if classification.steal_percent.is_none() {
            debug!(elapsed_ns, steal_delta_ns, "Empty measurement window");
        } else {
            trace!(elapsed_ns, steal_delta_ns, "Scheduled on time");
        }

        Ok(Measurement {
            elapsed_ns,
            steal_delta_ns,
            classification,
        })
    }

    /// Loop until a stop is requested, then emit the final snapshot.
    ///
    /// A stop request is observed at the top of each iteration, so the
    /// loop exits within one poll quantum of it being set.
    ///
    /// # Errors
    ///
    /// Fatal loop errors are returned immediately without a final
    /// snapshot; the process is expected to exit with
    /// [`WatchError::exit_code`].
    pub fn run(&mut self, flags: &ControlFlags) -> WatchResult<StatsSnapshot> {
        info!(
            max_gap_ms = self.thresholds.max_gap_ms(),
            steal_threshold = self.thresholds.steal_threshold(),
            source = %self.thresholds.source(),
            "Running main poll loop with maximum timeout {} and steal threshold {:.0}%",
            self.thresholds.max_gap_ms(),
            self.thresholds.steal_threshold()
        );

        while self.state.state() == ProbeState::Running {
            if flags.stop_requested() {
                self.state.transition(ProbeState::Stopping)?;
                break;
            }
            self.iterate(flags)?;
        }

        info!("Main poll loop stopped");
        let snapshot = self.report()?;
        self.state.transition(ProbeState::Stopped)?;

        Ok(snapshot)
    }
}
