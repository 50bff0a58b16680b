//! Probe loop acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - The loop runs until a stop is requested and ends in STOPPED
//! - A stop is observed within one poll quantum
//! - A real stall longer than the gap is counted as an overrun
//! - Steal growth during a stall raises the steal alarm
//! - A report request from another thread produces exactly one snapshot

use super::common::{kernel_thresholds, HookedWaiter, StatFixture, TICK_NS};
use schedwatch_common::state::ProbeState;
use schedwatch_probe::clock::MonotonicClock;
use schedwatch_probe::control::ControlFlags;
use schedwatch_probe::probe::{PollWaiter, Probe};
use schedwatch_probe::steal::KernelStealSource;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_loop_runs_until_stopped() {
    let fixture = StatFixture::new(40);
    let flags = ControlFlags::new();
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), PollWaiter, kernel_thresholds(30)).unwrap();

    let snapshot = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(120));
            flags.request_stop();
        });
        probe.run(&flags).unwrap()
    });

    assert_eq!(probe.state(), ProbeState::Stopped);
    assert!(snapshot.elapsed_ns >= 120_000_000, "elapsed {}", snapshot.elapsed_ns);
    assert_eq!(snapshot.overrun_count, probe.statistics().overrun_count());
    assert_eq!(probe.reports_emitted(), 1);
}

#[test]
fn test_stop_observed_within_poll_quantum() {
    let fixture = StatFixture::new(0);
    let flags = ControlFlags::new();
    // 300 ms gap gives a 100 ms poll quantum
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), PollWaiter, kernel_thresholds(300)).unwrap();

    let started = Instant::now();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            flags.request_stop();
        });
        probe.run(&flags).unwrap();
    });

    assert_eq!(probe.state(), ProbeState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_stall_counts_overrun() {
    let fixture = StatFixture::new(0);
    let flags = ControlFlags::new();
    let waiter = HookedWaiter::new(|call| {
        if call == 3 {
            thread::sleep(Duration::from_millis(100));
        }
        if call >= 5 {
            flags.request_stop();
        }
    });
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), waiter, kernel_thresholds(30)).unwrap();

    let snapshot = probe.run(&flags).unwrap();

    assert!(snapshot.overrun_count >= 1);
    assert_eq!(probe.state(), ProbeState::Stopped);
}

#[test]
fn test_steal_growth_during_stall_raises_alarm() {
    let fixture = StatFixture::new(40);
    let flags = ControlFlags::new();
    let waiter = HookedWaiter::new(|_| {
        fixture.set_steal(45);
        thread::sleep(Duration::from_millis(60));
    });
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), waiter, kernel_thresholds(30)).unwrap();

    let measurement = probe.iterate(&flags).unwrap();

    assert!(measurement.elapsed_ns >= 60_000_000);
    assert_eq!(measurement.steal_delta_ns, 5 * TICK_NS);
    assert!(measurement.classification.overrun);
    assert!(measurement.classification.steal_alarm);
    assert_eq!(probe.statistics().overrun_count(), 1);
}

#[test]
fn test_stall_without_steal_is_not_an_alarm() {
    let fixture = StatFixture::new(40);
    let flags = ControlFlags::new();
    let waiter = HookedWaiter::new(|_| thread::sleep(Duration::from_millis(60)));
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), waiter, kernel_thresholds(30)).unwrap();

    let measurement = probe.iterate(&flags).unwrap();

    assert!(measurement.classification.overrun);
    assert_eq!(measurement.steal_delta_ns, 0);
    assert_eq!(measurement.classification.steal_percent, Some(0.0));
    assert!(!measurement.classification.steal_alarm);
}

#[test]
fn test_report_request_from_other_thread() {
    let fixture = StatFixture::new(0);
    let flags = ControlFlags::new();
    let mut probe =
        Probe::new(MonotonicClock, fixture.source(), PollWaiter, kernel_thresholds(30)).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(40));
            flags.request_report();
            thread::sleep(Duration::from_millis(80));
            flags.request_stop();
        });
        probe.run(&flags).unwrap();
    });

    // One on request, one at stop
    assert_eq!(probe.reports_emitted(), 2);
    assert!(!flags.take_report_request());
}

#[test]
fn test_missing_stat_file_reads_zero_steal() {
    let dir = tempfile::tempdir().unwrap();
    let source = KernelStealSource::with_path(dir.path().join("stat"), 100);
    let flags = ControlFlags::new();
    let mut probe = Probe::new(MonotonicClock, source, PollWaiter, kernel_thresholds(30)).unwrap();

    let measurement = probe.iterate(&flags).unwrap();

    assert_eq!(measurement.steal_delta_ns, 0);
    assert!(!measurement.classification.steal_alarm);
}
