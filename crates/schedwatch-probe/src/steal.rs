//! Steal-time sources.
//!
//! A steal-time source produces a cumulative counter, in nanoseconds, of
//! CPU time taken from this host or guest by something outside its
//! control. Sources never fail: an unreadable or malformed source
//! degrades to a zero sample.

use crate::guestlib::{GuestLibStealSource, VmGuestLib};
use schedwatch_common::config::{StealSourceKind, StealSourceSelection, NS_PER_SEC};
use schedwatch_common::error::{WatchError, WatchResult};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, info, trace};

/// Kernel CPU accounting exposition.
pub const PROC_STAT_PATH: &str = "/proc/stat";

/// Clock tick frequency assumed when `_SC_CLK_TCK` is unavailable.
pub const FALLBACK_CLOCK_TICK_HZ: u64 = 100;

/// Produces a cumulative stolen-time counter in nanoseconds.
pub trait StealTimeSource {
    /// Which implementation this is.
    fn kind(&self) -> StealSourceKind;

    /// Sample the cumulative steal counter. Returns 0 when unavailable.
    ///
    /// May itself take measurable wall-clock time.
    fn sample(&mut self) -> u64;
}

impl<T: StealTimeSource + ?Sized> StealTimeSource for Box<T> {
    fn kind(&self) -> StealSourceKind {
        (**self).kind()
    }

    fn sample(&mut self) -> u64 {
        (**self).sample()
    }
}

/// Tick counters from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    /// Normal processes in user mode.
    pub user: u64,
    /// Niced processes in user mode.
    pub nice: u64,
    /// Kernel mode.
    pub system: u64,
    /// Idle.
    pub idle: u64,
    /// Waiting for I/O.
    pub iowait: u64,
    /// Servicing interrupts.
    pub irq: u64,
    /// Servicing softirqs.
    pub softirq: u64,
    /// Involuntary wait while the hypervisor ran something else.
    pub steal: u64,
}

impl CpuTimes {
    /// Parse an aggregate `cpu` line.
    ///
    /// Fields are read in order until the first one that is not an
    /// unsigned integer. At least five fields must parse; fields missing
    /// from a shorter line stay zero. Per-CPU lines (`cpu0`, ...) and any
    /// other record are rejected.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "cpu" {
            return None;
        }

        let mut fields = [0u64; 8];
        let mut parsed = 0;
        for (slot, token) in fields.iter_mut().zip(tokens) {
            match token.parse::<u64>() {
                Ok(value) => {
                    *slot = value;
                    parsed += 1;
                }
                Err(_) => break,
            }
        }

        if parsed <= 4 {
            return None;
        }

        let [user, nice, system, idle, iowait, irq, softirq, steal] = fields;
        Some(Self {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
        })
    }
}

/// Nanoseconds per clock tick for a tick frequency.
#[must_use]
pub fn tick_factor_ns(clock_tick_hz: u64) -> u64 {
    NS_PER_SEC / clock_tick_hz.max(1)
}

/// Platform clock tick frequency, falling back to 100 Hz.
#[cfg(unix)]
#[must_use]
#[allow(unsafe_code)]
pub fn clock_tick_hz() -> u64 {
    // SAFETY: sysconf has no side effects for this query
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    match u64::try_from(hz) {
        Ok(hz) if hz > 0 => hz,
        _ => {
            trace!("Can't get _SC_CLK_TCK, using {FALLBACK_CLOCK_TICK_HZ}");
            FALLBACK_CLOCK_TICK_HZ
        }
    }
}

/// Platform clock tick frequency, always 100 Hz here.
#[cfg(not(unix))]
#[must_use]
pub fn clock_tick_hz() -> u64 {
    FALLBACK_CLOCK_TICK_HZ
}

/// Host kernel accounting source.
#[derive(Debug, Clone)]
pub struct KernelStealSource {
    path: PathBuf,
    clock_tick_hz: u64,
}

impl Default for KernelStealSource {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStealSource {
    /// Read `/proc/stat` with the platform clock tick.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(PROC_STAT_PATH, clock_tick_hz())
    }

    /// Read an arbitrary accounting file with an explicit tick frequency.
    pub fn with_path(path: impl Into<PathBuf>, clock_tick_hz: u64) -> Self {
        Self {
            path: path.into(),
            clock_tick_hz,
        }
    }

    fn read_cpu_times(&self) -> Option<CpuTimes> {
        let file = File::open(&self.path).ok()?;
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .find_map(|line| CpuTimes::parse_line(&line))
    }
}

impl StealTimeSource for KernelStealSource {
    fn kind(&self) -> StealSourceKind {
        StealSourceKind::Kernel
    }

    fn sample(&mut self) -> u64 {
        let Some(times) = self.read_cpu_times() else {
            trace!(path = %self.path.display(), "No usable cpu line, steal sample is 0");
            return 0;
        };

        let factor = tick_factor_ns(self.clock_tick_hz);
        let steal_ns = times.steal.saturating_mul(factor);

        trace!(
            "kernel steal stats: user = {}, nice = {}, system = {}, idle = {}, iowait = {}, \
             irq = {}, softirq = {}, steal = {}, factor = {}, result steal = {}",
            times.user,
            times.nice,
            times.system,
            times.idle,
            times.iowait,
            times.irq,
            times.softirq,
            times.steal,
            factor,
            steal_ns
        );

        steal_ns
    }
}

/// Choose the steal-time source once at startup.
///
/// # Errors
///
/// Returns [`WatchError::Io`] only when the guest API was explicitly
/// required and cannot be opened.
pub fn select_steal_source(selection: StealSourceSelection) -> WatchResult<Box<dyn StealTimeSource>> {
    match selection {
        StealSourceSelection::Kernel => Ok(Box::new(KernelStealSource::new())),
        StealSourceSelection::GuestLib => {
            let api = VmGuestLib::open()
                .map_err(|e| WatchError::Io(format!("Can't open guestlib handle: {e}")))?;
            info!("Using VMGuestLib");
            Ok(Box::new(GuestLibStealSource::new(api)))
        }
        StealSourceSelection::Auto => match VmGuestLib::open() {
            Ok(api) => {
                info!("Using VMGuestLib");
                Ok(Box::new(GuestLibStealSource::new(api)))
            }
            Err(e) => {
                debug!("Can't open guestlib handle: {e}");
                Ok(Box::new(KernelStealSource::new()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_line() {
        let times = CpuTimes::parse_line("cpu  100 5 50 800 2 1 3 40 0 0").unwrap();
        assert_eq!(times.user, 100);
        assert_eq!(times.idle, 800);
        assert_eq!(times.steal, 40);
    }

    #[test]
    fn test_parse_short_line_defaults_steal_to_zero() {
        let times = CpuTimes::parse_line("cpu 1 2 3 4 5").unwrap();
        assert_eq!(times.iowait, 5);
        assert_eq!(times.steal, 0);
    }

    #[test]
    fn test_parse_rejects_four_fields() {
        assert!(CpuTimes::parse_line("cpu 1 2 3 4").is_none());
    }

    #[test]
    fn test_parse_stops_at_garbage() {
        let times = CpuTimes::parse_line("cpu 1 2 3 4 5 6 x 8").unwrap();
        assert_eq!(times.irq, 6);
        assert_eq!(times.softirq, 0);
        assert_eq!(times.steal, 0);

        assert!(CpuTimes::parse_line("cpu 1 2 x 4 5 6 7 8").is_none());
    }

    #[test]
    fn test_parse_rejects_other_records() {
        assert!(CpuTimes::parse_line("cpu0 1 2 3 4 5 6 7 8").is_none());
        assert!(CpuTimes::parse_line("intr 1 2 3 4 5 6 7 8").is_none());
        assert!(CpuTimes::parse_line("").is_none());
    }

    #[test]
    fn test_tick_factor() {
        assert_eq!(tick_factor_ns(100), 10_000_000);
        assert_eq!(tick_factor_ns(1000), 1_000_000);
        assert_eq!(tick_factor_ns(0), NS_PER_SEC);
    }

    #[test]
    fn test_kernel_source_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cpu 100 5 50 800 2 1 3 40").unwrap();
        writeln!(file, "cpu0 50 2 25 400 1 0 1 20").unwrap();

        let mut source = KernelStealSource::with_path(file.path(), 100);
        assert_eq!(source.sample(), 400_000_000);
        assert_eq!(source.kind(), StealSourceKind::Kernel);
    }

    #[test]
    fn test_kernel_source_skips_leading_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "btime 1700000000").unwrap();
        writeln!(file, "cpu 1 1 1 1 1 1 1 7").unwrap();

        let mut source = KernelStealSource::with_path(file.path(), 1000);
        assert_eq!(source.sample(), 7_000_000);
    }

    #[test]
    fn test_kernel_source_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = KernelStealSource::with_path(dir.path().join("stat"), 100);
        assert_eq!(source.sample(), 0);
    }

    #[test]
    fn test_kernel_source_malformed_is_zero() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cpu not a number").unwrap();

        let mut source = KernelStealSource::with_path(file.path(), 100);
        assert_eq!(source.sample(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_proc_stat_does_not_panic() {
        let mut source = KernelStealSource::new();
        let first = source.sample();
        let second = source.sample();
        assert!(second >= first);
    }

    #[test]
    fn test_kernel_selection_never_fails() {
        let source = select_steal_source(StealSourceSelection::Kernel).unwrap();
        assert_eq!(source.kind(), StealSourceKind::Kernel);
    }
}
