//! Monotonic clock source.

use nix::time::{clock_gettime, ClockId};
use schedwatch_common::config::NS_PER_SEC;
use schedwatch_common::error::{WatchError, WatchResult};

/// Source of monotonic nanosecond timestamps.
///
/// Only differences between two readings are meaningful.
pub trait Clock {
    /// Read the current timestamp in nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Clock`] if the clock cannot be read. Callers
    /// treat this as fatal.
    fn now(&self) -> WatchResult<u64>;
}

/// `CLOCK_MONOTONIC` reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> WatchResult<u64> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map_err(|e| WatchError::Clock(e.to_string()))?;

        // CLOCK_MONOTONIC never reports negative components.
        let secs = u64::try_from(ts.tv_sec()).unwrap_or(0);
        let nanos = u64::try_from(ts.tv_nsec()).unwrap_or(0);
        Ok(secs * NS_PER_SEC + nanos)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> WatchResult<u64> {
        (**self).now()
    }
}
