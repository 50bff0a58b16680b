//! Control flags shared between signal handlers and the probe loop.
//!
//! The only state mutated outside the loop's sequential control flow.
//! Writers set a flag and nothing else; the loop observes the flags at
//! the top of each iteration and clears the report flag once it has
//! acted on it.

use std::sync::atomic::{AtomicBool, Ordering};

/// Stop and report-now requests.
#[derive(Debug, Default)]
pub struct ControlFlags {
    stop_requested: AtomicBool,
    report_requested: AtomicBool,
}

impl ControlFlags {
    /// Create cleared flags. Usable in a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            report_requested: AtomicBool::new(false),
        }
    }

    /// Ask the loop to stop after the in-flight iteration.
    ///
    /// Async-signal-safe.
    #[inline]
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    /// Ask the loop to emit a statistics snapshot.
    ///
    /// Async-signal-safe.
    #[inline]
    pub fn request_report(&self) {
        self.report_requested.store(true, Ordering::Relaxed);
    }

    /// Check if a stop has been requested. Never cleared.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// Check if a report has been requested (and clear the flag).
    #[inline]
    pub fn take_report_request(&self) -> bool {
        self.report_requested.swap(false, Ordering::Relaxed)
    }
}
