//! Signal handling for stop and report-now requests.
//!
//! SIGINT and SIGTERM request a stop; SIGUSR1 requests a statistics
//! snapshot. Each handler stores one atomic flag and returns, nothing
//! else runs in signal context. Handlers are installed without
//! `SA_RESTART` so a pending `poll(2)` returns `EINTR` right away.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use schedwatch_common::error::{WatchError, WatchResult};
use schedwatch_probe::control::ControlFlags;
use std::os::raw::c_int;
use tracing::debug;

/// Flags shared with the signal handlers.
static CONTROL: ControlFlags = ControlFlags::new();

/// Signals that request a stop.
pub const STOP_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Signal that requests a statistics snapshot.
pub const REPORT_SIGNAL: Signal = Signal::SIGUSR1;

extern "C" fn stop_handler(_: c_int) {
    CONTROL.request_stop();
}

extern "C" fn report_handler(_: c_int) {
    CONTROL.request_report();
}

/// Handle to the installed signal handlers.
#[derive(Debug, Clone, Copy)]
pub struct SignalController {
    flags: &'static ControlFlags,
}

impl SignalController {
    /// Install handlers for the stop and report signals.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Io`] if `sigaction` fails.
    #[allow(unsafe_code)]
    pub fn install() -> WatchResult<Self> {
        let stop = SigAction::new(
            SigHandler::Handler(stop_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let report = SigAction::new(
            SigHandler::Handler(report_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );

        for signal in STOP_SIGNALS {
            // SAFETY: the handler only stores an atomic flag
            unsafe { sigaction(signal, &stop) }
                .map_err(|e| WatchError::Io(format!("sigaction({signal}) failed: {e}")))?;
        }
        // SAFETY: the handler only stores an atomic flag
        unsafe { sigaction(REPORT_SIGNAL, &report) }
            .map_err(|e| WatchError::Io(format!("sigaction({REPORT_SIGNAL}) failed: {e}")))?;

        debug!("Signal handlers registered");
        Ok(Self { flags: &CONTROL })
    }

    /// Flags the probe loop polls.
    pub fn flags(&self) -> &'static ControlFlags {
        self.flags
    }
}
