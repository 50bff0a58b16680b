//! Error types and process exit codes.

use nix::errno::Errno;
use thiserror::Error;

/// Exit status used when the suspend primitive fails for a reason other
/// than signal interruption.
pub const EXIT_WAIT_FAILURE: i32 = 2;

/// Exit status for every other fatal condition.
pub const EXIT_FAILURE: i32 = 1;

/// Watchdog error types covering configuration, startup, and fatal loop failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WatchError {
    /// Configuration or validation error, raised before the loop starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The monotonic clock could not be read.
    #[error("monotonic clock read failed: {0}")]
    Clock(String),

    /// The bounded wait failed with something other than `EINTR`.
    #[error("poll error: {0}")]
    Wait(Errno),

    /// Startup resource error (daemonize, signal registration, guest API).
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid probe state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl WatchError {
    /// Process exit status this error terminates with.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Wait(_) => EXIT_WAIT_FAILURE,
            _ => EXIT_FAILURE,
        }
    }
}

/// Convenience type alias for watchdog operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_failure_has_distinct_exit_code() {
        assert_eq!(WatchError::Wait(Errno::EFAULT).exit_code(), EXIT_WAIT_FAILURE);
        assert_eq!(WatchError::Config("bad".into()).exit_code(), EXIT_FAILURE);
        assert_eq!(WatchError::Clock("gone".into()).exit_code(), EXIT_FAILURE);
        assert_ne!(EXIT_WAIT_FAILURE, EXIT_FAILURE);
    }

    #[test]
    fn test_wait_error_display_includes_errno() {
        let msg = WatchError::Wait(Errno::EINVAL).to_string();
        assert!(msg.starts_with("poll error: EINVAL"), "{msg}");
    }
}
