//! Probe loop state machine.
//!
//! RUNNING → STOPPING → STOPPED, nothing else. The loop enters RUNNING,
//! moves to STOPPING when it observes a stop request at the top of an
//! iteration, and reaches STOPPED once the final snapshot is emitted.

use crate::error::{WatchError, WatchResult};
use std::fmt;
use tracing::debug;

/// States of the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProbeState {
    /// Measuring scheduling gaps.
    #[default]
    Running,
    /// Stop observed; final snapshot pending.
    Stopping,
    /// Loop has exited.
    Stopped,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl ProbeState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ProbeState) -> bool {
        matches!(
            (self, target),
            (Self::Running, Self::Stopping) | (Self::Stopping, Self::Stopped)
        )
    }
}

/// State machine wrapper that rejects invalid transitions.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ProbeState,
}

impl StateMachine {
    /// Create a new state machine starting in RUNNING.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ProbeState::Running,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ProbeState {
        self.current
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidStateTransition`] for anything other
    /// than RUNNING → STOPPING or STOPPING → STOPPED.
    pub fn transition(&mut self, target: ProbeState) -> WatchResult<()> {
        if self.current.can_transition_to(target) {
            debug!(from = %self.current, to = %target, "Probe state transition");
            self.current = target;
            Ok(())
        } else {
            Err(WatchError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
