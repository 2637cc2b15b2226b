//! Launch State Machine
//!
//! Defines the valid state transitions of one launch attempt:
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌─────────────────┐   ┌──────────────┐
//! │ Connecting │ ─►│ Authenticating │ ─►│ LocatingRuntime │ ─►│ Transferring │
//! └─────┬──────┘   └───────┬────────┘   └────────┬────────┘   └──────┬───────┘
//!       │                  │                     │                   ▼
//!       │                  │                     │            ┌──────────────┐
//!       │                  │  failure from any   │            │   Starting   │
//!       │                  │  non-terminal state │            └──────┬───────┘
//!       │                  │                     │                   ▼
//!       │                  ▼                     ▼            ┌──────────────┐
//!       └──────────► ┌───────────────┐ ◄───────────────────── │   Running    │
//!                    │ Disconnecting │                        └──────────────┘
//!                    └───────┬───────┘
//!                            ▼
//!                    ┌───────────────┐
//!                    │    Closed     │
//!                    └───────────────┘
//! ```
//!
//! The machine publishes every state on a `watch` channel so handles can
//! observe it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;

/// Launch states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    /// Opening the transport connection
    #[default]
    Connecting,
    Authenticating,
    /// Sanity check and runtime probing (including the install fallback)
    LocatingRuntime,
    /// Copying the agent payload
    Transferring,
    /// Starting the remote process
    Starting,
    /// Agent channel is up
    Running,
    /// Teardown in progress
    Disconnecting,
    Closed,
}

impl LaunchState {
    /// The state that follows on success, if any.
    pub fn next(self) -> Option<LaunchState> {
        match self {
            Self::Connecting => Some(Self::Authenticating),
            Self::Authenticating => Some(Self::LocatingRuntime),
            Self::LocatingRuntime => Some(Self::Transferring),
            Self::Transferring => Some(Self::Starting),
            Self::Starting => Some(Self::Running),
            Self::Running | Self::Disconnecting | Self::Closed => None,
        }
    }
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::LocatingRuntime => write!(f, "locating runtime"),
            Self::Transferring => write!(f, "transferring"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State machine for one launch attempt
#[derive(Debug)]
pub struct LaunchStateMachine {
    state: LaunchState,
    failure: Option<String>,
    state_changed_at: Instant,
    transition_count: u32,
    publisher: watch::Sender<LaunchState>,
}

impl Default for LaunchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchStateMachine {
    /// Create a new state machine in Connecting state
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(LaunchState::Connecting);
        Self {
            state: LaunchState::Connecting,
            failure: None,
            state_changed_at: Instant::now(),
            transition_count: 0,
            publisher,
        }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Why the launch is disconnecting, if it was not a normal shutdown
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_changed_at.elapsed()
    }

    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<LaunchState> {
        self.publisher.subscribe()
    }

    /// Move to the next launch stage.
    pub fn advance(&mut self, to: LaunchState) -> Result<(), StateTransitionError> {
        if self.state.next() == Some(to) {
            self.transition_to(to);
            Ok(())
        } else {
            Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Start teardown; allowed from every state before Disconnecting.
    pub fn start_disconnecting(&mut self, failure: Option<String>) -> Result<(), StateTransitionError> {
        match self.state {
            LaunchState::Disconnecting | LaunchState::Closed => {
                Err(StateTransitionError::InvalidTransition {
                    from: self.state,
                    to: LaunchState::Disconnecting,
                })
            }
            _ => {
                self.failure = failure;
                self.transition_to(LaunchState::Disconnecting);
                Ok(())
            }
        }
    }

    /// Complete teardown
    pub fn close(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            LaunchState::Disconnecting => {
                self.transition_to(LaunchState::Closed);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: LaunchState::Closed,
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == LaunchState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.state == LaunchState::Running
    }

    fn transition_to(&mut self, new_state: LaunchState) {
        tracing::debug!(
            "Launch state transition: {} -> {} (count: {})",
            self.state,
            new_state,
            self.transition_count + 1
        );
        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.transition_count += 1;
        self.publisher.send_replace(new_state);
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: LaunchState, to: LaunchState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = LaunchStateMachine::new();
        assert_eq!(sm.state(), LaunchState::Connecting);

        for to in [
            LaunchState::Authenticating,
            LaunchState::LocatingRuntime,
            LaunchState::Transferring,
            LaunchState::Starting,
            LaunchState::Running,
        ] {
            sm.advance(to).unwrap();
            assert_eq!(sm.state(), to);
        }
        assert!(sm.is_running());

        sm.start_disconnecting(None).unwrap();
        sm.close().unwrap();
        assert!(sm.is_terminal());
        assert_eq!(sm.transition_count(), 7);
    }

    #[test]
    fn test_failure_goes_straight_to_disconnecting() {
        let mut sm = LaunchStateMachine::new();
        sm.advance(LaunchState::Authenticating).unwrap();
        sm.start_disconnecting(Some("Authentication failed".to_string()))
            .unwrap();

        assert_eq!(sm.state(), LaunchState::Disconnecting);
        assert_eq!(sm.failure(), Some("Authentication failed"));
        sm.close().unwrap();
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = LaunchStateMachine::new();
        // Cannot skip stages
        assert!(sm.advance(LaunchState::Transferring).is_err());
        // Closed only after Disconnecting
        assert!(sm.close().is_err());

        sm.start_disconnecting(None).unwrap();
        assert!(sm.start_disconnecting(None).is_err());
        assert!(sm.advance(LaunchState::Authenticating).is_err());
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let mut sm = LaunchStateMachine::new();
        let rx = sm.subscribe();
        sm.advance(LaunchState::Authenticating).unwrap();
        assert_eq!(*rx.borrow(), LaunchState::Authenticating);
    }
}
