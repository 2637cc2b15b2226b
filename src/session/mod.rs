//! Launch session lifecycle

mod state;

pub use state::{LaunchState, LaunchStateMachine, StateTransitionError};
