//! Launches build agents on remote hosts over SSH and supervises them.
//!
//! [`launcher::SshLauncher`] connects, authenticates, finds a usable Java
//! runtime, copies the agent payload and starts it. The returned
//! [`agent::AgentHandle`] carries the agent's message streams and cleans up
//! the remote side when the agent goes away.

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod launcher;
pub mod runtime;
pub mod session;
pub mod sftp;
pub mod ssh;

pub use agent::{AgentChannel, AgentHandle, AgentRegistry, DisconnectCause};
pub use config::{ConfigError, LauncherConfig};
pub use launcher::{LaunchConfig, LaunchError, LaunchListener, SshLauncher};
pub use session::LaunchState;
