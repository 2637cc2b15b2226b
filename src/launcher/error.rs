//! Launch errors

use std::io;

use thiserror::Error;

use crate::session::{LaunchState, StateTransitionError};
use crate::sftp::SftpError;
use crate::ssh::TransportError;

/// Why a launch attempt failed
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("Authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    #[error("SSH connection reports garbage before command execution; make sure .bashrc, .profile and friends are quiet for non-interactive shells")]
    TransportContaminated { output: String },

    #[error("Could not find any known supported java version in {tried:?}, and the JDK install fallback failed: {cause}")]
    NoCompatibleRuntime { tried: Vec<String>, cause: String },

    #[error("Failed to detect the remote OS and CPU from {uname:?}")]
    UnknownEnvironment { uname: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Failed to start the agent process: {0}")]
    ProcessStartFailed(String),

    #[error("Launch interrupted while {stage}")]
    Interrupted { stage: LaunchState },

    #[error("Remote command `{command}` failed: {source}")]
    Remote {
        command: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Sequence(#[from] StateTransitionError),
}

/// Payload copy errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("Failed to read the agent payload: {0}")]
    LocalPayload(#[source] io::Error),

    #[error("Failed to copy the agent payload to {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: SftpError,
    },

    #[error("Failed to open SFTP: {0}")]
    Transport(#[from] TransportError),
}
