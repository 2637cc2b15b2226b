//! SSH transport layer
//!
//! [`Connector`] opens a [`Transport`] to a [`RemoteTarget`]; the transport
//! authenticates, runs commands, opens SFTP and starts long-lived remote
//! processes. The launcher only talks to these traits, the russh-backed
//! implementation lives in [`client`].

mod auth;
pub mod client;
#[cfg(test)]
pub mod mock;
pub mod ppk;
mod types;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::sftp::{RemoteFs, SftpError};

pub use auth::{AuthStrategy, Authenticator, DEFAULT_KEY_NAMES};
pub use client::{HostKeyPolicy, SshConnector, SshSettings};
pub use types::{Credentials, KeyMaterial, RemoteTarget, Secret, DEFAULT_PORT};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// SSH transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {message}")]
    Connect { addr: String, message: String },

    #[error("Connection timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid private key {path}: {message}")]
    InvalidKey { path: String, message: String },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection already closed")]
    Closed,

    #[error(transparent)]
    Sftp(#[from] SftpError),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        TransportError::Ssh(e.to_string())
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the server closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            exit_status: Some(0),
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_status(mut self, status: u32) -> Self {
        self.exit_status = Some(status);
        self
    }

    /// stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// How a remote process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: Option<u32>,
    /// Transport-level failure that ended the process, if any
    pub error: Option<String>,
}

/// A started remote process and its standard streams.
///
/// Dropping `terminate` (or sending on it) closes the remote channel.
/// `exited` resolves once the channel is gone.
pub struct RemoteProcess {
    pub stdout: BoxedReader,
    pub stdin: BoxedWriter,
    pub stderr: BoxedReader,
    pub exited: oneshot::Receiver<ProcessExit>,
    pub terminate: oneshot::Sender<()>,
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Transport>, TransportError>;
}

/// A live connection to one remote host.
///
/// A transport belongs to exactly one launch attempt and is never reused.
#[async_trait]
pub trait Transport: Send {
    /// Returns `Ok(false)` when the server rejects the key.
    async fn auth_publickey(&mut self, user: &str, key: &KeyMaterial)
        -> Result<bool, TransportError>;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<bool, TransportError>;

    /// Run a command to completion and capture its output.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError>;

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>, TransportError>;

    /// Start a long-lived process on its own channel.
    async fn spawn(&mut self, command: &str) -> Result<RemoteProcess, TransportError>;

    /// Idempotent.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Quote a value for a POSIX shell.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
