//! SFTP error types

use thiserror::Error;

/// Remote file system errors, each carrying the remote path or the cause
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl SftpError {
    /// `stat` and `remove_file` treat a missing path as a normal outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SftpError::FileNotFound(_))
    }
}
