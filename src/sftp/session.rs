//! [`RemoteFs`] over a `russh-sftp` client session

use async_trait::async_trait;
use russh_sftp::client::error::Error as ClientError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tracing::debug;

use super::{FileKind, RemoteFs, SftpError};
use crate::ssh::BoxedWriter;

pub struct SftpFs {
    session: SftpSession,
}

impl SftpFs {
    pub fn new(session: SftpSession) -> Self {
        Self { session }
    }
}

fn map_error(path: &str, err: ClientError) -> SftpError {
    match err {
        ClientError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::FileNotFound(path.to_string()),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            _ => SftpError::ProtocolError(format!("{}: {}", path, status.error_message)),
        },
        other => SftpError::ProtocolError(format!("{}: {}", path, other)),
    }
}

fn permissions(mode: u32) -> FileAttributes {
    FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&mut self, path: &str) -> Result<Option<FileKind>, SftpError> {
        match self.session.metadata(path).await {
            Ok(attrs) if attrs.is_dir() => Ok(Some(FileKind::Directory)),
            Ok(attrs) if attrs.is_regular() => Ok(Some(FileKind::File)),
            Ok(_) => Ok(Some(FileKind::Other)),
            Err(e) => match map_error(path, e) {
                SftpError::FileNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        debug!("[sftp] mkdir {} ({:o})", path, mode);
        self.session
            .create_dir(path)
            .await
            .map_err(|e| map_error(path, e))?;
        self.chmod(path, mode).await
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError> {
        debug!("[sftp] rm {}", path);
        self.session
            .remove_file(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn create(&mut self, path: &str) -> Result<BoxedWriter, SftpError> {
        let file = self
            .session
            .create(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(Box::new(file))
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        self.session
            .set_metadata(path, permissions(mode))
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn close(&mut self) {
        if let Err(e) = self.session.close().await {
            debug!("[sftp] close failed: {}", e);
        }
    }
}
