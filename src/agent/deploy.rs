//! Payload Transfer: copies the agent payload to the remote working directory.
//!
//! Workflow:
//! 1. Stat the working directory, create it (0700) when missing
//! 2. Remove any stale payload
//! 3. Stream the local payload over SFTP
//! 4. chmod 0755
//!
//! Repeating the transfer always leaves the same remote state.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::launcher::{Progress, TransferError};
use crate::sftp::{remote_join, FileKind, RemoteFs, SftpError};
use crate::ssh::{BoxedReader, Transport};

/// File name of the agent payload on the remote host.
pub const DEFAULT_PAYLOAD_NAME: &str = "slave.jar";

const WORKING_DIRECTORY_MODE: u32 = 0o700;
const PAYLOAD_MODE: u32 = 0o755;

/// The agent payload to run on the remote host.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Name of the payload file in the working directory.
    fn file_name(&self) -> &str;

    async fn open(&self) -> io::Result<BoxedReader>;
}

/// A payload read from a local file.
#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
    file_name: String,
}

impl FilePayload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_name: DEFAULT_PAYLOAD_NAME.to_string(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PayloadSource for FilePayload {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    async fn open(&self) -> io::Result<BoxedReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

/// A payload held in memory.
#[derive(Debug, Clone)]
pub struct MemoryPayload {
    file_name: String,
    data: Arc<[u8]>,
}

impl MemoryPayload {
    pub fn new(file_name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl PayloadSource for MemoryPayload {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    async fn open(&self) -> io::Result<BoxedReader> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }
}

/// Copy `payload` into `working_directory`, returning its remote path.
pub async fn transfer(
    transport: &mut dyn Transport,
    working_directory: &str,
    payload: &dyn PayloadSource,
    progress: &Progress,
) -> Result<String, TransferError> {
    progress.info("Starting sftp client");
    let mut fs = transport.open_sftp().await?;
    let result = copy_payload(fs.as_mut(), working_directory, payload, progress).await;
    fs.close().await;
    result
}

async fn copy_payload(
    fs: &mut dyn RemoteFs,
    working_directory: &str,
    payload: &dyn PayloadSource,
    progress: &Progress,
) -> Result<String, TransferError> {
    let path = remote_join(working_directory, payload.file_name());
    let copy_error = |source: SftpError| TransferError::Copy {
        path: path.clone(),
        source,
    };

    match fs.stat(working_directory).await.map_err(copy_error)? {
        Some(FileKind::Directory) => {}
        Some(_) => return Err(TransferError::NotADirectory(working_directory.to_string())),
        None => {
            progress.info(format!(
                "Remote file system root {} does not exist. Will try to create it...",
                working_directory
            ));
            fs.mkdirs(working_directory, WORKING_DIRECTORY_MODE)
                .await
                .map_err(|e| match e {
                    SftpError::InvalidPath(p) => TransferError::NotADirectory(p),
                    other => copy_error(other),
                })?;
        }
    }

    // A shorter payload must not leave the tail of an older one behind
    match fs.remove_file(&path).await {
        Ok(()) => debug!("[sftp] Removed stale {}", path),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(copy_error(e)),
    }

    progress.info(format!("Copying {}", payload.file_name()));
    let mut local = payload.open().await.map_err(TransferError::LocalPayload)?;
    let mut remote = fs.create(&path).await.map_err(copy_error)?;
    let copied = tokio::io::copy(&mut local, &mut remote)
        .await
        .map_err(|e| copy_error(SftpError::IoError(e)))?;
    remote
        .shutdown()
        .await
        .map_err(|e| copy_error(SftpError::IoError(e)))?;
    fs.chmod(&path, PAYLOAD_MODE).await.map_err(copy_error)?;

    info!("[sftp] Copied {} bytes to {}", copied, path);
    progress.info(format!("Copied {} bytes.", copied));
    Ok(path)
}
