//! Remote filesystem access
//!
//! [`RemoteFs`] is the small set of file operations the launcher needs on the
//! remote working directory. [`SftpFs`] implements it over `russh-sftp`.

mod error;
mod session;

use async_trait::async_trait;

use crate::ssh::BoxedWriter;

pub use error::SftpError;
pub use session::SftpFs;

/// Type of an existing remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    Other,
}

/// Join a remote directory and a name with exactly one `/`.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[async_trait]
pub trait RemoteFs: Send {
    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&mut self, path: &str) -> Result<Option<FileKind>, SftpError>;

    /// Create a single directory with the given permission bits.
    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), SftpError>;

    /// Fails with [`SftpError::FileNotFound`] when the file does not exist.
    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError>;

    /// Create or truncate a file; the writer must be shut down to finish it.
    async fn create(&mut self, path: &str) -> Result<BoxedWriter, SftpError>;

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SftpError>;

    async fn close(&mut self);

    /// Create `path` and every missing parent, each with `mode`.
    async fn mkdirs(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        let mut current = String::new();
        if path.starts_with('/') {
            current.push('/');
        }
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);

            match self.stat(&current).await? {
                Some(FileKind::Directory) => {}
                Some(_) => return Err(SftpError::InvalidPath(current)),
                None => self.mkdir(&current, mode).await?,
            }
        }
        Ok(())
    }
}
