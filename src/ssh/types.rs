//! Launch target and credential types.
//!
//! Both are built from configuration once and stay immutable for the whole
//! launch attempt. Secrets live in [`Zeroizing`] buffers and are wiped when
//! the launch drops them.

use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroizing;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Secret text that is wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(******)")
    }
}

/// The remote host an agent is launched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    /// Java executable to try before the default candidates
    pub java_path: Option<String>,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: if port == 0 { DEFAULT_PORT } else { port },
            java_path: None,
        }
    }

    pub fn with_java_path(mut self, java_path: impl Into<String>) -> Self {
        self.java_path = Some(java_path.into());
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Credentials configured for a launch.
///
/// Which authentication strategies are attempted depends on which fields
/// are set; see [`crate::ssh::Authenticator`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub private_key: Option<PathBuf>,
    /// Passphrase of `private_key`; falls back to `password` when unset
    pub passphrase: Option<Secret>,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(Secret::new(password)),
            ..Default::default()
        }
    }

    pub fn private_key(username: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            username: Some(username.into()),
            private_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Configured username, or the local user name when none is set.
    pub fn effective_username(&self) -> String {
        match self.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let name = whoami::username();
                tracing::debug!("[ssh-auth] Defaulting the user name to {}", name);
                name
            }
        }
    }

    pub(crate) fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub(crate) fn has_private_key(&self) -> bool {
        self.private_key
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }

    pub(crate) fn key_passphrase(&self) -> Option<&Secret> {
        self.passphrase
            .as_ref()
            .filter(|p| !p.is_empty())
            .or(self.password.as_ref().filter(|p| !p.is_empty()))
    }
}

/// A private key ready for public-key authentication.
///
/// `openssh` always holds OpenSSH-format text; keys stored in other formats
/// are converted before they get here.
pub struct KeyMaterial {
    pub source: PathBuf,
    pub openssh: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
