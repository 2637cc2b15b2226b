//! Authentication strategies
//!
//! Order, first success wins:
//! 1. No key and no password configured: conventional key files in the
//!    local key directory, one after another
//! 2. Explicit private key file (PuTTY keys are converted first)
//! 3. Password
//!
//! Secrets are never logged; an attempt is logged as the user plus the key
//! path or a masked password.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::ppk;
use super::{Credentials, KeyMaterial, Transport, TransportError};
use crate::launcher::Progress;

/// Key file names tried in the key directory, in order.
pub const DEFAULT_KEY_NAMES: [&str; 5] = ["id_rsa", "id_dsa", "identity", "id_ecdsa", "id_ed25519"];

/// One way of proving identity to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    DiscoveredKey(PathBuf),
    ExplicitKey(PathBuf),
    Password,
}

pub struct Authenticator {
    key_dir: Option<PathBuf>,
}

impl Authenticator {
    pub fn new(key_dir: Option<PathBuf>) -> Self {
        Self { key_dir }
    }

    /// `~/.ssh` of the local user.
    pub fn default_key_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh"))
    }

    /// Strategies applicable to `credentials`, in the order they are tried.
    pub fn plan(&self, credentials: &Credentials) -> Vec<AuthStrategy> {
        let mut plan = Vec::new();

        if !credentials.has_private_key() && !credentials.has_password() {
            if let Some(dir) = &self.key_dir {
                plan.extend(
                    DEFAULT_KEY_NAMES
                        .iter()
                        .map(|name| dir.join(name))
                        .filter(|path| path.is_file())
                        .map(AuthStrategy::DiscoveredKey),
                );
            }
        }

        if let Some(key) = credentials.private_key.as_ref().filter(|_| credentials.has_private_key()) {
            if key.is_file() {
                plan.push(AuthStrategy::ExplicitKey(key.clone()));
            } else {
                warn!("[ssh-auth] Private key {} does not exist", key.display());
            }
        }

        plan.push(AuthStrategy::Password);
        plan
    }

    /// Try every planned strategy until one is accepted.
    ///
    /// Returns `Ok(false)` when all of them were rejected. A key that cannot
    /// be loaded counts as rejected; transport failures abort immediately.
    pub async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        credentials: &Credentials,
        progress: &Progress,
    ) -> Result<bool, TransportError> {
        let user = credentials.effective_username();

        for strategy in self.plan(credentials) {
            let accepted = match &strategy {
                AuthStrategy::DiscoveredKey(path) => {
                    progress.info(format!("Authenticating as {} with {}", user, path.display()));
                    self.try_key(transport, &user, path, None).await?
                }
                AuthStrategy::ExplicitKey(path) => {
                    progress.info(format!("Authenticating as {} with {}", user, path.display()));
                    let passphrase = credentials.key_passphrase().map(|s| s.expose());
                    self.try_key(transport, &user, path, passphrase).await?
                }
                AuthStrategy::Password => {
                    progress.info(format!("Authenticating as {}/******", user));
                    let password = credentials.password.as_ref().map(|p| p.expose()).unwrap_or("");
                    transport.auth_password(&user, password).await?
                }
            };

            if accepted {
                debug!("[ssh-auth] {:?} accepted for {}", strategy, user);
                return Ok(true);
            }
            debug!("[ssh-auth] {:?} rejected for {}", strategy, user);
        }

        Ok(false)
    }

    async fn try_key(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        path: &Path,
        passphrase: Option<&str>,
    ) -> Result<bool, TransportError> {
        let key = match load_key(path, passphrase).await {
            Ok(key) => key,
            Err(e) => {
                warn!("[ssh-auth] {}", e);
                return Ok(false);
            }
        };

        match transport.auth_publickey(user, &key).await {
            Err(e @ TransportError::InvalidKey { .. }) => {
                warn!("[ssh-auth] {}", e);
                Ok(false)
            }
            other => other,
        }
    }
}

/// Read a key file, converting PuTTY keys to OpenSSH text.
pub async fn load_key(path: &Path, passphrase: Option<&str>) -> Result<KeyMaterial, TransportError> {
    let invalid = |message: String| TransportError::InvalidKey {
        path: path.display().to_string(),
        message,
    };

    let text = Zeroizing::new(
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid(e.to_string()))?,
    );

    let openssh = if ppk::is_putty_key(&text) {
        debug!("[ssh-auth] {} is a PuTTY key file", path.display());
        ppk::to_openssh(&text).map_err(|e| invalid(e.to_string()))?
    } else {
        text
    };

    Ok(KeyMaterial {
        source: path.to_path_buf(),
        openssh,
        passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
    })
}
