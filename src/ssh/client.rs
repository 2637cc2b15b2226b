//! russh-backed [`Connector`] and [`Transport`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Connector, ExecOutput, KeyMaterial, RemoteProcess, RemoteTarget, Transport, TransportError};
use crate::agent::transport::bridge_channel;
use crate::sftp::{RemoteFs, SftpError, SftpFs};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// How server host keys are verified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any key, only log its fingerprint
    #[default]
    AcceptAny,
    /// Require a matching entry in the local `known_hosts`
    KnownHosts,
}

/// Connection settings shared by every launch through one connector
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    /// Keep-alive interval (`None` = disabled)
    pub keep_alive_interval: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keep_alive_interval: Some(Duration::from_secs(30)),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// russh client callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                debug!("[ssh] {} host key {}", self.host, fingerprint);
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!("[ssh] {} host key {} is not in known_hosts", self.host, fingerprint);
                        Ok(false)
                    }
                    Err(e) => {
                        warn!("[ssh] {} host key {} rejected: {}", self.host, fingerprint, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Opens russh connections.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Transport>, TransportError> {
        let config = client::Config {
            keepalive_interval: self.settings.keep_alive_interval,
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            policy: self.settings.host_key_policy,
        };

        let timeout_secs = self.settings.connect_timeout.as_secs();
        let handle = tokio::time::timeout(
            self.settings.connect_timeout,
            client::connect(Arc::new(config), (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout_secs))?
        .map_err(|e| TransportError::Connect {
            addr: target.address(),
            message: e.to_string(),
        })?;

        info!("[ssh] Connected to {}", target.address());
        Ok(Box::new(SshTransport {
            handle,
            host: target.host.clone(),
            closed: false,
        }))
    }
}

/// An open russh connection.
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    host: String,
    closed: bool,
}

impl SshTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &KeyMaterial,
    ) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let passphrase = key.passphrase.as_deref().map(String::as_str);
        let private_key = russh::keys::decode_secret_key(&key.openssh, passphrase).map_err(|e| {
            TransportError::InvalidKey {
                path: key.source.display().to_string(),
                message: e.to_string(),
            }
        })?;

        let hash_alg = self.handle.best_supported_rsa_hash().await?.flatten();
        let result = self
            .handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(private_key), hash_alg))
            .await?;
        Ok(result.success())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let result = self.handle.authenticate_password(user, password).await?;
        Ok(result.success())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        self.ensure_open()?;
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = ExecOutput::default();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    output.stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    output.exit_status = Some(exit_status)
                }
                // ExitStatus may still follow Eof
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }
        debug!(
            "[ssh] {} `{}` exited with {:?}",
            self.host, command, output.exit_status
        );
        Ok(output)
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>, TransportError> {
        self.ensure_open()?;
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;
        let session = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;
        Ok(Box::new(SftpFs::new(session)))
    }

    async fn spawn(&mut self, command: &str) -> Result<RemoteProcess, TransportError> {
        self.ensure_open()?;
        let channel = self.handle.channel_open_session().await?;
        bridge_channel(channel, command).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("[ssh] disconnect from {} failed: {}", self.host, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed || self.handle.is_closed()
    }
}
