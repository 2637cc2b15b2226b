//! Configuration Types
//!
//! One JSON document describes one launch target plus the local pieces the
//! launcher needs (payload, key directory, JDK bundle location).

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::agent::{FilePayload, DEFAULT_PAYLOAD_NAME};
use crate::launcher::{LaunchConfig, SshLauncher};
use crate::runtime::{
    BundleInstaller, DefaultRuntimeProvider, ExplicitRuntimeProvider, HttpBundleSource,
    ListRuntimeProvider, RuntimeInstaller, RuntimeLocator,
};
use crate::ssh::{
    Authenticator, Credentials, HostKeyPolicy, RemoteTarget, Secret, SshConnector, SshSettings,
    DEFAULT_PORT,
};

/// A secret as written in the configuration file
///
/// ```json
/// "password": "hunter2"
/// "password": { "env": "AGENT_PASSWORD" }
/// "password": { "scrambled": "aHVudGVyMg==" }
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    Plain(String),
    /// Read from an environment variable when the launch is prepared
    Env { env: String },
    /// Base64 of the UTF-8 text; obfuscation only, not encryption
    Scrambled { scrambled: String },
}

impl SecretValue {
    pub fn scramble(plain: &str) -> Self {
        SecretValue::Scrambled {
            scrambled: BASE64.encode(plain.as_bytes()),
        }
    }

    pub fn resolve(&self) -> Result<Secret, ConfigError> {
        match self {
            SecretValue::Plain(value) => Ok(Secret::new(value.as_str())),
            SecretValue::Env { env: name } => env::var(name)
                .map(Secret::new)
                .map_err(|_| ConfigError::MissingEnv(name.clone())),
            SecretValue::Scrambled { scrambled } => {
                let bytes = BASE64
                    .decode(scrambled.trim())
                    .map_err(|e| ConfigError::Scrambled(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Secret::new)
                    .map_err(|e| ConfigError::Scrambled(e.to_string()))
            }
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::Env { env } => f.debug_struct("Env").field("env", env).finish(),
            _ => f.write_str("******"),
        }
    }
}

/// Launch configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// SSH host
    pub host: String,

    /// SSH port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Defaults to the local user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretValue>,

    /// Private key file (OpenSSH or PuTTY format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,

    /// Passphrase of the private key; the password is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<SecretValue>,

    /// Java executable tried before any other candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_path: Option<String>,

    /// Tried after `java_path`, before the built-in locations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_java_paths: Vec<String>,

    /// Appended to every java invocation
    #[serde(default)]
    pub jvm_options: String,

    /// Remote directory holding the payload
    pub working_directory: String,

    /// Local agent payload
    pub payload: PathBuf,

    /// Payload file name on the remote host
    #[serde(default = "default_payload_name")]
    pub payload_name: String,

    /// Log the remote environment before probing
    #[serde(default = "default_true")]
    pub report_environment: bool,

    /// Template with `{platform}` and `{cpu}` placeholders; no install fallback when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jdk_bundle_url: Option<String>,

    /// Local directory scanned for default key files (default `~/.ssh`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_dir: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive interval in seconds (0 = disabled)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_payload_name() -> String {
    DEFAULT_PAYLOAD_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    30
}

impl LauncherConfig {
    pub fn new(
        host: impl Into<String>,
        working_directory: impl Into<String>,
        payload: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            private_key: None,
            passphrase: None,
            java_path: None,
            extra_java_paths: Vec::new(),
            jvm_options: String::new(),
            working_directory: working_directory.into(),
            payload: payload.into(),
            payload_name: default_payload_name(),
            report_environment: true,
            jdk_bundle_url: None,
            key_dir: None,
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.working_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "working_directory must not be empty".into(),
            ));
        }
        if self.payload.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("payload must not be empty".into()));
        }
        if self.payload_name.is_empty() || self.payload_name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "payload_name {:?} must be a plain file name",
                self.payload_name
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be positive".into(),
            ));
        }
        if let Some(url) = &self.jdk_bundle_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "jdk_bundle_url {} is not an http(s) URL",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn target(&self) -> RemoteTarget {
        let target = RemoteTarget::new(self.host.trim(), self.port);
        match self.java_path.as_deref().map(str::trim) {
            Some(java) if !java.is_empty() => target.with_java_path(java),
            _ => target,
        }
    }

    /// Resolves every secret; fails when an environment variable is missing.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        Ok(Credentials {
            username: self.username.clone(),
            password: self.password.as_ref().map(SecretValue::resolve).transpose()?,
            private_key: self.private_key.clone(),
            passphrase: self
                .passphrase
                .as_ref()
                .map(SecretValue::resolve)
                .transpose()?,
        })
    }

    pub fn to_launch_config(&self) -> Result<LaunchConfig, ConfigError> {
        self.validate()?;
        Ok(
            LaunchConfig::new(self.target(), self.credentials()?, &self.working_directory)
                .with_runtime_options(self.jvm_options.trim())
                .with_environment_report(self.report_environment),
        )
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keep_alive_interval: (self.keep_alive_secs > 0)
                .then(|| Duration::from_secs(self.keep_alive_secs)),
            host_key_policy: self.host_key_policy,
        }
    }

    /// Explicit path, then `extra_java_paths`, then the built-in locations.
    pub fn runtime_locator(&self) -> RuntimeLocator {
        RuntimeLocator::new(vec![
            Arc::new(ExplicitRuntimeProvider),
            Arc::new(ListRuntimeProvider(self.extra_java_paths.clone())),
            Arc::new(DefaultRuntimeProvider),
        ])
    }

    pub fn installer(&self) -> Arc<dyn RuntimeInstaller> {
        match &self.jdk_bundle_url {
            Some(url) => Arc::new(BundleInstaller::new(Arc::new(HttpBundleSource::new(
                url.as_str(),
            )))),
            None => Arc::new(BundleInstaller::disabled()),
        }
    }

    pub fn key_dir(&self) -> Option<PathBuf> {
        self.key_dir.clone().or_else(Authenticator::default_key_dir)
    }

    /// A launcher talking real SSH, wired from this configuration.
    pub fn launcher(&self) -> SshLauncher {
        let payload = FilePayload::new(&self.payload).with_file_name(self.payload_name.as_str());
        SshLauncher::new(
            Arc::new(SshConnector::new(self.ssh_settings())),
            Arc::new(payload),
        )
        .with_locator(self.runtime_locator())
        .with_installer(self.installer())
        .with_key_dir(self.key_dir())
    }
}
