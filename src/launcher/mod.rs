//! SSH Launcher
//!
//! Orchestrates one launch attempt:
//!
//! 1. Connect and authenticate
//! 2. Run `true` to make sure the login shell prints nothing
//! 3. Dump the remote environment (`set`) to the launch log
//! 4. Find a compatible Java, installing one as a last resort
//! 5. Copy the agent payload into the working directory
//! 6. Start the agent and hand it to a supervisor task
//!
//! Stages run strictly in order. A failing stage is logged, the partial
//! cleanup runs and the error is returned; nothing is retried here.

mod error;
mod listener;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{self, supervise, AgentHandle, AgentRegistry, PayloadSource, Teardown};
use crate::runtime::{
    probe, BundleInstaller, InstallError, RuntimeInstaller, RuntimeLocator,
};
use crate::session::{LaunchState, LaunchStateMachine};
use crate::ssh::{Authenticator, Connector, Credentials, RemoteProcess, RemoteTarget, Transport};

pub use error::{LaunchError, TransferError};
pub use listener::{LaunchListener, LogLevel, MemoryListener, Progress, StderrListener};

/// Everything needed for one launch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub target: RemoteTarget,
    pub credentials: Credentials,
    /// Extra options for the Java command line
    pub runtime_options: String,
    /// Remote directory for the payload and an installed JDK
    pub working_directory: String,
    /// Log the output of `set` before probing
    pub report_environment: bool,
}

impl LaunchConfig {
    pub fn new(
        target: RemoteTarget,
        credentials: Credentials,
        working_directory: impl AsRef<str>,
    ) -> Self {
        Self {
            target,
            credentials,
            runtime_options: String::new(),
            working_directory: normalize_working_directory(working_directory.as_ref()),
            report_environment: true,
        }
    }

    pub fn with_runtime_options(mut self, options: impl Into<String>) -> Self {
        self.runtime_options = options.into();
        self
    }

    pub fn with_environment_report(mut self, enabled: bool) -> Self {
        self.report_environment = enabled;
        self
    }
}

/// Strip trailing slashes; `/` stays `/`.
fn normalize_working_directory(dir: &str) -> String {
    let dir = dir.trim();
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() && dir.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Launches agents over SSH.
pub struct SshLauncher {
    connector: Arc<dyn Connector>,
    payload: Arc<dyn PayloadSource>,
    locator: RuntimeLocator,
    installer: Arc<dyn RuntimeInstaller>,
    authenticator: Authenticator,
    registry: Arc<AgentRegistry>,
}

impl SshLauncher {
    pub fn new(connector: Arc<dyn Connector>, payload: Arc<dyn PayloadSource>) -> Self {
        Self {
            connector,
            payload,
            locator: RuntimeLocator::default(),
            installer: Arc::new(BundleInstaller::disabled()),
            authenticator: Authenticator::new(Authenticator::default_key_dir()),
            registry: Arc::new(AgentRegistry::new()),
        }
    }

    pub fn with_locator(mut self, locator: RuntimeLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn RuntimeInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Directory scanned for conventional key files (`None` disables discovery).
    pub fn with_key_dir(mut self, key_dir: Option<PathBuf>) -> Self {
        self.authenticator = Authenticator::new(key_dir);
        self
    }

    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn launch(
        &self,
        config: &LaunchConfig,
        listener: Arc<dyn LaunchListener>,
    ) -> Result<AgentHandle, LaunchError> {
        self.launch_with_interrupt(config, listener, &CancellationToken::new())
            .await
    }

    /// Like [`launch`](Self::launch); cancelling `interrupt` aborts whichever
    /// stage is running with [`LaunchError::Interrupted`].
    pub async fn launch_with_interrupt(
        &self,
        config: &LaunchConfig,
        listener: Arc<dyn LaunchListener>,
        interrupt: &CancellationToken,
    ) -> Result<AgentHandle, LaunchError> {
        let progress = Progress::new(listener);
        let mut state = LaunchStateMachine::new();
        let target = &config.target;

        progress.info(format!("Opening SSH connection to {}.", target.address()));
        let connected = interruptible(interrupt, state.state(), self.connector.connect(target))
            .await
            .and_then(|connected| {
                connected.map_err(|source| LaunchError::Connect {
                    host: target.host.clone(),
                    port: target.port,
                    source,
                })
            });

        let mut transport = match connected {
            Ok(transport) => transport,
            Err(err) => {
                report_failure(&progress, state.state(), target, &err);
                if let Err(e) = state
                    .start_disconnecting(Some(err.to_string()))
                    .and_then(|()| state.close())
                {
                    debug!("[ssh-launch] {}", e);
                }
                progress.info("Connection closed.");
                return Err(err);
            }
        };

        let mut payload_path = None;
        let started = self
            .run_stages(
                transport.as_mut(),
                &mut state,
                config,
                &progress,
                interrupt,
                &mut payload_path,
            )
            .await;

        let teardown = Teardown {
            transport,
            payload_path,
            progress,
            state,
            registration: None,
        };

        match started {
            Ok(process) => Ok(supervise(
                process,
                teardown,
                target.host.clone(),
                Some(self.registry.clone()),
            )),
            Err(err) => {
                report_failure(&teardown.progress, teardown.state.state(), target, &err);
                teardown.run(Some(err.to_string())).await;
                Err(err)
            }
        }
    }

    /// Authenticate through start; `payload_path` is set once the transfer completed.
    async fn run_stages(
        &self,
        transport: &mut dyn Transport,
        state: &mut LaunchStateMachine,
        config: &LaunchConfig,
        progress: &Progress,
        interrupt: &CancellationToken,
        payload_path: &mut Option<String>,
    ) -> Result<RemoteProcess, LaunchError> {
        let target = &config.target;
        let wd = config.working_directory.as_str();

        state.advance(LaunchState::Authenticating)?;
        let authenticated = interruptible(
            interrupt,
            state.state(),
            self.authenticator
                .authenticate(transport, &config.credentials, progress),
        )
        .await?
        .map_err(|source| LaunchError::Connect {
            host: target.host.clone(),
            port: target.port,
            source,
        })?;
        if !authenticated {
            return Err(LaunchError::AuthenticationFailed {
                user: config.credentials.effective_username(),
                host: target.host.clone(),
            });
        }
        progress.info("Authentication successful.");

        state.advance(LaunchState::LocatingRuntime)?;
        self.verify_no_header_junk(transport, state.state(), progress, interrupt)
            .await?;
        if config.report_environment {
            self.report_environment(transport, state.state(), progress, interrupt)
                .await?;
        }
        let java = self
            .locate_runtime(transport, state.state(), config, progress, interrupt)
            .await?;

        state.advance(LaunchState::Transferring)?;
        let path = interruptible(
            interrupt,
            state.state(),
            agent::transfer(transport, wd, self.payload.as_ref(), progress),
        )
        .await??;
        *payload_path = Some(path);

        state.advance(LaunchState::Starting)?;
        let command = agent::command_line(
            wd,
            &java,
            &config.runtime_options,
            self.payload.file_name(),
        );
        progress.info(format!("Starting slave process: {}", command));
        let process = interruptible(interrupt, state.state(), transport.spawn(&command))
            .await?
            .map_err(|e| LaunchError::ProcessStartFailed(e.to_string()))?;

        state.advance(LaunchState::Running)?;
        Ok(process)
    }

    /// Any output of `true` means the login scripts print something, which
    /// would corrupt the agent stream.
    async fn verify_no_header_junk(
        &self,
        transport: &mut dyn Transport,
        stage: LaunchState,
        progress: &Progress,
        interrupt: &CancellationToken,
    ) -> Result<(), LaunchError> {
        let output = interruptible(interrupt, stage, transport.exec("true"))
            .await?
            .map_err(|source| LaunchError::Remote {
                command: "true".to_string(),
                source,
            })?;
        if output.is_empty() {
            return Ok(());
        }

        let junk = output.combined();
        progress.output(&junk);
        Err(LaunchError::TransportContaminated { output: junk })
    }

    async fn report_environment(
        &self,
        transport: &mut dyn Transport,
        stage: LaunchState,
        progress: &Progress,
        interrupt: &CancellationToken,
    ) -> Result<(), LaunchError> {
        let output = interruptible(interrupt, stage, transport.exec("set"))
            .await?
            .map_err(|source| LaunchError::Remote {
                command: "set".to_string(),
                source,
            })?;
        progress.output(&output.combined());
        Ok(())
    }

    async fn locate_runtime(
        &self,
        transport: &mut dyn Transport,
        stage: LaunchState,
        config: &LaunchConfig,
        progress: &Progress,
        interrupt: &CancellationToken,
    ) -> Result<String, LaunchError> {
        let wd = config.working_directory.as_str();
        let options = config.runtime_options.as_str();

        let unqualified = match interruptible(
            interrupt,
            stage,
            self.locator
                .locate(transport, &config.target, wd, options, progress),
        )
        .await?
        {
            Ok(found) => return Ok(found.path),
            Err(unqualified) => unqualified,
        };

        let mut tried = unqualified.paths();
        progress.info(format!(
            "No supported java found in {:?}, trying to install a JDK",
            tried
        ));

        let java = match interruptible(interrupt, stage, self.installer.install(transport, wd, progress))
            .await?
        {
            Ok(java) => java,
            Err(InstallError::UnknownEnvironment(uname)) => {
                return Err(LaunchError::UnknownEnvironment { uname })
            }
            Err(e) => {
                return Err(LaunchError::NoCompatibleRuntime {
                    tried,
                    cause: e.to_string(),
                })
            }
        };

        let installed = interruptible(interrupt, stage, probe(transport, &java, options, progress)).await?;
        if installed.is_compatible() {
            Ok(installed.path)
        } else {
            let cause = format!("installed runtime {} reported {}", java, installed.outcome);
            tried.push(java);
            Err(LaunchError::NoCompatibleRuntime { tried, cause })
        }
    }
}

fn report_failure(progress: &Progress, stage: LaunchState, target: &RemoteTarget, err: &LaunchError) {
    progress.error(format!(
        "Launch on {} failed while {}: {}",
        target.address(),
        stage,
        err
    ));
}

/// Run `fut` unless `interrupt` fires first.
async fn interruptible<F: Future>(
    interrupt: &CancellationToken,
    stage: LaunchState,
    fut: F,
) -> Result<F::Output, LaunchError> {
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => Err(LaunchError::Interrupted { stage }),
        output = fut => Ok(output),
    }
}
