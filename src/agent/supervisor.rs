//! Process Supervisor and Disconnection Handler
//!
//! Once the agent process is up the launch hands everything it owns to a
//! supervisor task:
//!
//! ```text
//!   remote stdout ──────────────────────────────▸ AgentChannel::inbound
//!   AgentChannel::outbound ─────────────────────▸ remote stdin
//!   remote stderr ──▸ stderr copier task ───────▸ listener + tracing
//!
//!   supervisor task: waits for (process exit | disconnect request)
//!                    └─▸ Teardown::run (exactly once)
//! ```
//!
//! [`AgentHandle::closed`] resolves after the teardown has finished.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::AgentRegistry;
use crate::launcher::Progress;
use crate::session::{LaunchState, LaunchStateMachine};
use crate::sftp::SftpError;
use crate::ssh::{sh_quote, BoxedReader, BoxedWriter, ProcessExit, RemoteProcess, Transport};

/// How long a terminated process gets to report its exit.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long the stderr copier may keep draining after the process ended.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// `cd '<wd>' && <java>[ <options>] -jar <payload>`
pub fn command_line(working_directory: &str, java: &str, options: &str, payload: &str) -> String {
    let options = options.trim();
    let mut command = format!("cd {} && {}", sh_quote(working_directory), java);
    if !options.is_empty() {
        command.push(' ');
        command.push_str(options);
    }
    command.push_str(" -jar ");
    command.push_str(payload);
    command
}

/// Why the agent connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The owner asked for the shutdown
    Requested,
    /// The remote process ended on its own
    RemoteExit(Option<u32>),
    /// The channel or the connection broke
    ChannelFailure(String),
}

impl DisconnectCause {
    /// Whether the end is worth an error line.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Requested | Self::RemoteExit(Some(0)))
    }

    fn from_exit(exit: Result<ProcessExit, oneshot::error::RecvError>) -> Self {
        match exit {
            Ok(ProcessExit { error: Some(e), .. }) => Self::ChannelFailure(e),
            Ok(ProcessExit { status, error: None }) => Self::RemoteExit(status),
            Err(_) => Self::ChannelFailure("channel pump stopped".to_string()),
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::RemoteExit(Some(status)) => write!(f, "agent exited with status {}", status),
            Self::RemoteExit(None) => write!(f, "channel closed without an exit status"),
            Self::ChannelFailure(message) => write!(f, "{}", message),
        }
    }
}

/// The agent's message streams.
pub struct AgentChannel {
    /// Remote stdout
    pub inbound: BoxedReader,
    /// Remote stdin
    pub outbound: BoxedWriter,
}

/// Cleanup run once when a launch ends, successfully started or not.
pub(crate) struct Teardown {
    pub transport: Box<dyn Transport>,
    /// Set once the payload transfer completed
    pub payload_path: Option<String>,
    pub progress: Progress,
    pub state: LaunchStateMachine,
    pub registration: Option<(Arc<AgentRegistry>, Uuid)>,
}

impl Teardown {
    pub async fn run(mut self, failure: Option<String>) {
        if let Err(e) = self.state.start_disconnecting(failure) {
            debug!("[ssh-launch] {}", e);
        }

        if let Some(path) = self.payload_path.take() {
            if let Err(e) = remove_payload(self.transport.as_mut(), &path).await {
                // Best effort only
                warn!("[ssh-launch] Failed to remove {}: {}", path, e);
                self.progress.info(format!("Failed to remove {}: {}", path, e));
            }
        }

        self.transport.close().await;

        if let Some((registry, id)) = self.registration.take() {
            registry.unregister(id);
        }

        if let Err(e) = self.state.close() {
            debug!("[ssh-launch] {}", e);
        }
        self.progress.info("Connection closed.");
    }
}

async fn remove_payload(transport: &mut dyn Transport, path: &str) -> Result<(), SftpError> {
    if transport.is_closed() {
        return Err(SftpError::ProtocolError("connection already closed".to_string()));
    }
    let mut fs = transport
        .open_sftp()
        .await
        .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;
    let result = match fs.remove_file(path).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    };
    fs.close().await;
    result
}

/// Cloneable control side of a running agent.
#[derive(Clone)]
pub struct AgentControl {
    id: Uuid,
    host: String,
    disconnect_tx: mpsc::Sender<()>,
    closed_rx: watch::Receiver<Option<DisconnectCause>>,
    state_rx: watch::Receiver<LaunchState>,
}

impl AgentControl {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> LaunchState {
        *self.state_rx.borrow()
    }

    /// Watch the launch state.
    pub fn subscribe(&self) -> watch::Receiver<LaunchState> {
        self.state_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// Request a shutdown and wait until the teardown finished.
    ///
    /// Calling it on an agent that is already gone just returns the
    /// first cause.
    pub async fn disconnect(&self) -> DisconnectCause {
        // Full means a request is already pending
        let _ = self.disconnect_tx.try_send(());
        self.closed().await
    }

    /// Wait until the agent connection is gone.
    pub async fn closed(&self) -> DisconnectCause {
        let mut rx = self.closed_rx.clone();
        let cause = rx.wait_for(Option::is_some).await.map(|c| c.clone());
        match cause {
            Ok(Some(cause)) => cause,
            _ => DisconnectCause::ChannelFailure("supervisor stopped".to_string()),
        }
    }
}

/// A started agent.
pub struct AgentHandle {
    channel: Option<AgentChannel>,
    control: AgentControl,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.control.id)
            .field("host", &self.control.host)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn host(&self) -> &str {
        &self.control.host
    }

    pub fn state(&self) -> LaunchState {
        self.control.state()
    }

    /// The message streams; `None` once taken.
    pub fn take_channel(&mut self) -> Option<AgentChannel> {
        self.channel.take()
    }

    pub fn control(&self) -> AgentControl {
        self.control.clone()
    }

    pub async fn disconnect(&self) -> DisconnectCause {
        self.control.disconnect().await
    }

    pub async fn closed(&self) -> DisconnectCause {
        self.control.closed().await
    }
}

/// Hand a started process over to a supervisor task.
///
/// The agent is registered before the task starts, so a process that dies
/// right away is still deregistered by its teardown.
pub(crate) fn supervise(
    process: RemoteProcess,
    mut teardown: Teardown,
    host: String,
    registry: Option<Arc<AgentRegistry>>,
) -> AgentHandle {
    let id = Uuid::new_v4();
    let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
    let (closed_tx, closed_rx) = watch::channel(None);

    let control = AgentControl {
        id,
        host: host.clone(),
        disconnect_tx,
        closed_rx,
        state_rx: teardown.state.subscribe(),
    };

    if let Some(registry) = registry {
        registry.register(control.clone());
        teardown.registration = Some((registry, id));
    }

    let RemoteProcess {
        stdout,
        stdin,
        stderr,
        exited,
        terminate,
    } = process;

    let copier = tokio::spawn(copy_stderr(stderr, teardown.progress.clone()));
    tokio::spawn(run_supervisor(
        id,
        exited,
        terminate,
        disconnect_rx,
        copier,
        teardown,
        closed_tx,
    ));

    AgentHandle {
        channel: Some(AgentChannel {
            inbound: stdout,
            outbound: stdin,
        }),
        control,
    }
}

async fn run_supervisor(
    id: Uuid,
    mut exited: oneshot::Receiver<ProcessExit>,
    terminate: oneshot::Sender<()>,
    mut disconnect_rx: mpsc::Receiver<()>,
    mut copier: JoinHandle<()>,
    teardown: Teardown,
    closed_tx: watch::Sender<Option<DisconnectCause>>,
) {
    let cause = tokio::select! {
        exit = &mut exited => DisconnectCause::from_exit(exit),
        // A dropped last control counts as a request too
        _ = disconnect_rx.recv() => {
            info!("[ssh-launch] Disconnect requested for agent {}", id);
            let _ = terminate.send(());
            if tokio::time::timeout(TERMINATE_GRACE, &mut exited).await.is_err() {
                warn!("[ssh-launch] Agent {} did not exit within {:?}", id, TERMINATE_GRACE);
            }
            DisconnectCause::Requested
        }
    };

    if tokio::time::timeout(STDERR_DRAIN, &mut copier).await.is_err() {
        copier.abort();
    }

    let failure = if cause.is_failure() {
        let message = format!("remote agent terminated unexpectedly: {}", cause);
        teardown.progress.error(&message);
        Some(message)
    } else {
        teardown.progress.info(format!("Agent channel closed: {}", cause));
        None
    };

    teardown.run(failure).await;
    closed_tx.send_replace(Some(cause));
}

/// Forward remote stderr line by line until it closes.
async fn copy_stderr(stderr: BoxedReader, progress: Progress) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                info!("[agent-stderr] {}", text);
                progress.output(text);
            }
            Err(e) => {
                debug!("[agent-stderr] stream ended: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LogLevel, MemoryListener};
    use crate::ssh::mock::{MockCall, MockProcess, MockRemote};
    use crate::ssh::{Connector, RemoteTarget};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn running_agent(
        remote: &MockRemote,
        registry: Option<Arc<AgentRegistry>>,
    ) -> (AgentHandle, MockProcess, Arc<MemoryListener>) {
        let mut transport = remote.connect(&RemoteTarget::new("build-01", 22)).await.unwrap();
        let process = transport.spawn("java -jar slave.jar").await.unwrap();
        let listener = MemoryListener::new();

        let mut state = LaunchStateMachine::new();
        for to in [
            LaunchState::Authenticating,
            LaunchState::LocatingRuntime,
            LaunchState::Transferring,
            LaunchState::Starting,
            LaunchState::Running,
        ] {
            state.advance(to).unwrap();
        }

        let teardown = Teardown {
            transport,
            payload_path: Some("/srv/agent/slave.jar".to_string()),
            progress: Progress::new(listener.clone()),
            state,
            registration: None,
        };
        let handle = supervise(process, teardown, "build-01".to_string(), registry);
        let remote_end = remote.take_process().unwrap();
        (handle, remote_end, listener)
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("/srv/agent", "java", "", "slave.jar"),
            "cd '/srv/agent' && java -jar slave.jar"
        );
        assert_eq!(
            command_line("/srv/my agent", "/usr/bin/java", "-Xmx512m -server", "slave.jar"),
            "cd '/srv/my agent' && /usr/bin/java -Xmx512m -server -jar slave.jar"
        );
    }

    #[test]
    fn test_cause_severity() {
        assert!(!DisconnectCause::Requested.is_failure());
        assert!(!DisconnectCause::RemoteExit(Some(0)).is_failure());
        assert!(DisconnectCause::RemoteExit(Some(1)).is_failure());
        assert!(DisconnectCause::RemoteExit(None).is_failure());
        assert!(DisconnectCause::ChannelFailure("reset".into()).is_failure());
    }

    #[tokio::test]
    async fn test_requested_disconnect_tears_down_quietly() {
        let remote = MockRemote::builder()
            .dir("/srv/agent")
            .file("/srv/agent/slave.jar", b"jar")
            .build();
        let (handle, remote_end, listener) = running_agent(&remote, None).await;
        drop(remote_end);

        assert_eq!(handle.disconnect().await, DisconnectCause::Requested);
        assert_eq!(handle.state(), LaunchState::Closed);
        assert!(listener.errors().is_empty());
        assert!(listener.contains("Connection closed."));

        // Channel first, then payload, then the connection
        let calls = remote.calls();
        let position = |call: &MockCall| calls.iter().position(|c| c == call).unwrap();
        let terminate = position(&MockCall::Terminate);
        let remove = position(&MockCall::Remove("/srv/agent/slave.jar".into()));
        let close = position(&MockCall::Close);
        assert!(terminate < remove && remove < close);
        assert!(remote.file("/srv/agent/slave.jar").is_none());
    }

    #[tokio::test]
    async fn test_crash_is_reported_as_error() {
        let remote = MockRemote::builder().build();
        let (handle, remote_end, listener) = running_agent(&remote, None).await;

        remote_end.exit(Some(1));
        assert_eq!(handle.closed().await, DisconnectCause::RemoteExit(Some(1)));

        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("remote agent terminated unexpectedly: agent exited with status 1"));
        // A missing payload does not escalate
        assert!(listener.contains("Connection closed."));
        assert!(remote.calls().contains(&MockCall::Close));
    }

    #[tokio::test]
    async fn test_channel_failure_cause_is_logged() {
        let remote = MockRemote::builder().build();
        let (handle, remote_end, listener) = running_agent(&remote, None).await;

        remote_end.fail("connection reset by peer");
        assert_eq!(
            handle.closed().await,
            DisconnectCause::ChannelFailure("connection reset by peer".into())
        );
        assert!(listener.errors()[0].contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_an_error() {
        let remote = MockRemote::builder().build();
        let (handle, remote_end, listener) = running_agent(&remote, None).await;

        remote_end.exit(Some(0));
        assert_eq!(handle.closed().await, DisconnectCause::RemoteExit(Some(0)));
        assert!(listener.errors().is_empty());
    }

    #[tokio::test]
    async fn test_stderr_is_forwarded() {
        let remote = MockRemote::builder().build();
        let (handle, mut remote_end, listener) = running_agent(&remote, None).await;

        remote_end.stderr.write_all(b"Slave.jar starting\nwarning: low memory\n").await.unwrap();
        remote_end.stderr.flush().await.unwrap();
        remote_end.exit(Some(0));
        handle.closed().await;

        let lines: Vec<_> = listener
            .lines()
            .into_iter()
            .filter(|(level, _)| *level == LogLevel::Info)
            .map(|(_, line)| line)
            .collect();
        assert!(lines.contains(&"Slave.jar starting".to_string()));
        assert!(lines.contains(&"warning: low memory".to_string()));
    }

    #[tokio::test]
    async fn test_channel_bridges_both_ways() {
        let remote = MockRemote::builder().build();
        let (mut handle, mut remote_end, _listener) = running_agent(&remote, None).await;
        let mut channel = handle.take_channel().unwrap();
        assert!(handle.take_channel().is_none());

        channel.outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_end.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_end.stdout.write_all(b"pong").await.unwrap();
        channel.inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        remote_end.exit(Some(0));
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_registry_tracks_agent() {
        let remote = MockRemote::builder().build();
        let registry = Arc::new(AgentRegistry::new());
        let (handle, remote_end, _listener) = running_agent(&remote, Some(registry.clone())).await;

        assert_eq!(registry.count(), 1);
        let info = &registry.list()[0];
        assert_eq!(info.id, handle.id());
        assert_eq!(info.host, "build-01");
        assert_eq!(info.state, LaunchState::Running);

        remote_end.exit(Some(0));
        handle.closed().await;
        assert_eq!(registry.count(), 0);
        assert!(registry.get(handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let remote = MockRemote::builder().build();
        let registry = Arc::new(AgentRegistry::new());
        let (first, first_end, _) = running_agent(&remote, Some(registry.clone())).await;
        let (second, second_end, _) = running_agent(&remote, Some(registry.clone())).await;
        drop((first_end, second_end));

        let closed = registry.close_all().await;
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|(_, cause)| *cause == DisconnectCause::Requested));
        assert_eq!(registry.count(), 0);
        assert!(first.control().is_closed());
        assert!(second.control().is_closed());
    }
}
