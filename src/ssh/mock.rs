//! In-memory [`Connector`] / [`Transport`] for tests
//!
//! A [`MockRemote`] plays a whole remote host: it checks credentials, answers
//! commands through a responder closure, keeps an in-memory filesystem for
//! SFTP and hands spawned processes to the test through [`MockRemote::take_process`].
//! Every operation is recorded as a [`MockCall`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::oneshot;

use super::{
    BoxedWriter, Connector, ExecOutput, KeyMaterial, ProcessExit, RemoteProcess, RemoteTarget,
    Transport, TransportError,
};
use crate::sftp::{FileKind, RemoteFs, SftpError};

type Responder = Arc<dyn Fn(&str) -> Result<ExecOutput, TransportError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect(String),
    AuthPublicKey { user: String, key: PathBuf },
    AuthPassword { user: String },
    Exec(String),
    OpenSftp,
    Stat(String),
    Mkdir(String, u32),
    Remove(String),
    Create(String),
    Chmod(String, u32),
    Spawn(String),
    Terminate,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    files: HashMap<String, MockFile>,
    dirs: HashMap<String, u32>,
    processes: VecDeque<MockProcess>,
}

struct Inner {
    password: Option<String>,
    accepted_keys: Vec<PathBuf>,
    responder: Responder,
    fail_connect: bool,
    fail_spawn: bool,
    state: Mutex<MockState>,
}

/// The remote end of a spawned process.
pub struct MockProcess {
    pub command: String,
    /// Bytes written here arrive on the agent's inbound stream
    pub stdout: DuplexStream,
    /// Reads what the controller sent to the agent
    pub stdin: DuplexStream,
    pub stderr: DuplexStream,
    exit_tx: oneshot::Sender<ProcessExit>,
}

impl MockProcess {
    /// End the process with `status`, closing its streams.
    pub fn exit(self, status: Option<u32>) {
        let _ = self.exit_tx.send(ProcessExit { status, error: None });
    }

    /// End the process as if the channel broke.
    pub fn fail(self, error: &str) {
        let _ = self.exit_tx.send(ProcessExit {
            status: None,
            error: Some(error.to_string()),
        });
    }
}

#[derive(Clone)]
pub struct MockRemote {
    inner: Arc<Inner>,
}

pub struct MockRemoteBuilder {
    password: Option<String>,
    accepted_keys: Vec<PathBuf>,
    responder: Responder,
    fail_connect: bool,
    fail_spawn: bool,
    state: MockState,
}

impl MockRemote {
    pub fn builder() -> MockRemoteBuilder {
        let mut state = MockState::default();
        state.dirs.insert("/".to_string(), 0o755);
        MockRemoteBuilder {
            password: None,
            accepted_keys: Vec::new(),
            responder: Arc::new(default_response),
            fail_connect: false,
            fail_spawn: false,
            state,
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.state.lock().calls.clone()
    }

    pub fn execs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Exec(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.inner.state.lock().files.get(path).cloned()
    }

    pub fn dir_mode(&self, path: &str) -> Option<u32> {
        self.inner.state.lock().dirs.get(path).copied()
    }

    /// Oldest spawned process not yet taken.
    pub fn take_process(&self) -> Option<MockProcess> {
        self.inner.state.lock().processes.pop_front()
    }

    fn record(&self, call: MockCall) {
        self.inner.state.lock().calls.push(call);
    }
}

impl MockRemoteBuilder {
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn accept_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.accepted_keys.push(path.into());
        self
    }

    /// Answer `exec` calls; unmatched commands can fall back to [`default_response`].
    pub fn responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Result<ExecOutput, TransportError> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.state.dirs.insert(path.to_string(), 0o755);
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.state.files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
        self
    }

    pub fn build(self) -> MockRemote {
        MockRemote {
            inner: Arc::new(Inner {
                password: self.password,
                accepted_keys: self.accepted_keys,
                responder: self.responder,
                fail_connect: self.fail_connect,
                fail_spawn: self.fail_spawn,
                state: Mutex::new(self.state),
            }),
        }
    }
}

/// Answers of a healthy Linux host with Java 6.
pub fn default_response(command: &str) -> Result<ExecOutput, TransportError> {
    let output = match command {
        "true" => ExecOutput::ok(""),
        "set" => ExecOutput::ok("HOME=/home/hudson\nPATH=/usr/bin:/bin\n"),
        "uname -a" => ExecOutput::ok(
            "Linux build-01 5.15.0-91-generic #101-Ubuntu SMP x86_64 x86_64 x86_64 GNU/Linux\n",
        ),
        cmd if cmd.ends_with("-version") => ExecOutput::ok("").with_stderr(
            "java version \"1.6.0_45\"\nJava(TM) SE Runtime Environment (build 1.6.0_45-b06)\n",
        ),
        _ => ExecOutput::ok(""),
    };
    Ok(output)
}

#[async_trait]
impl Connector for MockRemote {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Transport>, TransportError> {
        self.record(MockCall::Connect(target.address()));
        if self.inner.fail_connect {
            return Err(TransportError::Connect {
                addr: target.address(),
                message: "Connection refused".into(),
            });
        }
        Ok(Box::new(MockTransport {
            remote: self.clone(),
            closed: false,
        }))
    }
}

pub struct MockTransport {
    remote: MockRemote,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn auth_publickey(&mut self, user: &str, key: &KeyMaterial) -> Result<bool, TransportError> {
        self.remote.record(MockCall::AuthPublicKey {
            user: user.to_string(),
            key: key.source.clone(),
        });
        Ok(self.remote.inner.accepted_keys.contains(&key.source))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<bool, TransportError> {
        self.remote.record(MockCall::AuthPassword {
            user: user.to_string(),
        });
        Ok(self.remote.inner.password.as_deref() == Some(password))
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.remote.record(MockCall::Exec(command.to_string()));
        (self.remote.inner.responder)(command)
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>, TransportError> {
        self.remote.record(MockCall::OpenSftp);
        Ok(Box::new(MockFs {
            remote: self.remote.clone(),
        }))
    }

    async fn spawn(&mut self, command: &str) -> Result<RemoteProcess, TransportError> {
        self.remote.record(MockCall::Spawn(command.to_string()));
        if self.remote.inner.fail_spawn {
            return Err(TransportError::Ssh("exec request refused".into()));
        }

        let (stdout_local, stdout_remote) = tokio::io::duplex(64 * 1024);
        let (stdin_local, stdin_remote) = tokio::io::duplex(64 * 1024);
        let (stderr_local, stderr_remote) = tokio::io::duplex(64 * 1024);
        let (exited_tx, exited_rx) = oneshot::channel();
        let (terminate_tx, terminate_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();

        let remote = self.remote.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = terminate_rx => {
                    remote.record(MockCall::Terminate);
                    ProcessExit::default()
                }
                Ok(exit) = exit_rx => exit,
            };
            let _ = exited_tx.send(exit);
        });

        self.remote.inner.state.lock().processes.push_back(MockProcess {
            command: command.to_string(),
            stdout: stdout_remote,
            stdin: stdin_remote,
            stderr: stderr_remote,
            exit_tx,
        });

        Ok(RemoteProcess {
            stdout: Box::new(stdout_local),
            stdin: Box::new(stdin_local),
            stderr: Box::new(stderr_local),
            exited: exited_rx,
            terminate: terminate_tx,
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.remote.record(MockCall::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct MockFs {
    remote: MockRemote,
}

#[async_trait]
impl RemoteFs for MockFs {
    async fn stat(&mut self, path: &str) -> Result<Option<FileKind>, SftpError> {
        self.remote.record(MockCall::Stat(path.to_string()));
        let state = self.remote.inner.state.lock();
        if state.dirs.contains_key(path) {
            Ok(Some(FileKind::Directory))
        } else if state.files.contains_key(path) {
            Ok(Some(FileKind::File))
        } else {
            Ok(None)
        }
    }

    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        self.remote.record(MockCall::Mkdir(path.to_string(), mode));
        let mut state = self.remote.inner.state.lock();
        if state.dirs.contains_key(path) || state.files.contains_key(path) {
            return Err(SftpError::ProtocolError(format!("{} already exists", path)));
        }
        state.dirs.insert(path.to_string(), mode);
        Ok(())
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpError> {
        self.remote.record(MockCall::Remove(path.to_string()));
        match self.remote.inner.state.lock().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn create(&mut self, path: &str) -> Result<BoxedWriter, SftpError> {
        self.remote.record(MockCall::Create(path.to_string()));
        self.remote.inner.state.lock().files.insert(
            path.to_string(),
            MockFile {
                data: Vec::new(),
                mode: 0o644,
            },
        );
        Ok(Box::new(MockWriter {
            remote: self.remote.clone(),
            path: path.to_string(),
        }))
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        self.remote.record(MockCall::Chmod(path.to_string(), mode));
        let mut state = self.remote.inner.state.lock();
        if let Some(file) = state.files.get_mut(path) {
            file.mode = mode;
            Ok(())
        } else if let Some(dir) = state.dirs.get_mut(path) {
            *dir = mode;
            Ok(())
        } else {
            Err(SftpError::FileNotFound(path.to_string()))
        }
    }

    async fn close(&mut self) {}
}

struct MockWriter {
    remote: MockRemote,
    path: String,
}

impl AsyncWrite for MockWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.remote.inner.state.lock();
        match state.files.get_mut(&self.path) {
            Some(file) => {
                file.data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} was removed", self.path),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mkdirs_creates_missing_parents() {
        let remote = MockRemote::builder().dir("/srv").build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let mut fs = transport.open_sftp().await.unwrap();

        fs.mkdirs("/srv/agent/work", 0o700).await.unwrap();
        assert_eq!(remote.dir_mode("/srv"), Some(0o755));
        assert_eq!(remote.dir_mode("/srv/agent"), Some(0o700));
        assert_eq!(remote.dir_mode("/srv/agent/work"), Some(0o700));
    }

    #[tokio::test]
    async fn test_mkdirs_rejects_file_component() {
        let remote = MockRemote::builder().file("/srv", b"x").build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let mut fs = transport.open_sftp().await.unwrap();

        let err = fs.mkdirs("/srv/agent", 0o700).await.unwrap_err();
        assert!(matches!(err, SftpError::InvalidPath(p) if p == "/srv"));
    }

    #[tokio::test]
    async fn test_terminate_resolves_exit() {
        let remote = MockRemote::builder().build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let process = transport.spawn("java -jar slave.jar").await.unwrap();

        drop(process.terminate);
        let exit = process.exited.await.unwrap();
        assert_eq!(exit, ProcessExit::default());
        assert!(remote.calls().contains(&MockCall::Terminate));
    }
}
