//! Agent Transport: raw stdio bridge over an SSH exec channel
//!
//! Runs the agent command on its own session channel and multiplexes the
//! channel into three local pipes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  stdin pipe   ┌──────────┐   data   ┌─────────────┐
//! │              │ ───────────▸  │          │ ──────▸  │             │
//! │   Launcher   │  stdout pipe  │   pump   │   data   │   Agent     │
//! │   (caller)   │ ◂───────────  │   task   │ ◂──────  │   Process   │
//! │              │  stderr pipe  │          │ ext 1    │             │
//! └──────────────┘ ◂───────────  └──────────┘ ◂──────  └─────────────┘
//! ```
//!
//! - The pump task owns the channel; nothing else touches it
//! - Closing the local stdin pipe sends EOF to the remote process
//! - When the channel closes the pipes are dropped, so readers see EOF
//! - The final [`ProcessExit`] is delivered once through a oneshot

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::ssh::{ProcessExit, RemoteProcess, TransportError};

/// Capacity of each local pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest chunk forwarded from stdin in one SSH data message.
const STDIN_CHUNK: usize = 32 * 1024;

/// Start `command` on `channel` and bridge its streams.
pub async fn bridge_channel(
    mut channel: Channel<Msg>,
    command: &str,
) -> Result<RemoteProcess, TransportError> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| TransportError::Ssh(format!("Failed to exec agent: {}", e)))?;

    let (stdout_local, mut stdout_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_local, mut stderr_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdin_local, mut stdin_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();
    let (terminate_tx, mut terminate_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut buf = vec![0u8; STDIN_CHUNK];
        let mut stdin_open = true;
        let mut stdout_open = true;
        let mut exit = ProcessExit::default();

        loop {
            tokio::select! {
                // Forward local writes to the remote stdin
                read = stdin_remote.read(&mut buf), if stdin_open => {
                    match read {
                        Ok(0) | Err(_) => {
                            stdin_open = false;
                            if let Err(e) = channel.eof().await {
                                debug!("[agent-transport] eof failed: {}", e);
                            }
                        }
                        Ok(n) => {
                            if let Err(e) = channel.data(&buf[..n]).await {
                                warn!("[agent-transport] write failed, channel closed");
                                exit.error = Some(format!("write to remote stdin failed: {}", e));
                                break;
                            }
                        }
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if stdout_open && stdout_remote.write_all(&data).await.is_err() {
                                // Reader is gone; keep draining so the remote side never stalls
                                debug!("[agent-transport] stdout reader dropped");
                                stdout_open = false;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            let _ = stderr_remote.write_all(&data).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("[agent-transport] Agent exited with status {}", exit_status);
                            exit.status = Some(exit_status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                            exit.error = Some(format!(
                                "killed by signal {:?}: {}",
                                signal_name, error_message
                            ));
                        }
                        Some(ChannelMsg::Eof) => {
                            debug!("[agent-transport] Remote stdout closed");
                        }
                        Some(ChannelMsg::Close) | None => {
                            info!("[agent-transport] Channel closed");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = &mut terminate_rx => {
                    info!("[agent-transport] Shutdown signal received");
                    let _ = channel.close().await;
                    break;
                }
            }
        }

        drop(stdout_remote);
        drop(stderr_remote);
        drop(stdin_remote);
        let _ = exit_tx.send(exit);
        debug!("[agent-transport] IO task ended");
    });

    Ok(RemoteProcess {
        stdout: Box::new(stdout_local),
        stdin: Box::new(stdin_local),
        stderr: Box::new(stderr_local),
        exited: exit_rx,
        terminate: terminate_tx,
    })
}
