//! ssh-slaves - launch one agent and bridge its streams to stdin/stdout

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ssh_slaves::agent::{AgentChannel, AgentHandle, DisconnectCause};
use ssh_slaves::config::{self, ConfigError};
use ssh_slaves::launcher::{LaunchError, StderrListener};

#[derive(Parser)]
#[command(name = "ssh-slaves")]
#[command(author, version, about = "Launch a build agent on a remote host over SSH")]
struct Cli {
    /// Launch configuration (JSON)
    #[arg(short, long, env = "SSH_SLAVES_CONFIG")]
    config: Option<PathBuf>,

    /// Launch, then disconnect right away
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("No configuration file given and no default location available")]
    NoConfig,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Remote stdout still in flight when the channel closes.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,russh=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(cause) if cause.is_failure() => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<DisconnectCause, CliError> {
    let path = match cli.config {
        Some(path) => path,
        None => config::default_config_path().ok_or(CliError::NoConfig)?,
    };
    let config = config::load(&path).await?;
    let launch = config.to_launch_config()?;
    let launcher = config.launcher();

    let interrupt = CancellationToken::new();
    let on_ctrl_c = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_ctrl_c.cancel();
        }
    });

    let mut handle = launcher
        .launch_with_interrupt(&launch, Arc::new(StderrListener), &interrupt)
        .await?;
    info!("Agent {} running on {}", handle.id(), handle.host());

    if cli.check {
        return Ok(handle.disconnect().await);
    }

    match handle.take_channel() {
        Some(channel) => Ok(bridge(&handle, channel, &interrupt).await),
        None => Ok(handle.disconnect().await),
    }
}

/// Pump stdin to the agent and the agent to stdout until the agent closes.
async fn bridge(
    handle: &AgentHandle,
    channel: AgentChannel,
    interrupt: &CancellationToken,
) -> DisconnectCause {
    let AgentChannel {
        mut inbound,
        mut outbound,
    } = channel;

    let to_agent = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        if let Err(e) = tokio::io::copy(&mut stdin, &mut outbound).await {
            warn!("[agent-transport] stdin copy stopped: {}", e);
        }
        let _ = outbound.shutdown().await;
    });
    let from_agent = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = tokio::io::copy(&mut inbound, &mut stdout).await {
            warn!("[agent-transport] stdout copy stopped: {}", e);
        }
        let _ = stdout.flush().await;
    });

    let cause = tokio::select! {
        cause = handle.closed() => cause,
        _ = interrupt.cancelled() => handle.disconnect().await,
    };

    to_agent.abort();
    if tokio::time::timeout(OUTPUT_DRAIN, from_agent).await.is_err() {
        warn!("[agent-transport] agent output not drained");
    }
    cause
}
