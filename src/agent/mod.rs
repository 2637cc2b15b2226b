//! Remote agent lifecycle
//!
//! Copies the agent payload to the remote host, starts it on its own SSH
//! channel and supervises it until the channel closes:
//!
//! - [`deploy`]: payload transfer
//! - [`transport`]: channel pump bridging the remote process' streams
//! - [`supervisor`]: stderr copier, disconnect handling and teardown
//! - [`registry`]: live agents of a launcher

pub mod deploy;
mod registry;
mod supervisor;
pub mod transport;

pub use deploy::{transfer, FilePayload, MemoryPayload, PayloadSource, DEFAULT_PAYLOAD_NAME};
pub use registry::{AgentInfo, AgentRegistry};
pub use supervisor::{command_line, AgentChannel, AgentControl, AgentHandle, DisconnectCause};

pub(crate) use supervisor::{supervise, Teardown};
