//! Configuration Management Module
//!
//! A launch is described by one JSON file ([`LauncherConfig`]). The parsed
//! configuration is handed to the launcher explicitly.

mod storage;
mod types;

use std::path::PathBuf;

use thiserror::Error;

pub use storage::{config_dir, default_config_path, load, parse, CONFIG_FILE_NAME};
pub use types::{LauncherConfig, SecretValue};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Scrambled secret cannot be decoded: {0}")]
    Scrambled(String),
}
