//! Configuration file loading

use std::path::{Path, PathBuf};

use tracing::info;

use super::{ConfigError, LauncherConfig};

/// Name of the configuration file inside [`config_dir`]
pub const CONFIG_FILE_NAME: &str = "launcher.json";

/// `<platform config dir>/ssh-slaves`
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ssh-slaves"))
}

/// Location used when no file is given on the command line
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Read, parse and validate a configuration file.
pub async fn load(path: &Path) -> Result<LauncherConfig, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let config = parse(&text)?;
    info!("Loaded launch configuration for {} from {:?}", config.host, path);
    Ok(config)
}

pub fn parse(text: &str) -> Result<LauncherConfig, ConfigError> {
    let config: LauncherConfig = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}
