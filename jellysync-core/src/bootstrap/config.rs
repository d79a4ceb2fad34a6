//! Configuration loading for the binary.

use anyhow::Result;
use tracing::info;

use crate::Config;

/// Load and validate configuration.
///
/// The file comes from `CONFIG_PATH`, falling back to `/config/config.yaml`
/// and then `./config.yaml`; environment variables override file values.
/// Any validation failure is fatal.
pub fn load_config() -> Result<Config> {
    let candidates = [
        std::env::var("CONFIG_PATH").ok(),
        Some("/config/config.yaml".to_string()),
        Some("config.yaml".to_string()),
    ];

    let config_path = candidates
        .into_iter()
        .flatten()
        .find(|p| std::path::Path::new(p).exists());

    let config = match &config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::load(None)?,
    };

    config.validate()?;

    if let Some(path) = config_path {
        info!(path, "configuration loaded");
    }
    info!(
        servers = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "configured peer servers"
    );

    Ok(config)
}
