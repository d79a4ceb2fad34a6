use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub servers: Vec<PeerConfig>,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub path_sync_policy: Vec<PathSyncPolicy>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("servers", &self.servers)
            .field("sync", &self.sync)
            .field("database", &self.database)
            .field("server", &self.server)
            .field("logging", &self.logging)
            .field("path_sync_policy", &self.path_sync_policy)
            .finish()
    }
}

/// One peer media server. `api_key` must be an administrator token so the
/// library refresh and user mutations are permitted.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
    pub api_key: String,
    /// Peers that allow login without a password; user-creation fan-out
    /// skips password generation for these.
    pub passwordless: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            api_key: String::new(),
            passwordless: false,
        }
    }
}

impl std::fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("passwordless", &self.passwordless)
            .finish()
    }
}

/// Which state categories are mirrored, plus pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub playback_progress: bool,
    pub watched_status: bool,
    pub favorites: bool,
    pub ratings: bool,
    pub likes: bool,
    pub play_count: bool,
    pub last_played_date: bool,
    pub audio_stream: bool,
    pub subtitle_stream: bool,
    pub progress_debounce_seconds: u64,
    pub worker_interval_seconds: f64,
    pub max_retries: u32,
    /// Log intended peer mutations without performing them.
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            playback_progress: true,
            watched_status: true,
            favorites: true,
            ratings: true,
            likes: true,
            play_count: true,
            last_played_date: true,
            audio_stream: true,
            subtitle_stream: true,
            progress_debounce_seconds: 30,
            worker_interval_seconds: 5.0,
            max_retries: 5,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    /// SQLite journal mode: WAL, DELETE, TRUNCATE, MEMORY or OFF.
    pub journal_mode: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/data/jellysync.db".to_string(),
            journal_mode: "WAL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Retry policy for items that are not yet imported on a target peer,
/// selected by longest prefix match on the item's storage path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSyncPolicy {
    pub prefix: String,
    /// -1 = retry forever, 0 = never retry, N > 0 = retry up to N attempts.
    pub absent_retry_count: i64,
    pub retry_delay_seconds: u64,
}

impl Default for PathSyncPolicy {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            absent_retry_count: 0,
            retry_delay_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
            }
        }

        // Override with environment variables (JELLYSYNC_DATABASE_PATH, etc.)
        builder = builder.add_source(
            Environment::with_prefix("JELLYSYNC")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate invariants that cannot be expressed through serde defaults.
    /// Any violation is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Message(
                "at least one peer server must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.servers {
            if peer.name.is_empty() {
                return Err(ConfigError::Message(
                    "peer server name must not be empty".to_string(),
                ));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate peer server name: {}",
                    peer.name
                )));
            }
            url::Url::parse(&peer.url).map_err(|e| {
                ConfigError::Message(format!("invalid url for peer {}: {e}", peer.name))
            })?;
            if peer.api_key.is_empty() {
                return Err(ConfigError::Message(format!(
                    "missing api_key for peer {}",
                    peer.name
                )));
            }
        }

        let mode = self.database.journal_mode.to_uppercase();
        if !matches!(mode.as_str(), "WAL" | "DELETE" | "TRUNCATE" | "MEMORY" | "OFF") {
            return Err(ConfigError::Message(format!(
                "invalid database journal_mode: {}",
                self.database.journal_mode
            )));
        }

        Ok(())
    }

    /// Get peer config by name
    #[must_use]
    pub fn get_server(&self, name: &str) -> Option<&PeerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// All peers except the named one (the fan-out targets for a webhook).
    #[must_use]
    pub fn other_servers(&self, exclude_name: &str) -> Vec<&PeerConfig> {
        self.servers.iter().filter(|s| s.name != exclude_name).collect()
    }

    /// Path sync policy for a given item path (longest prefix wins).
    #[must_use]
    pub fn path_policy_for(&self, path: Option<&str>) -> Option<&PathSyncPolicy> {
        let path = path?;

        let mut matching: Option<&PathSyncPolicy> = None;
        let mut max_prefix_len = 0;

        for policy in &self.path_sync_policy {
            if path.starts_with(&policy.prefix) && policy.prefix.len() > max_prefix_len {
                matching = Some(policy);
                max_prefix_len = policy.prefix.len();
            }
        }

        matching
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
