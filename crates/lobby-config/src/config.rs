//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "lobby.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// TCP listener and connection settings.
    pub server: ServerConfig,
    /// UDP match relay settings.
    pub relay: RelayConfig,
    /// Room and chat rules.
    pub lobby: LobbyRules,
    /// Logging settings.
    pub log: LogConfig,
}

/// TCP listener and per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the lobby listener binds to.
    pub bind_address: String,
    /// Lobby listener port.
    pub port: u16,
    /// Maximum concurrently open client connections.
    pub max_connections: usize,
    /// Longest accepted request line in bytes (newline excluded).
    pub max_frame_bytes: usize,
    /// Outbound frames buffered per connection before sends start failing.
    pub outbound_queue: usize,
    /// Upper bound on a single socket write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Interval between liveness sweeps, in seconds.
    pub liveness_interval_secs: u64,
    /// Reap sessions silent for longer than this many seconds (0 = never).
    pub idle_timeout_secs: u64,
    /// TCP keepalive idle time in seconds (0 = keepalive off).
    pub tcp_keepalive_secs: u64,
}

/// UDP match relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Run the relay alongside the lobby.
    pub enabled: bool,
    /// UDP port for the relay.
    pub port: u16,
    /// Datagrams larger than this are dropped.
    pub max_datagram_bytes: usize,
}

/// Room and chat rules enforced by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LobbyRules {
    /// Maximum room name width (wide characters count twice).
    pub max_room_name_width: usize,
    /// Maximum chat message length in characters.
    pub max_chat_length: usize,
    /// Difficulty used when a create request leaves it blank.
    pub default_difficulty: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "info", "debug,lobby_net=trace").
    pub level: String,
    /// Directory for the JSON log file, if any.
    pub log_dir: Option<PathBuf>,
    /// Write a JSON log file into `log_dir`.
    pub json_file: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            max_connections: 512,
            max_frame_bytes: 64 * 1024,
            outbound_queue: 256,
            write_timeout_ms: 2000,
            liveness_interval_secs: 5,
            idle_timeout_secs: 0,
            tcp_keepalive_secs: 30,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5001,
            max_datagram_bytes: 1400,
        }
    }
}

impl Default for LobbyRules {
    fn default() -> Self {
        Self {
            max_room_name_width: 20,
            max_chat_length: 500,
            default_difficulty: "Normal".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            json_file: false,
        }
    }
}

impl ServerConfig {
    /// Socket address the lobby listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_address, self.port);
        raw.parse()
            .or_else(|_| format!("[{}]:{}", self.bind_address, self.port).parse())
            .map_err(|_| ConfigError::InvalidAddress(raw))
    }

    /// Interval between liveness sweeps.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    /// Idle timeout, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Upper bound on a single socket write.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// TCP keepalive idle time, or `None` when disabled.
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive_secs > 0).then(|| Duration::from_secs(self.tcp_keepalive_secs))
    }
}

impl RelayConfig {
    /// Socket address for the relay, sharing the lobby's bind address.
    pub fn listen_addr(&self, server: &ServerConfig) -> Result<SocketAddr, ConfigError> {
        ServerConfig {
            port: self.port,
            ..server.clone()
        }
        .listen_addr()
    }
}

impl Config {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.server.max_connections == 0 {
            return invalid("server.max_connections", "must be at least 1");
        }
        if self.server.outbound_queue == 0 {
            return invalid("server.outbound_queue", "must be at least 1");
        }
        if self.server.max_frame_bytes < 64 {
            return invalid("server.max_frame_bytes", "must be at least 64");
        }
        if self.relay.enabled && self.relay.port == self.server.port {
            return invalid("relay.port", "must differ from server.port");
        }
        if self.lobby.max_room_name_width == 0 {
            return invalid("lobby.max_room_name_width", "must be at least 1");
        }
        if self.lobby.max_chat_length == 0 {
            return invalid("lobby.max_chat_length", "must be at least 1");
        }
        Ok(())
    }
}

/// Default configuration directory (`<platform config dir>/lobby-server`).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lobby-server")
}

// --- Load / Save ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `lobby.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }
}
