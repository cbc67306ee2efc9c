//! Configuration system for the lobby server.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line via clap. Unknown or missing fields fall back to defaults so
//! config files stay forward and backward compatible.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, LobbyRules, LogConfig, RelayConfig, ServerConfig, default_config_dir,
};
pub use error::ConfigError;
