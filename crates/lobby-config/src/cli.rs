//! Command-line argument parsing for the lobby server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Lobby server command-line arguments.
///
/// CLI values override settings loaded from `lobby.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "lobby-server", about = "Multiplayer lobby server")]
pub struct CliArgs {
    /// Address to bind the lobby and relay sockets to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Lobby TCP port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Match relay UDP port.
    #[arg(long)]
    pub relay_port: Option<u16>,

    /// Do not start the UDP match relay.
    #[arg(long)]
    pub no_relay: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for the JSON log file.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(port) = args.relay_port {
            self.relay.port = port;
        }
        if args.no_relay {
            self.relay.enabled = false;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
        if let Some(ref dir) = args.log_dir {
            self.log.log_dir = Some(dir.clone());
            self.log.json_file = true;
        }
    }
}
