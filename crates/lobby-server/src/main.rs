//! The `lobby-server` binary: TCP lobby plus the optional UDP match relay.

use std::sync::Arc;

use clap::Parser;
use lobby_config::{CliArgs, Config, default_config_dir};
use lobby_net::MatchRelay;
use lobby_server::{LobbyServer, LobbyState, ServerSettings};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Load or create config, then apply CLI overrides
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = lobby_log::file_log_dir(&config.log);
    lobby_log::init_logging(log_dir.as_deref(), Some(&config.log));

    let settings = match ServerSettings::from_config(&config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let state = Arc::new(LobbyState::new(config.lobby.clone()));
    let server = Arc::new(LobbyServer::new(settings, state));
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind lobby listener: {e}");
            std::process::exit(1);
        }
    };

    let relay = if config.relay.enabled {
        match start_relay(&config).await {
            Ok(relay) => Some(relay),
            Err(e) => {
                error!("Match relay disabled: {e}");
                None
            }
        }
    } else {
        info!("Match relay disabled by configuration");
        None
    };

    let runner = Arc::clone(&server);
    let lobby = tokio::spawn(async move { runner.run_with_listener(listener).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
    }

    server.shutdown();
    if let Some(relay) = &relay {
        relay.shutdown();
    }
    match lobby.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Lobby stopped with error: {e}"),
        Err(e) => error!("Lobby task failed: {e}"),
    }
    info!(
        sessions = server.state().sessions.len(),
        rooms = server.state().rooms.len(),
        "Lobby stopped"
    );
}

async fn start_relay(config: &Config) -> Result<Arc<MatchRelay>, Box<dyn std::error::Error>> {
    let addr = config.relay.listen_addr(&config.server)?;
    let relay = Arc::new(MatchRelay::bind(addr, config.relay.max_datagram_bytes).await?);
    let runner = Arc::clone(&relay);
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Match relay failed: {e}");
        }
    });
    Ok(relay)
}
