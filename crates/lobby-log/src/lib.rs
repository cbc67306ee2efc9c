//! Structured logging for the lobby server.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and,
//! when a log directory is configured, a JSON file layer for post-mortem
//! analysis. `RUST_LOG` always wins over the configured level.

use std::path::{Path, PathBuf};

use lobby_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter used when neither `RUST_LOG` nor the config set a level.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written into the log directory.
pub const LOG_FILE_NAME: &str = "lobby.log";

/// Resolve the filter directive from the config, falling back to
/// [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&LogConfig>) -> String {
    match config {
        Some(config) if !config.level.trim().is_empty() => config.level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Directory for the JSON log file, if file logging is switched on.
pub fn file_log_dir(config: &LogConfig) -> Option<PathBuf> {
    if config.json_file {
        config.log_dir.clone()
    } else {
        None
    }
}

/// Initialize the tracing subscriber.
///
/// * `log_dir` - Optional directory for the JSON log file
/// * `config` - Optional logging configuration for the level override
///
/// Calling this twice is harmless; the second subscriber is silently
/// discarded.
///
/// # Examples
///
/// ```no_run
/// use lobby_log::init_logging;
///
/// init_logging(None, None);
/// ```
pub fn init_logging(log_dir: Option<&Path>, config: Option<&LogConfig>) {
    let directive = filter_directive(config);
    let (env_filter, rejected) = resolve_filter(&directive);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let log_file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        std::fs::File::create(dir.join(LOG_FILE_NAME)).ok()
    });
    let file_enabled = log_file.is_some();
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json()
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        if rejected {
            tracing::warn!(%directive, "Invalid log level in config, using {DEFAULT_FILTER}");
        }
        tracing::debug!(%directive, file = file_enabled, "Logging initialised");
    }
}

/// Pick the active filter: `RUST_LOG` first, then `directive`, then the
/// default. The flag is set when `directive` had to be discarded.
fn resolve_filter(directive: &str) -> (EnvFilter, bool) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, false);
    }
    match EnvFilter::try_new(directive) {
        Ok(filter) => (filter, false),
        Err(_) => (default_env_filter(), true),
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter = default_env_filter();
        assert!(format!("{filter}").contains("info"));
    }

    #[test]
    fn test_config_level_overrides_default() {
        let config = LogConfig {
            level: "debug,lobby_net=trace".to_string(),
            ..Default::default()
        };
        assert_eq!(filter_directive(Some(&config)), "debug,lobby_net=trace");
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_blank_level_falls_back() {
        let config = LogConfig {
            level: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,lobby_server=trace",
            "warn,lobby_net=debug,lobby_server=info",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {filter_str}");
        }
    }

    #[test]
    fn test_malformed_level_falls_back_to_default() {
        // Only meaningful when the environment does not override the level.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let (filter, rejected) = resolve_filter("lobby_server=loudest");
        assert!(rejected);
        assert!(format!("{filter}").contains(DEFAULT_FILTER));

        let (_, rejected) = resolve_filter("debug,lobby_net=trace");
        assert!(!rejected);
    }

    #[test]
    fn test_file_log_dir_requires_json_flag() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = LogConfig {
            log_dir: Some(temp_dir.path().to_path_buf()),
            json_file: false,
            ..Default::default()
        };
        assert_eq!(file_log_dir(&config), None);

        config.json_file = true;
        assert_eq!(file_log_dir(&config), Some(temp_dir.path().to_path_buf()));
    }

    #[test]
    fn test_init_logging_creates_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        init_logging(Some(temp_dir.path()), None);
        assert!(temp_dir.path().join(LOG_FILE_NAME).exists());
    }
}
