//! Configuration module for the echo server.
//!
//! Process settings come from command-line arguments and an optional TOML
//! file; CLI arguments take precedence over config file values. Settings
//! that shape individual sessions (timeouts, hostname announcement, extra
//! headers) are read per request through [`crate::env::EnvSource`] instead.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Port used when neither a listen address nor `PORT` is given.
pub const DEFAULT_PORT: u16 = 8080;

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-server")]
#[command(version)]
#[command(about = "An HTTP, WebSocket and SSE echo server for testing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: Option<String>,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// Worker threads; `None` lets the runtime pick one per core.
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args, an optional TOML file and `PORT`.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        let port = std::env::var("PORT").ok();
        Self::resolve(cli, port)
    }

    /// Merge parsed CLI args with the config file they name. `port` is the
    /// value of `PORT`, used only when no listen address is configured.
    pub fn resolve(cli: CliArgs, port: Option<String>) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = match cli.listen.or(toml_config.server.listen) {
            Some(listen) => listen,
            None => default_listen(port.as_deref())?,
        };

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }

        Ok(Config {
            listen,
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .filter(|&n| n > 0),
            max_connections,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

fn default_listen(port: Option<&str>) -> Result<String, ConfigError> {
    let port = match port.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(p.to_string()))?,
        None => DEFAULT_PORT,
    };
    Ok(format!("0.0.0.0:{port}"))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(String),
    ZeroMaxConnections,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidPort(port) => write!(f, "Invalid PORT value '{}'", port),
            ConfigError::ZeroMaxConnections => write!(f, "max_connections must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}
