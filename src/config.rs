//! Configuration for the echoline client and server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echoline")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP echo client and server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Receive/line buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Subcommands: run one side of the echo pair
#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Listen on a port and acknowledge each received line
    Serve {
        /// Port number or service name to listen on
        port: String,

        /// Handle each connection on its own thread instead of one at a time
        #[arg(long)]
        concurrent: bool,
    },
    /// Connect to a server and forward lines from standard input
    Connect {
        /// Server host name or address
        host: String,

        /// Port number or service name to connect to
        port: String,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Receive/line buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Handle each connection on its own thread
    #[serde(default)]
    pub concurrent: bool,
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

fn default_buffer_size() -> usize {
    crate::buffer::DEFAULT_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub buffer_size: usize,
    pub concurrent: bool,
    pub log_level: String,
    pub command: CliCommand,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::merge(cli)
    }

    fn merge(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let cli_concurrent = matches!(
            cli.command,
            CliCommand::Serve {
                concurrent: true,
                ..
            }
        );

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            buffer_size: cli.buffer_size.unwrap_or(toml_config.connection.buffer_size),
            concurrent: cli_concurrent || toml_config.server.concurrent,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: cli.command,
        };

        if config.buffer_size < 2 {
            return Err(ConfigError::InvalidBufferSize(config.buffer_size));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidBufferSize(usize),
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
            ConfigError::InvalidBufferSize(size) => {
                write!(f, "Buffer size {size} is too small (minimum 2 bytes)")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
