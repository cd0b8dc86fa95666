//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP chat relay with length-framed messages", long_about = None)]
pub struct CliArgs {
    /// Ports to listen on; all ports feed one shared room
    #[arg(value_name = "PORT")]
    pub ports: Vec<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind listeners on (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Runtime backend
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of recent messages replayed to a new participant
    #[arg(long)]
    pub history_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Runtime backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Multi-threaded async executor; room behind a mutex
    Tokio,
    /// Single-threaded readiness event loop; lock-free room
    Mio,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind listeners on
    #[serde(default = "default_host")]
    pub host: String,
    /// Ports to listen on
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Runtime backend
    pub runtime: Option<RuntimeType>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: Vec::new(),
            runtime: None,
        }
    }
}

/// Room-related configuration
#[derive(Debug, Deserialize)]
pub struct RoomConfig {
    /// Number of recent messages replayed to a new participant
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_history_capacity() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub ports: Vec<u16>,
    pub runtime: RuntimeType,
    pub history_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let ports = if cli.ports.is_empty() {
            toml_config.server.ports
        } else {
            cli.ports
        };
        if ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            ports,
            runtime: cli
                .runtime
                .or(toml_config.server.runtime)
                .unwrap_or(RuntimeType::Tokio),
            history_capacity: cli
                .history_capacity
                .unwrap_or(toml_config.room.history_capacity),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    NoPorts,
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
            ConfigError::NoPorts => {
                write!(
                    f,
                    "No listening ports given (pass ports as arguments or set [server] ports)"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_defaults() -> CliArgs {
        CliArgs {
            ports: Vec::new(),
            config: None,
            host: None,
            runtime: None,
            history_capacity: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.server.ports.is_empty());
        assert_eq!(config.room.history_capacity, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            ports = [9000, 9001]
            runtime = "mio"

            [room]
            history_capacity = 25

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.ports, vec![9000, 9001]);
        assert_eq!(config.server.runtime, Some(RuntimeType::Mio));
        assert_eq!(config.room.history_capacity, 25);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_resolve_defaults() {
        let mut cli = cli_defaults();
        cli.ports = vec![9000];

        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.ports, vec![9000]);
        assert_eq!(config.runtime, RuntimeType::Tokio);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_resolve_requires_ports() {
        let cli = cli_defaults();
        assert!(matches!(Config::resolve(cli), Err(ConfigError::NoPorts)));
    }

    #[test]
    fn test_cli_overrides() {
        let mut cli = cli_defaults();
        cli.ports = vec![7777];
        cli.host = Some("::1".to_string());
        cli.runtime = Some(RuntimeType::Mio);
        cli.history_capacity = Some(10);
        cli.log_level = "trace".to_string();

        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.host, "::1");
        assert_eq!(config.ports, vec![7777]);
        assert_eq!(config.runtime, RuntimeType::Mio);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.log_level, "trace");
    }
}
