//! Configuration for the chat server and client.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file (`--config`), environment variables, command-line flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Command-line arguments for `chat-server`
#[derive(Parser, Debug)]
#[command(name = "chat-server")]
#[command(version)]
#[command(about = "Relays newline-delimited text between TCP clients", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long, env = "CHAT_HOST")]
    pub host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, env = "CHAT_PORT")]
    pub port: Option<u16>,

    /// Do not send a client's lines back to that client
    #[arg(long)]
    pub no_echo: bool,

    /// Do not broadcast join/leave notices
    #[arg(long)]
    pub no_announce: bool,

    /// Longest accepted line in bytes (0 = unlimited)
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for `chat-client`
#[derive(Parser, Debug)]
#[command(name = "chat-client")]
#[command(version)]
#[command(about = "Interactive client for a line-oriented TCP chat server", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host to connect to
    #[arg(long, env = "CHAT_HOST")]
    pub host: Option<String>,

    /// Server port to connect to
    #[arg(short, long, env = "CHAT_PORT")]
    pub port: Option<u16>,

    /// Send this single message, print the first reply and exit
    #[arg(short, long)]
    pub message: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub echo: Option<bool>,
    pub announce: Option<bool>,
    pub max_line_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl TomlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

fn default_max_line_length() -> usize {
    64 * 1024 // 64 KiB
}

/// Resolved server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whether a client receives its own lines back.
    pub echo: bool,
    pub announce: bool,
    pub max_line_length: Option<usize>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            echo: true,
            announce: true,
            max_line_length: Some(default_max_line_length()),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let file = TomlConfig::load(args.config.as_deref())?;
        Ok(Self::merge(args, file))
    }

    fn merge(args: ServerArgs, file: TomlConfig) -> Self {
        let defaults = Self::default();
        let max_line_length = args
            .max_line_length
            .or(file.server.max_line_length)
            .map_or(defaults.max_line_length, |max| (max > 0).then_some(max));

        ServerConfig {
            host: args.host.or(file.server.host).unwrap_or(defaults.host),
            port: args.port.or(file.server.port).unwrap_or(defaults.port),
            echo: !args.no_echo && file.server.echo.unwrap_or(defaults.echo),
            announce: !args.no_announce && file.server.announce.unwrap_or(defaults.announce),
            max_line_length,
            log_level: args
                .log_level
                .or(file.logging.level)
                .unwrap_or(defaults.log_level),
        }
    }
}

/// Resolved client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// One-shot mode: send this line, print the reply, exit.
    pub message: Option<String>,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            message: None,
            log_level: "warn".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(args: ClientArgs) -> Result<Self, ConfigError> {
        let file = TomlConfig::load(args.config.as_deref())?;
        Ok(Self::merge(args, file))
    }

    fn merge(args: ClientArgs, file: TomlConfig) -> Self {
        let defaults = Self::default();
        ClientConfig {
            host: args.host.or(file.client.host).unwrap_or(defaults.host),
            port: args.port.or(file.client.port).unwrap_or(defaults.port),
            message: args.message,
            log_level: args
                .log_level
                .or(file.logging.level)
                .unwrap_or(defaults.log_level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
