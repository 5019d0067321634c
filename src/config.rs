//! Configuration module for shaderd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the compile server
#[derive(Parser, Debug)]
#[command(name = "shaderd")]
#[command(author = "shaderd authors")]
#[command(version = "0.1.0")]
#[command(about = "A shader compilation server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Accept compile requests over TCP (default)
    Serve(ServeArgs),
    /// Compile a single .vert or .frag file and exit
    Compile {
        /// Shader source file
        input: PathBuf,
        /// Where to write the compiled artifact
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// IP address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections (unlimited when unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds a connection may stay idle before it is closed (0 disables)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Compile worker threads (0 compiles on the event loop thread)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Send a zero-length response when compilation fails
    #[arg(long)]
    pub failure_sentinel: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection cap; unset means descriptor limits only
    pub max_connections: Option<usize>,
    /// Poll event batch size
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Idle timeout in seconds (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: None,
            event_capacity: default_event_capacity(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Compilation-related configuration
#[derive(Debug, Deserialize)]
pub struct CompileConfig {
    /// Worker threads; 0 compiles inline on the event loop
    #[serde(default)]
    pub workers: usize,
    /// Jobs that may wait for a free worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Reply with a zero-length artifact on compile failure
    #[serde(default)]
    pub failure_sentinel: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: default_queue_depth(),
            failure_sentinel: false,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_event_capacity() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_queue_depth() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Compile {
        input: PathBuf,
        output: Option<PathBuf>,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub max_connections: Option<usize>,
    pub event_capacity: usize,
    /// `None` when idle connections are never reaped.
    pub idle_timeout: Option<Duration>,
    pub workers: usize,
    pub queue_depth: usize,
    pub failure_sentinel: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let (mode, serve) = match cli.command {
            None => (Mode::Serve, ServeArgs::default()),
            Some(CliCommand::Serve(args)) => (Mode::Serve, args),
            Some(CliCommand::Compile { input, output }) => {
                (Mode::Compile { input, output }, ServeArgs::default())
            }
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let idle_timeout = serve.idle_timeout.unwrap_or(toml_config.server.idle_timeout);
        let config = Config {
            mode,
            host: serve.host.unwrap_or(toml_config.server.host),
            port: serve.port.unwrap_or(toml_config.server.port),
            max_connections: serve.max_connections.or(toml_config.server.max_connections),
            event_capacity: toml_config.server.event_capacity.max(1),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            workers: serve.workers.unwrap_or(toml_config.compile.workers),
            queue_depth: toml_config.compile.queue_depth.max(1),
            failure_sentinel: serve.failure_sentinel || toml_config.compile.failure_sentinel,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        if config.mode == Mode::Serve {
            config.listen_addr()?;
        }
        Ok(config)
    }

    /// Socket address the server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| ConfigError::InvalidAddress(self.host.clone(), e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': {1}")]
    InvalidAddress(String, #[source] std::net::AddrParseError),
}
