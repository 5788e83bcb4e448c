//! Configuration module for segment-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the segment server
#[derive(Parser, Debug)]
#[command(name = "segment-server")]
#[command(author = "segment-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Answers each request with the lengths of its text segments", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Analyzer used to segment requests
    #[arg(short, long, value_enum)]
    pub analyzer: Option<AnalyzerKind>,

    /// Word list for the dictionary analyzer
    #[arg(short, long)]
    pub dictionary: Option<PathBuf>,

    /// Bytes read per request
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Built-in analyzers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Whitespace-separated tokens
    #[default]
    Whitespace,
    /// Forward maximum matching against a word list
    Dictionary,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Bytes read per request
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Accepts performed per listener readiness event
    #[serde(default = "default_accept_batch")]
    pub accept_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            accept_batch: default_accept_batch(),
        }
    }
}

/// Analysis-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub analyzer: AnalyzerKind,
    pub dictionary: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_accept_batch() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub accept_batch: usize,
    pub analyzer: AnalyzerKind,
    pub dictionary: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli
                .host
                .or(toml_config.server.host)
                .ok_or(ConfigError::Missing("host"))?,
            port: cli
                .port
                .or(toml_config.server.port)
                .ok_or(ConfigError::Missing("port"))?,
            buffer_size: cli.buffer_size.unwrap_or(toml_config.server.buffer_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            event_capacity: toml_config.server.event_capacity,
            accept_batch: toml_config.server.accept_batch,
            analyzer: cli.analyzer.unwrap_or(toml_config.analysis.analyzer),
            dictionary: cli.dictionary.or(toml_config.analysis.dictionary),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be greater than 0"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than 0"));
        }
        if self.accept_batch == 0 {
            return Err(ConfigError::Invalid("accept_batch must be greater than 0"));
        }
        if self.analyzer == AnalyzerKind::Dictionary && self.dictionary.is_none() {
            return Err(ConfigError::Invalid(
                "dictionary analyzer requires a dictionary path",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Missing required setting '{0}'")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
