use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub blacklist: Option<String>,
    #[serde(default)]
    pub auth_file: Option<String>,
    #[serde(default)]
    pub cache: bool,
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub log: LoggerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            blacklist: None,
            auth_file: None,
            cache: false,
            cache_bytes: default_cache_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            log: LoggerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_entry_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_buffer_size() -> usize {
    8192
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/fwdproxy-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

fn default_file_size() -> u64 {
    10
}

impl Config {
    /// Loads the base configuration from an optional TOML file; absence of
    /// the file is not an error, since every field has a default.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            return Ok(Config::default());
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigLibError)?;

        settings.try_deserialize().map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address().parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidConfig(format!("invalid bind address: {}", self.bind_address())));
        }
        if self.buffer_size == 0 || self.buffer_size > 65536 {
            return Err(ConfigError::InvalidConfig(format!(
                "invalid buffer size: {}, must be between 1 and 65536",
                self.buffer_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidConfig("max_connections must be at least 1".to_string()));
        }
        if self.cache_bytes == 0 {
            return Err(ConfigError::InvalidConfig("cache_bytes must be at least 1".to_string()));
        }
        if let Some(path) = &self.blacklist {
            if !Path::new(path).exists() {
                return Err(ConfigError::InvalidConfig(format!("blacklist file not found: {path}")));
            }
        }
        if let Some(path) = &self.auth_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::InvalidConfig(format!("auth file not found: {path}")));
            }
        }
        if self.log.file_count == 0 {
            return Err(ConfigError::InvalidConfig("log.file_count must be at least 1".to_string()));
        }
        if !self.log.archive_pattern.contains("{}") {
            return Err(ConfigError::InvalidConfig(format!(
                "log.archive_pattern must contain a '{{}}' placeholder: {}",
                self.log.archive_pattern
            )));
        }
        Ok(())
    }
}
