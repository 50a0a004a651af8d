//! Configuration for the civis-intake CLI
//!
//! Loads configuration from:
//! 1. config.yaml - platform databases, catalog settings, logging
//! 2. .env file - secrets (CIVIS_API_KEY)
//!
//! Environment variables always override config.yaml values.

use std::path::{Path, PathBuf};

use civis_intake::catalog::{CatalogArgs, DEFAULT_SCHEMA};
use civis_intake::uri::DatabaseKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One DuckDB database exposed as a platform database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    pub kind: DatabaseKind,

    /// DuckDB file; in-memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Statements run right after attaching
    #[serde(default)]
    pub setup_sql: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

/// Catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub database: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    /// Refresh interval in seconds; 0 or absent means the default
    #[serde(default)]
    pub ttl: Option<u64>,

    /// Options passed to every source
    #[serde(default)]
    pub civis_kwargs: Map<String, Value>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            schema: default_schema(),
            ttl: None,
            civis_kwargs: Map::new(),
        }
    }
}

impl CatalogConfig {
    /// No API key is carried; the connector resolves `CIVIS_API_KEY` itself
    pub fn to_args(&self) -> CatalogArgs {
        let mut args = CatalogArgs::new(self.database.clone())
            .with_schema(self.schema.clone())
            .with_options(self.civis_kwargs.clone());
        args.ttl = self.ttl;
        args
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment variables, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(database) = std::env::var("CIVIS_DATABASE") {
            self.catalog.database = database;
        }
        if let Ok(schema) = std::env::var("CIVIS_SCHEMA") {
            self.catalog.schema = schema;
        }
        if let Ok(ttl) = std::env::var("CIVIS_TTL") {
            let seconds = ttl
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("CIVIS_TTL is not a number: {}", ttl)))?;
            self.catalog.ttl = Some(seconds);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }

    /// The catalog database must be one the platform attaches
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog.database.is_empty() {
            return Err(ConfigError::Invalid(
                "catalog.database is not set (config file or CIVIS_DATABASE)".to_string(),
            ));
        }
        if !self
            .platform
            .databases
            .iter()
            .any(|db| db.name == self.catalog.database)
        {
            return Err(ConfigError::Invalid(format!(
                "catalog database {} is not listed under platform.databases",
                self.catalog.database
            )));
        }
        Ok(())
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}
