//! Application configuration.
//!
//! Supports YAML files and environment variable overrides.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::PingOptions;
use crate::error::Result;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTBUS_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis client options.
    pub redis: RedisConfig,
    /// Bus identity.
    pub bus: BusConfig,
    /// Liveness probe parameters.
    pub liveness: LivenessConfig,
}

/// Redis client options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Which bus to join.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus name.
    pub name: String,
    /// External channel prefix, prepended verbatim.
    pub prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            prefix: String::new(),
        }
    }
}

/// Liveness probe parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// How long to wait for pongs, in milliseconds.
    pub timeout_ms: u64,
    /// Other peers that must answer.
    pub min_response_count: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        let defaults = PingOptions::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            min_response_count: defaults.min_response_count,
        }
    }
}

impl LivenessConfig {
    pub fn ping_options(&self) -> PingOptions {
        PingOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            min_response_count: self.min_response_count,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
