//! Configuration management for the Turnstile service.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! `TURNSTILE__*` environment variables (`TURNSTILE__SERVER__LISTEN_ADDR`).
//! The limit rules themselves live in a separate file, see
//! [`LimitConfig`](crate::ratelimit::LimitConfig).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::Result;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limit rules location and maintenance
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Limit configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Path to the limit rules file
    #[serde(default)]
    pub config_path: Option<String>,

    /// Configuration reload interval in seconds, 0 to disable
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Idle counter sweep interval in seconds, 0 to disable
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            reload_interval_secs: default_reload_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from an optional file, overridden by the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix("TURNSTILE"))
    }

    fn load_with_env(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(Path::new(path)));
        }

        let settings = builder
            .add_source(env.prefix_separator("__").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
