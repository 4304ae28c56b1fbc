//! Application configuration.
//!
//! Broker connection settings, the subscription queue and the connection
//! retry mode, loaded from YAML files or environment variables.

use std::fmt;

use serde::Deserialize;

use crate::connection::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "event-bus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENT_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENT_BUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENT_BUS_LOG";
/// Connection retries applied when none are configured.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Queue subscribed to when none is configured.
pub const DEFAULT_QUEUE: &str = "events";

/// Broker connection settings.
///
/// Passed verbatim to the transport when a connection is opened.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker host name.
    pub host: String,
    /// Broker AMQP port.
    pub port: u16,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker connection settings.
    pub connection: ConnectionConfig,
    /// Queue that subscriptions bind to.
    pub queue: String,
    /// Connection retry budget. `DEFAULT_RETRY_COUNT` when absent.
    pub retry_count: Option<u32>,
    /// When false, connection failures propagate on the first attempt.
    pub retry_enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: DEFAULT_QUEUE.to_string(),
            retry_count: None,
            retry_enabled: true,
        }
    }
}

impl BusConfig {
    pub fn new(connection: ConnectionConfig, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self.retry_enabled = true;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_enabled = false;
        self
    }

    /// Retry mode selected by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_enabled {
            RetryPolicy::Bounded(self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT))
        } else {
            RetryPolicy::Disabled
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `DEFAULT_CONFIG_FILE` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix,
    ///    e.g. `EVENT_BUS__CONNECTION__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
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

        let config: BusConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.host is empty".to_string()));
        }
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("queue is empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
