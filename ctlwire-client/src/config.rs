//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CTLWIRE_CONFIG or --config)
//! 3. Environment variables

use crate::backoff::Backoff;
use ctlwire_protocol::{Framing, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Minimum accepted frame size (1 KiB).
pub const MIN_FRAME_SIZE: usize = 1024;

/// Maximum accepted frame size (64 MiB).
pub const MAX_FRAME_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Remote controller address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port` or bare `host:port`.
    Tcp(String),
    /// `ws://host:port/path`.
    WebSocket(String),
}

impl Endpoint {
    /// Framing used on this endpoint's transport.
    pub fn framing(&self) -> Framing {
        match self {
            Endpoint::Tcp(_) => Framing::Lines,
            Endpoint::WebSocket(_) => Framing::Messages,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("wss://") {
            return Err(ConfigError::ValidationError(
                "wss:// endpoints are not supported (no TLS)".to_string(),
            ));
        }
        if s.starts_with("ws://") {
            if s.len() == "ws://".len() {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint '{}' has no host",
                    s
                )));
            }
            return Ok(Endpoint::WebSocket(s.to_string()));
        }

        let addr = match s.strip_prefix("tcp://") {
            Some(rest) => rest,
            None if s.contains("://") => {
                return Err(ConfigError::ValidationError(format!(
                    "unsupported endpoint scheme in '{}'",
                    s
                )))
            }
            None => s,
        };

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            _ => Err(ConfigError::ValidationError(format!(
                "endpoint '{}' must be host:port",
                s
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::WebSocket(url) => f.write_str(url),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote controller endpoint.
    pub endpoint: String,
    /// Session token attached to every command (optional).
    pub auth_token: Option<String>,
    /// Transport open timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default per-command timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Read buffer size for stream transports.
    pub read_buffer_size: usize,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("tcp://127.0.0.1:{}", ctlwire_protocol::DEFAULT_PORT),
            auth_token: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    ///
    /// The file is `path` when given, otherwise `CTLWIRE_CONFIG` if set.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("CTLWIRE_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("CTLWIRE_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var("CTLWIRE_TOKEN") {
            self.auth_token = if token.is_empty() { None } else { Some(token) };
        }
        if let Ok(ms) = std::env::var("CTLWIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse() {
                self.connect_timeout_ms = parsed;
            }
        }
        if let Ok(ms) = std::env::var("CTLWIRE_REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse() {
                self.request_timeout_ms = parsed;
            }
        }
        if let Ok(size) = std::env::var("CTLWIRE_MAX_FRAME_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                self.max_frame_size = parsed.clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT);
            }
        }
        self.reconnect.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&self.max_frame_size) {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be between {} and {} bytes",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT
            )));
        }
        if !(MIN_READ_BUFFER_SIZE..=MAX_READ_BUFFER_SIZE).contains(&self.read_buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "read_buffer_size must be between {} and {} bytes",
                MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE
            )));
        }

        self.reconnect.validate()
    }

    /// Parses the configured endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.endpoint.parse()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after the connection drops.
    pub enabled: bool,
    /// Delay before the first reconnection attempt.
    pub base_interval_ms: u64,
    /// Upper bound on the delay between attempts.
    pub max_interval_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Returns the backoff schedule for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            self.max_attempts,
        )
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CTLWIRE_RECONNECT") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(ms) = std::env::var("CTLWIRE_RECONNECT_BASE_MS") {
            if let Ok(parsed) = ms.parse() {
                self.base_interval_ms = parsed;
            }
        }
        if let Ok(ms) = std::env::var("CTLWIRE_RECONNECT_MAX_MS") {
            if let Ok(parsed) = ms.parse() {
                self.max_interval_ms = parsed;
            }
        }
        if let Ok(attempts) = std::env::var("CTLWIRE_RECONNECT_ATTEMPTS") {
            if let Ok(parsed) = attempts.parse() {
                self.max_attempts = parsed;
            }
        }
    }

    /// Validates the reconnection policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect.base_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_interval_ms < self.base_interval_ms {
            return Err(ConfigError::ValidationError(
                "reconnect.max_interval_ms must not be below base_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
