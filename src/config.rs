//! # Connection Configuration
//!
//! Everything a [`DeviceClient`](crate::DeviceClient) needs to reach a broker:
//! endpoint, identity, credentials, trust anchor and the protocol timings.
//! The struct can be built in code or loaded from a TOML credentials file so
//! secrets stay out of the source tree.
//!
//! ```toml
//! host = "demo.thingsboard.io"
//! port = 8883
//! client_id = "device-01"
//! ca_cert_path = "/etc/ssl/certs/ISRG_Root_X1.pem"
//! username = "ACCESS_TOKEN"
//! password = ""
//! ```
//!
//! The timing keys (`keep_alive_secs`, `ping_interval_secs`,
//! `connect_timeout_secs`, `operation_timeout_secs`) are optional.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ConfigurationError;

const CONFIG_DIR: &str = ".config/tb-device-client";
const CREDENTIALS_FILE: &str = "credentials.toml";

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(40);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// rumqttc refuses keep-alive values below five seconds
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Connection parameters for one device
///
/// Owned by the client after construction and never modified afterwards.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker hostname or IP address
    pub host: String,
    /// Broker TLS port, usually 8883
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// PEM file with the CA certificate(s) used to verify the broker
    pub ca_cert_path: PathBuf,
    /// MQTT username (the device access token on ThingsBoard)
    pub username: String,
    /// MQTT password
    #[serde(default)]
    pub password: String,
    #[serde(
        rename = "keep_alive_secs",
        with = "duration_secs",
        default = "default_keep_alive"
    )]
    pub keep_alive: Duration,
    /// Must be longer than `keep_alive`
    #[serde(
        rename = "ping_interval_secs",
        with = "duration_secs",
        default = "default_ping_interval"
    )]
    pub ping_interval: Duration,
    /// Upper bound for TCP, TLS and CONNACK together
    #[serde(
        rename = "connect_timeout_secs",
        with = "duration_secs",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,
    /// Upper bound for SUBACK, PUBACK and DISCONNECT
    #[serde(
        rename = "operation_timeout_secs",
        with = "duration_secs",
        default = "default_operation_timeout"
    )]
    pub operation_timeout: Duration,
}

impl ConnectionConfig {
    /// Creates a configuration with the default protocol timings.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        ca_cert_path: impl Into<PathBuf>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            ca_cert_path: ca_cert_path.into(),
            username: username.into(),
            password: password.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets keep-alive and ping interval together; the ping interval has to
    /// stay above the keep-alive.
    pub fn with_keep_alive(mut self, keep_alive: Duration, ping_interval: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.ping_interval = ping_interval;
        self
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigurationError> {
        let config: ConnectionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML credentials file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        debug!("Loading connection config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// `~/.config/tb-device-client/credentials.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CREDENTIALS_FILE);
        path
    }

    /// Checks the invariants that can be verified without touching the
    /// network. The CA file itself is checked when the TLS setup loads it.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::EmptyHost);
        }
        if self.client_id.is_empty() {
            return Err(ConfigurationError::EmptyClientId);
        }
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort(u32::from(self.port)));
        }
        if self.keep_alive < MIN_KEEP_ALIVE {
            return Err(ConfigurationError::InvalidInterval(format!(
                "keep-alive must be at least {:?}, got {:?}",
                MIN_KEEP_ALIVE, self.keep_alive
            )));
        }
        if self.ping_interval <= self.keep_alive {
            return Err(ConfigurationError::InvalidInterval(format!(
                "ping interval {:?} must exceed keep-alive {:?}",
                self.ping_interval, self.keep_alive
            )));
        }
        if self.connect_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err(ConfigurationError::InvalidInterval(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive", &self.keep_alive)
            .field("ping_interval", &self.ping_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

fn default_ping_interval() -> Duration {
    DEFAULT_PING_INTERVAL
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
