//! Error definitions for the device client

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while building a [`DeviceClient`](crate::DeviceClient)
///
/// All of these are fatal to construction. Retrying without changing the
/// input produces the same error.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The broker host is empty or only whitespace
    #[error("broker host must not be empty")]
    EmptyHost,

    /// The MQTT client identifier is empty
    #[error("client id must not be empty")]
    EmptyClientId,

    /// The port is outside of 1..=65535
    #[error("invalid broker port: {0}")]
    InvalidPort(u32),

    /// One of the timing parameters violates its constraint
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// The CA certificate could not be turned into a trust store
    #[error(transparent)]
    Certificate(#[from] CertificateLoadError),

    /// A credentials file could not be read
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A credentials file is not valid TOML or misses fields
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// No execution context could be created or found
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Errors raised while loading the CA certificate
#[derive(Debug, Error)]
pub enum CertificateLoadError {
    /// The file is missing or unreadable
    #[error("unable to read CA certificate {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file does not contain a single PEM certificate block
    #[error("no PEM certificate found in {path}")]
    NoCertificates { path: PathBuf },

    /// A PEM block could not be decoded
    #[error("malformed PEM data in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The decoded certificate was refused as a trust anchor
    #[error("certificate in {path} rejected as trust root: {reason}")]
    Rejected { path: PathBuf, reason: String },
}

/// Errors reported by an individual client operation
///
/// Every asynchronous operation resolves to exactly one outcome; when that
/// outcome is a failure it carries one of these. The type is `Clone` because a
/// connection loss is fanned out to every registered message listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The operation needs an established broker connection
    #[error("client is not connected")]
    NotConnected,

    /// `connect` was called on an established connection
    #[error("client is already connected")]
    AlreadyConnected,

    /// `connect` was called while another connect is still pending
    #[error("a connect attempt is already in progress")]
    ConnectInProgress,

    /// `connect` was called while a disconnect is still pending
    #[error("a disconnect is in progress")]
    DisconnectInProgress,

    /// Network, TLS or protocol failure reported by the MQTT engine
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker answered CONNECT with a non-success return code
    #[error("connection refused by broker: {0}")]
    Refused(String),

    /// The MQTT engine did not accept the request
    #[error("request rejected by mqtt engine: {0}")]
    Request(String),

    /// No acknowledgment arrived within the configured timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The connection went away before the operation was acknowledged
    #[error("connection closed before the operation completed")]
    Disconnected,

    /// An inbound payload is not valid UTF-8
    #[error("payload on {topic} is not valid UTF-8: {reason}")]
    InvalidPayload { topic: String, reason: String },

    /// The client was shut down
    #[error("client has been shut down")]
    ShutDown,
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        match err {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                TransportError::Refused(format!("{:?}", code))
            }
            other => TransportError::Connection(other.to_string()),
        }
    }
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(err: rumqttc::ClientError) -> Self {
        TransportError::Request(err.to_string())
    }
}
