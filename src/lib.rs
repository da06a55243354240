//! # tb-device-client
//!
//! A small MQTT client for devices talking to a ThingsBoard broker. It wraps
//! rumqttc with the settings a device needs out of the box:
//!
//! - TLS only, verified against a CA certificate from a PEM file, TLS 1.2+
//! - QoS 1 ("at least once") for every subscribe and publish
//! - keep-alive 30 s, connect timeout 15 s, operation timeout 30 s
//! - helpers for the ThingsBoard RPC request/response topic convention
//!
//! Every operation returns a [`Completion`] that resolves exactly once to a
//! `Result<T, TransportError>`. Nothing is retried automatically.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mqtt;
pub mod runtime;

pub use client::{rpc_response_topic, DeviceClient, DeviceClientBuilder};
pub use config::ConnectionConfig;
pub use error::{CertificateLoadError, ConfigurationError, TransportError};
pub use logging::{LogSink, NoopSink, TracingSink};
pub use mqtt::completion::{Completion, OperationResult};
pub use mqtt::message_manager::{InboundMessage, MessageListener};
pub use mqtt::mqtt_handler::{ConnectionState, MqttStatus, Subscribed};
pub use runtime::{RuntimeProvider, SharedRuntime};
pub use rumqttc::{SubAck, SubscribeReasonCode};
