//! # MQTT Integration Module
//!
//! Glue between the [`DeviceClient`](crate::DeviceClient) facade and rumqttc.
//! Protocol work (framing, keep-alive pings, QoS 1 retransmission) stays in
//! rumqttc; this module only configures it and routes outcomes back to the
//! caller.
//!
//! ```text
//! mqtt/
//! ├── tls.rs              - CA loading and rustls trust configuration
//! ├── completion.rs       - single-outcome handle returned by every operation
//! ├── message_manager.rs  - inbound message type and named listeners
//! └── mqtt_handler.rs     - session driver matching engine events to operations
//! ```

pub mod completion;
pub mod message_manager;
pub mod mqtt_handler;
pub(crate) mod tls;
