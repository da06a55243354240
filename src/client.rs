//! # Device Client
//!
//! The public facade. A [`DeviceClient`] validates its configuration, loads
//! the CA certificate, prepares the rumqttc options and starts one session
//! driver on the chosen execution context. After that every method only
//! queues a command for the driver and returns a [`Completion`].
//!
//! ```rust,no_run
//! use tb_device_client::{ConnectionConfig, DeviceClient, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::from_file(ConnectionConfig::default_path())?;
//! let client = DeviceClient::builder(config)
//!     .log_sink(Arc::new(TracingSink::default()))
//!     .build()?;
//!
//! client.connect().await?;
//! client.subscribe(["v1/devices/me/rpc/request/+"]).await?;
//! client.publish(r#"{"temperature": 21.5}"#, "v1/devices/me/telemetry").await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use rumqttc::MqttOptions;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{ConfigurationError, TransportError};
use crate::logging::{self, LogSink};
use crate::mqtt::completion::{Completion, Responder};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::mqtt_handler::{
    self, Command, ConnectionState, MqttHandler, MqttStatus, Subscribed,
};
use crate::mqtt::tls;
use crate::runtime::{RuntimeProvider, SharedRuntime};

const RPC_REQUEST: &str = "request";
const RPC_RESPONSE: &str = "response";

/// Derives the RPC response topic from a request topic.
///
/// Every occurrence of `request` is replaced by `response`. A topic without
/// `request` comes back unchanged, so a reply to it lands on the request
/// topic itself.
pub fn rpc_response_topic(request_topic: &str) -> String {
    request_topic.replace(RPC_REQUEST, RPC_RESPONSE)
}

/// MQTT client for one ThingsBoard device
///
/// Transport is always TLS and every subscribe and publish uses QoS 1
/// ("at least once"). Operations are queued in call order; the order in which
/// they complete is up to the broker.
pub struct DeviceClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<MqttStatus>,
    handle: Handle,
    client_id: String,
    shut_down: bool,
}

/// Builder for a [`DeviceClient`]
pub struct DeviceClientBuilder {
    config: ConnectionConfig,
    provider: RuntimeProvider,
    sink: Option<Arc<dyn LogSink>>,
}

impl DeviceClientBuilder {
    pub fn runtime(mut self, provider: RuntimeProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn shared_runtime(self, runtime: SharedRuntime) -> Self {
        self.runtime(RuntimeProvider::Shared(runtime))
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<DeviceClient, ConfigurationError> {
        DeviceClient::create(self.config, self.provider, self.sink)
    }
}

impl DeviceClient {
    /// Starts a builder using an owned runtime and no log sink.
    pub fn builder(config: ConnectionConfig) -> DeviceClientBuilder {
        DeviceClientBuilder {
            config,
            provider: RuntimeProvider::default(),
            sink: None,
        }
    }

    /// Creates a client and starts its session driver. Does not connect.
    ///
    /// # Errors
    ///
    /// * [`ConfigurationError::EmptyHost`], [`ConfigurationError::EmptyClientId`],
    ///   [`ConfigurationError::InvalidPort`], [`ConfigurationError::InvalidInterval`]
    ///   for invalid parameters
    /// * [`ConfigurationError::Certificate`] when the CA file cannot be used
    /// * [`ConfigurationError::Runtime`] when no execution context is available
    pub fn create(
        config: ConnectionConfig,
        provider: RuntimeProvider,
        sink: Option<Arc<dyn LogSink>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let transport = tls::secure_transport(&config.ca_cert_path)?;

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive)
            .set_credentials(config.username.clone(), config.password.clone())
            .set_clean_session(true)
            .set_transport(transport);

        let (handle, runtime) = provider.resolve()?.into_parts();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(MqttStatus::default());

        let handler = MqttHandler::new(
            &config,
            options,
            commands_rx,
            status_tx,
            logging::resolve(sink),
            runtime,
        );
        handle.spawn(handler.run());

        info!(
            "Created device client {} for {}:{}",
            config.client_id, config.host, config.port
        );
        Ok(DeviceClient {
            commands: commands_tx,
            status: status_rx,
            handle,
            client_id: config.client_id,
            shut_down: false,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connects with a clean session.
    pub fn connect(&self) -> Completion<()> {
        self.connect_with_session(true)
    }

    /// Connects to the broker. No retry on failure.
    pub fn connect_with_session(&self, clean_session: bool) -> Completion<()> {
        self.submit(|responder| Command::Connect {
            clean_session,
            responder,
        })
    }

    /// Sends DISCONNECT and closes the connection. Fails with
    /// [`TransportError::NotConnected`] when there is no connection.
    pub fn disconnect(&self) -> Completion<()> {
        self.submit(|responder| Command::Disconnect { responder })
    }

    /// Subscribes to all `topics` with QoS 1 in one SUBSCRIBE packet.
    ///
    /// The result carries the requested topics and the broker's SUBACK as
    /// received, including per-filter failure codes. An empty list succeeds
    /// right away with an empty SUBACK.
    pub fn subscribe<I, S>(&self, topics: I) -> Completion<Subscribed>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        self.submit(|responder| Command::Subscribe { topics, responder })
    }

    /// Publishes `message` as UTF-8 bytes with QoS 1; completes on PUBACK.
    pub fn publish(&self, message: impl Into<String>, topic: impl Into<String>) -> Completion<()> {
        let message = message.into();
        let topic = topic.into();
        self.submit(|responder| Command::Publish {
            topic,
            message,
            responder,
        })
    }

    /// Registers `listener` under `name`, replacing any listener with the same
    /// name. Listeners run on the driver task, one call per inbound message.
    pub fn register_message_listener<F>(&self, name: impl Into<String>, listener: F)
    where
        F: FnMut(Result<&InboundMessage, &TransportError>) + Send + 'static,
    {
        let command = Command::RegisterListener {
            name: name.into(),
            listener: Box::new(listener),
        };
        if self.commands.send(command).is_err() {
            debug!("Listener registration after shutdown ignored");
        }
    }

    /// Resolves to `true` if a listener was registered under `name`.
    pub fn remove_message_listener(&self, name: impl Into<String>) -> Completion<bool> {
        let name = name.into();
        self.submit(|responder| Command::RemoveListener { name, responder })
    }

    /// Publishes `response` on the response topic matching `request_topic`,
    /// see [`rpc_response_topic`].
    pub fn respond_to_rpc_request(
        &self,
        request_topic: &str,
        response: impl Into<String>,
    ) -> Completion<()> {
        let response_topic = rpc_response_topic(request_topic);
        debug!("Answering RPC {} on {}", request_topic, response_topic);
        self.publish(response, response_topic)
    }

    pub fn status(&self) -> MqttStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connection_state == ConnectionState::Connected
    }

    /// Closes the session gracefully (best-effort) and stops the driver.
    /// Always resolves `Ok`; failures while closing are only logged.
    pub fn shutdown(mut self) -> Completion<()> {
        self.shut_down = true;
        self.submit(|responder| Command::Shutdown {
            responder: Some(responder),
        })
    }

    fn submit<T>(&self, command: impl FnOnce(Responder<T>) -> Command) -> Completion<T> {
        let (responder, completion) = Completion::channel(self.handle.clone());
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command(responder)) {
            mqtt_handler::reject(command);
        }
        completion
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        if !self.shut_down {
            debug!("Dropping device client {}", self.client_id);
            let _ = self.commands.send(Command::Shutdown { responder: None });
        }
    }
}
