//! Session driver
//!
//! One [`MqttHandler`] task runs per client. It receives [`Command`]s from the
//! client facade, owns the rumqttc `AsyncClient` of the current connection and
//! matches the events of the rumqttc event loop to the operations waiting for
//! them (CONNACK to connect, PUBACK to publish, SUBACK to subscribe).
//!
//! The event loop of a connection is polled by its own pump task and its
//! events are forwarded here tagged with a generation number. A new
//! `AsyncClient`/`EventLoop` pair is created for every connect; events of an
//! older generation are ignored. The pump stops on the first engine error, so
//! rumqttc's implicit reconnect never kicks in.
//!
//! ```text
//! DeviceClient ─[Command]→ MqttHandler ─try_publish/try_subscribe→ AsyncClient
//!                               ↑                                      │
//!                               └──────[SessionEvent]── pump(EventLoop)┘
//! ```

use chrono::Local;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing,
    Packet, QoS, SubAck, SubscribeFilter,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::completion::Responder;
use super::message_manager::{ListenerRegistry, MessageListener};
use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::logging::LogSink;
use crate::runtime::SharedRuntime;

/// Capacity of rumqttc's request queue per connection
const REQUEST_CAPACITY: usize = 64;

/// How often pending operations are checked against their deadline
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Snapshot of the session, published after every change
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<Local>>,
}

/// Successful outcome of a subscribe call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribed {
    /// The topic filters as requested, in request order
    pub topics: Vec<String>,
    /// The broker's acknowledgment, forwarded unchanged
    pub ack: SubAck,
}

pub(crate) enum Command {
    Connect {
        clean_session: bool,
        responder: Responder<()>,
    },
    Disconnect {
        responder: Responder<()>,
    },
    Subscribe {
        topics: Vec<String>,
        responder: Responder<Subscribed>,
    },
    Publish {
        topic: String,
        message: String,
        responder: Responder<()>,
    },
    RegisterListener {
        name: String,
        listener: MessageListener,
    },
    RemoveListener {
        name: String,
        responder: Responder<bool>,
    },
    Shutdown {
        responder: Option<Responder<()>>,
    },
}

struct SessionEvent {
    generation: u64,
    outcome: Result<Event, TransportError>,
}

/// rumqttc client of the live connection plus the token stopping its pump
struct Session {
    client: AsyncClient,
    stop: CancellationToken,
}

struct Pending<T> {
    responder: Responder<T>,
    deadline: Instant,
}

struct PendingPublish {
    topic: String,
    message: String,
    pending: Pending<()>,
}

struct PendingSubscribe {
    topics: Vec<String>,
    pending: Pending<Subscribed>,
}

/// Operations waiting for the broker
///
/// Publishes and subscribes sit in the `unsent` queues until rumqttc reports
/// the packet id it assigned on the way out; rumqttc emits those outgoing
/// events in request order.
#[derive(Default)]
struct PendingOps {
    connect: Option<Pending<()>>,
    disconnect: Vec<Pending<()>>,
    unsent_publishes: VecDeque<PendingPublish>,
    inflight_publishes: HashMap<u16, PendingPublish>,
    unsent_subscribes: VecDeque<PendingSubscribe>,
    inflight_subscribes: HashMap<u16, PendingSubscribe>,
}

pub(crate) struct MqttHandler {
    options: MqttOptions,
    network_options: NetworkOptions,
    connect_timeout: Duration,
    operation_timeout: Duration,
    state: ConnectionState,
    status: watch::Sender<MqttStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: Option<Session>,
    generation: u64,
    pending: PendingOps,
    listeners: ListenerRegistry,
    sink: Arc<dyn LogSink>,
    shutdown: CancellationToken,
    runtime: Option<SharedRuntime>,
}

impl MqttHandler {
    pub(crate) fn new(
        config: &ConnectionConfig,
        options: MqttOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<MqttStatus>,
        sink: Arc<dyn LogSink>,
        runtime: Option<SharedRuntime>,
    ) -> Self {
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout.as_secs().max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        MqttHandler {
            options,
            network_options,
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
            state: ConnectionState::Disconnected,
            status,
            commands,
            events_tx,
            events_rx,
            session: None,
            generation: 0,
            pending: PendingOps::default(),
            listeners: ListenerRegistry::default(),
            sink,
            shutdown: CancellationToken::new(),
            runtime,
        }
    }

    /// Main loop; returns after a shutdown command or when the client is gone.
    pub(crate) async fn run(mut self) {
        debug!("Starting session driver for {}", self.options.client_id());
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_responder = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { responder }) => break responder,
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(event) = self.events_rx.recv() => self.handle_session_event(event),
                _ = sweep.tick() => self.expire_pending(),
            }
        };

        self.teardown().await;
        debug!("Session driver for {} stopped", self.options.client_id());
        if let Some(responder) = shutdown_responder {
            responder.resolve(Ok(()));
        }
        // Last reference of an owned runtime shuts it down from here.
        if let Some(runtime) = self.runtime.take() {
            runtime.release();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                clean_session,
                responder,
            } => self.start_connect(clean_session, responder),
            Command::Disconnect { responder } => self.start_disconnect(responder),
            Command::Subscribe { topics, responder } => self.start_subscribe(topics, responder),
            Command::Publish {
                topic,
                message,
                responder,
            } => self.start_publish(topic, message, responder),
            Command::RegisterListener { name, listener } => {
                self.listeners.register(name, listener);
            }
            Command::RemoveListener { name, responder } => {
                responder.resolve(Ok(self.listeners.remove(&name)));
            }
            // Handled by the main loop
            Command::Shutdown { .. } => {}
        }
    }

    fn start_connect(&mut self, clean_session: bool, responder: Responder<()>) {
        let rejection = match self.state {
            ConnectionState::Connected => Some(TransportError::AlreadyConnected),
            ConnectionState::Connecting => Some(TransportError::ConnectInProgress),
            ConnectionState::Disconnecting => Some(TransportError::DisconnectInProgress),
            ConnectionState::Disconnected => None,
        };
        if let Some(error) = rejection {
            self.sink
                .error(&format!("Error connecting to MQTT broker: {}", error));
            return responder.resolve(Err(error));
        }

        let mut options = self.options.clone();
        options.set_clean_session(clean_session);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        event_loop.set_network_options(self.network_options.clone());

        self.generation += 1;
        let stop = self.shutdown.child_token();
        tokio::spawn(pump(
            event_loop,
            self.generation,
            self.events_tx.clone(),
            stop.clone(),
        ));

        info!(
            "Connecting to {}:{} (clean session: {})",
            self.options.broker_address().0,
            self.options.broker_address().1,
            clean_session
        );
        self.session = Some(Session { client, stop });
        self.pending.connect = Some(Pending {
            responder,
            deadline: Instant::now() + self.connect_timeout,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn start_disconnect(&mut self, responder: Responder<()>) {
        match self.state {
            ConnectionState::Disconnected => {
                self.sink.error(&format!(
                    "Error disconnecting from broker: {}",
                    TransportError::NotConnected
                ));
                responder.resolve(Err(TransportError::NotConnected));
            }
            ConnectionState::Connecting => {
                // Abandon the attempt; the pending connect fails.
                self.sink.error(&format!(
                    "Error connecting to MQTT broker: {}",
                    TransportError::Disconnected
                ));
                self.end_session(TransportError::Disconnected);
                self.sink.info("Connect attempt aborted by disconnect");
                responder.resolve(Ok(()));
            }
            ConnectionState::Disconnecting => self.pending.disconnect.push(Pending {
                responder,
                deadline: Instant::now() + self.operation_timeout,
            }),
            ConnectionState::Connected => {
                let Some(session) = self.session.as_ref() else {
                    return responder.resolve(Err(TransportError::NotConnected));
                };
                match session.client.try_disconnect() {
                    Ok(()) => {
                        self.pending.disconnect.push(Pending {
                            responder,
                            deadline: Instant::now() + self.operation_timeout,
                        });
                        self.set_state(ConnectionState::Disconnecting);
                    }
                    Err(e) => {
                        let error = TransportError::from(e);
                        self.sink
                            .error(&format!("Error disconnecting from broker: {}", error));
                        responder.resolve(Err(error));
                    }
                }
            }
        }
    }

    fn start_subscribe(&mut self, topics: Vec<String>, responder: Responder<Subscribed>) {
        if topics.is_empty() {
            // Nothing to send; an empty SUBSCRIBE is a protocol violation.
            self.sink.info("Subscribed to [] successfully!");
            return responder.resolve(Ok(Subscribed {
                topics,
                ack: SubAck::new(0, Vec::new()),
            }));
        }

        let Some(session) = self.connected_session() else {
            self.sink.error(&format!(
                "Error subscribing to topics {:?}: {}",
                topics,
                TransportError::NotConnected
            ));
            return responder.resolve(Err(TransportError::NotConnected));
        };

        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
        match session.client.try_subscribe_many(filters) {
            Ok(()) => {
                debug!("Queued subscribe for {:?}", topics);
                self.pending.unsent_subscribes.push_back(PendingSubscribe {
                    topics,
                    pending: Pending {
                        responder,
                        deadline: Instant::now() + self.operation_timeout,
                    },
                });
            }
            Err(e) => {
                let error = TransportError::from(e);
                self.sink
                    .error(&format!("Error subscribing to topics {:?}: {}", topics, error));
                responder.resolve(Err(error));
            }
        }
    }

    fn start_publish(&mut self, topic: String, message: String, responder: Responder<()>) {
        let Some(session) = self.connected_session() else {
            self.sink.error(&format!(
                "Error publishing message {} to {}: {}",
                message,
                topic,
                TransportError::NotConnected
            ));
            return responder.resolve(Err(TransportError::NotConnected));
        };

        match session.client.try_publish(
            topic.clone(),
            QoS::AtLeastOnce,
            false,
            message.clone().into_bytes(),
        ) {
            Ok(()) => {
                trace!("Queued publish to {}", topic);
                self.pending.unsent_publishes.push_back(PendingPublish {
                    topic,
                    message,
                    pending: Pending {
                        responder,
                        deadline: Instant::now() + self.operation_timeout,
                    },
                });
            }
            Err(e) => {
                let error = TransportError::from(e);
                self.sink.error(&format!(
                    "Error publishing message {} to {}: {}",
                    message, topic, error
                ));
                responder.resolve(Err(error));
            }
        }
    }

    fn connected_session(&self) -> Option<&Session> {
        if self.state == ConnectionState::Connected {
            self.session.as_ref()
        } else {
            None
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        if event.generation != self.generation || self.session.is_none() {
            trace!("Ignoring event of finished session {}", event.generation);
            return;
        }

        match event.outcome {
            Ok(Event::Incoming(packet)) => self.handle_incoming(packet),
            Ok(Event::Outgoing(outgoing)) => self.handle_outgoing(outgoing),
            Err(error) => self.handle_engine_error(error),
        }
    }

    fn handle_incoming(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck(connack) => {
                if connack.code == ConnectReturnCode::Success {
                    self.set_state(ConnectionState::Connected);
                    self.sink.info("Connected to broker successfully!");
                    if let Some(pending) = self.pending.connect.take() {
                        pending.responder.resolve(Ok(()));
                    }
                } else {
                    self.handle_engine_error(TransportError::Refused(format!(
                        "{:?}",
                        connack.code
                    )));
                }
            }
            Packet::Publish(publish) => {
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                });
                if let Some(message) = self.listeners.dispatch_publish(&publish) {
                    self.sink.info(&format!(
                        "Received message {} for topic {}.",
                        message.payload, message.topic
                    ));
                } else {
                    warn!("Dropped undecodable payload on {}", publish.topic);
                }
            }
            Packet::PubAck(ack) => match self.pending.inflight_publishes.remove(&ack.pkid) {
                Some(publish) => {
                    self.status.send_modify(|status| {
                        status.messages_sent += 1;
                        status.last_activity = Some(Local::now());
                    });
                    self.sink.info(&format!(
                        "Published message {} to {} successfully!",
                        publish.message, publish.topic
                    ));
                    publish.pending.responder.resolve(Ok(()));
                }
                None => trace!("PubAck for unknown packet id {}", ack.pkid),
            },
            Packet::SubAck(ack) => match self.pending.inflight_subscribes.remove(&ack.pkid) {
                Some(subscribe) => {
                    self.sink.info(&format!(
                        "Subscribed to {:?} successfully!",
                        subscribe.topics
                    ));
                    subscribe.pending.responder.resolve(Ok(Subscribed {
                        topics: subscribe.topics,
                        ack,
                    }));
                }
                None => trace!("SubAck for unknown packet id {}", ack.pkid),
            },
            other => trace!("Incoming packet: {:?}", other),
        }
    }

    fn handle_outgoing(&mut self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Publish(pkid) => match self.pending.unsent_publishes.pop_front() {
                Some(publish) => {
                    trace!("Publish to {} sent as packet {}", publish.topic, pkid);
                    self.pending.inflight_publishes.insert(pkid, publish);
                }
                None => trace!("Outgoing publish {} without pending operation", pkid),
            },
            Outgoing::Subscribe(pkid) => match self.pending.unsent_subscribes.pop_front() {
                Some(subscribe) => {
                    self.pending.inflight_subscribes.insert(pkid, subscribe);
                }
                None => trace!("Outgoing subscribe {} without pending operation", pkid),
            },
            Outgoing::Disconnect => {
                self.end_session(TransportError::Disconnected);
                self.sink.info("Disconnected from broker, connection closed!");
                for pending in self.pending.disconnect.drain(..) {
                    pending.responder.resolve(Ok(()));
                }
            }
            other => trace!("Outgoing packet: {:?}", other),
        }
    }

    fn handle_engine_error(&mut self, error: TransportError) {
        match self.state {
            ConnectionState::Connecting => {
                self.sink
                    .error(&format!("Error connecting to MQTT broker: {}", error));
                // Resolves the pending connect with the engine error.
                self.end_session(error);
            }
            ConnectionState::Disconnecting => {
                self.sink
                    .error(&format!("Error disconnecting from broker: {}", error));
                self.end_session(TransportError::Disconnected);
                for pending in self.pending.disconnect.drain(..) {
                    pending.responder.resolve(Err(error.clone()));
                }
            }
            ConnectionState::Connected => {
                error!("Connection to broker lost: {}", error);
                self.sink
                    .error(&format!("Connection to broker lost: {}", error));
                self.end_session(TransportError::Disconnected);
                self.listeners.dispatch_error(&error);
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Stops the current pump and fails every operation still waiting on the
    /// broker (except disconnects, which the caller resolves).
    fn end_session(&mut self, reason: TransportError) {
        if let Some(session) = self.session.take() {
            session.stop.cancel();
        }
        self.set_state(ConnectionState::Disconnected);

        if let Some(pending) = self.pending.connect.take() {
            pending.responder.resolve(Err(reason.clone()));
        }
        let publishes = self
            .pending
            .unsent_publishes
            .drain(..)
            .chain(self.pending.inflight_publishes.drain().map(|(_, p)| p));
        for publish in publishes {
            publish.pending.responder.resolve(Err(reason.clone()));
        }
        let subscribes = self
            .pending
            .unsent_subscribes
            .drain(..)
            .chain(self.pending.inflight_subscribes.drain().map(|(_, s)| s));
        for subscribe in subscribes {
            subscribe.pending.responder.resolve(Err(reason.clone()));
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();

        if self
            .pending
            .connect
            .as_ref()
            .is_some_and(|pending| pending.deadline <= now)
        {
            let error = TransportError::Timeout {
                operation: "connect",
                after: self.connect_timeout,
            };
            self.handle_engine_error(error);
        }

        if self
            .pending
            .disconnect
            .iter()
            .any(|pending| pending.deadline <= now)
        {
            let error = TransportError::Timeout {
                operation: "disconnect",
                after: self.operation_timeout,
            };
            self.handle_engine_error(error);
        }

        let expired_publish = TransportError::Timeout {
            operation: "publish",
            after: self.operation_timeout,
        };
        let publishes = take_expired(
            &mut self.pending.unsent_publishes,
            &mut self.pending.inflight_publishes,
            now,
            |publish| publish.pending.deadline,
        );
        for publish in publishes {
            self.sink.error(&format!(
                "Error publishing message {} to {}: {}",
                publish.message, publish.topic, expired_publish
            ));
            publish.pending.responder.resolve(Err(expired_publish.clone()));
        }

        let expired_subscribe = TransportError::Timeout {
            operation: "subscribe",
            after: self.operation_timeout,
        };
        let subscribes = take_expired(
            &mut self.pending.unsent_subscribes,
            &mut self.pending.inflight_subscribes,
            now,
            |subscribe| subscribe.pending.deadline,
        );
        for subscribe in subscribes {
            self.sink.error(&format!(
                "Error subscribing to topics {:?}: {}",
                subscribe.topics, expired_subscribe
            ));
            subscribe
                .pending
                .responder
                .resolve(Err(expired_subscribe.clone()));
        }
    }

    /// Best-effort graceful close. Failures are logged and swallowed.
    async fn teardown(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Some(session) = self.session.as_ref() {
                match session.client.try_disconnect() {
                    Ok(()) => {
                        self.set_state(ConnectionState::Disconnecting);
                        let deadline = Instant::now() + self.operation_timeout;
                        while self.state == ConnectionState::Disconnecting {
                            match time::timeout_at(deadline, self.events_rx.recv()).await {
                                Ok(Some(event)) => self.handle_session_event(event),
                                Ok(None) => break,
                                Err(_) => {
                                    warn!("Graceful disconnect timed out during shutdown");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        self.sink
                            .error(&format!("Error disconnecting during shutdown: {}", e));
                    }
                }
            }
        }

        self.end_session(TransportError::ShutDown);
        for pending in self.pending.disconnect.drain(..) {
            pending.responder.resolve(Err(TransportError::ShutDown));
        }
        self.shutdown.cancel();
        // Commands that raced with the shutdown still get an answer.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            reject(command);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status
            .send_modify(|status| status.connection_state = state);
    }
}

/// Removes every operation past its deadline from both queues. Unsent
/// entries expire front to back since they were queued in deadline order.
fn take_expired<T>(
    unsent: &mut VecDeque<T>,
    inflight: &mut HashMap<u16, T>,
    now: Instant,
    deadline: impl Fn(&T) -> Instant,
) -> Vec<T> {
    let mut expired = Vec::new();
    while unsent.front().is_some_and(|entry| deadline(entry) <= now) {
        if let Some(entry) = unsent.pop_front() {
            expired.push(entry);
        }
    }
    let overdue: Vec<u16> = inflight
        .iter()
        .filter(|(_, entry)| deadline(entry) <= now)
        .map(|(pkid, _)| *pkid)
        .collect();
    for pkid in overdue {
        if let Some(entry) = inflight.remove(&pkid) {
            expired.push(entry);
        }
    }
    expired
}

pub(crate) fn reject(command: Command) {
    match command {
        Command::Connect { responder, .. } | Command::Disconnect { responder } => {
            responder.resolve(Err(TransportError::ShutDown))
        }
        Command::Subscribe { responder, .. } => responder.resolve(Err(TransportError::ShutDown)),
        Command::Publish { responder, .. } => responder.resolve(Err(TransportError::ShutDown)),
        Command::RemoveListener { responder, .. } => {
            responder.resolve(Err(TransportError::ShutDown))
        }
        Command::Shutdown {
            responder: Some(responder),
        } => responder.resolve(Ok(())),
        Command::RegisterListener { .. } | Command::Shutdown { responder: None } => {}
    }
}

/// Polls one connection's event loop until it fails, sends DISCONNECT or is
/// stopped. Never reconnects.
async fn pump(
    mut event_loop: EventLoop,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    stop: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = stop.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        let (outcome, finished) = match polled {
            Ok(event) => {
                let finished = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                (Ok(event), finished)
            }
            Err(e) => {
                debug!("Event loop of session {} failed: {}", generation, e);
                (Err(TransportError::from(e)), true)
            }
        };

        if events.send(SessionEvent { generation, outcome }).is_err() || finished {
            break;
        }
    }
    trace!("Pump of session {} stopped", generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::tests::RecordingSink;
    use crate::mqtt::completion::Completion;
    use crate::mqtt::message_manager::InboundMessage;
    use rumqttc::SubscribeReasonCode;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::runtime::Handle;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const SUBSCRIBE: u8 = 8;
    const PINGREQ: u8 = 12;
    const DISCONNECT: u8 = 14;

    const RPC_FILTER: &str = "v1/devices/me/rpc/request/+";
    const RPC_TOPIC: &str = "v1/devices/me/rpc/request/7";

    /// What the local broker does besides answering CONNECT and PINGREQ
    #[derive(Clone, Default)]
    struct Script {
        ack_publishes: bool,
        /// QoS 0 PUBLISH sent right after every SUBACK
        inbound: Option<(&'static str, &'static [u8])>,
        close_after_subscribe: bool,
    }

    /// Plain TCP MQTT 3.1.1 broker serving a single connection. Reports the
    /// type of every packet it reads.
    async fn local_broker(script: Script) -> (u16, mpsc::UnboundedReceiver<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = serve(stream, script, seen_tx).await;
            }
        });
        (port, seen_rx)
    }

    /// Accepts connections and never answers
    async fn silent_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    async fn serve(
        mut stream: TcpStream,
        script: Script,
        seen: mpsc::UnboundedSender<u8>,
    ) -> io::Result<()> {
        loop {
            let (header, body) = read_packet(&mut stream).await?;
            let kind = header >> 4;
            let _ = seen.send(kind);
            match kind {
                CONNECT => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?,
                PUBLISH => {
                    let qos = (header >> 1) & 0x03;
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    if qos > 0 && script.ack_publishes {
                        let pkid = &body[2 + topic_len..4 + topic_len];
                        stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await?;
                    }
                }
                SUBSCRIBE => {
                    let mut filters = 0;
                    let mut at = 2;
                    while at < body.len() {
                        let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
                        at += 2 + len + 1;
                        filters += 1;
                    }
                    let mut suback = vec![0x90, 2 + filters as u8, body[0], body[1]];
                    suback.extend(std::iter::repeat(0x01).take(filters));
                    stream.write_all(&suback).await?;

                    if let Some((topic, payload)) = script.inbound {
                        let mut publish = vec![0x30, (2 + topic.len() + payload.len()) as u8];
                        publish.extend((topic.len() as u16).to_be_bytes());
                        publish.extend(topic.as_bytes());
                        publish.extend(payload);
                        stream.write_all(&publish).await?;
                    }
                    if script.close_after_subscribe {
                        stream.flush().await?;
                        time::sleep(Duration::from_millis(200)).await;
                        return Ok(());
                    }
                }
                PINGREQ => stream.write_all(&[0xD0, 0x00]).await?,
                DISCONNECT => return Ok(()),
                _ => {}
            }
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    async fn saw_packet(seen: &mut mpsc::UnboundedReceiver<u8>, kind: u8) -> bool {
        timeout(TEST_TIMEOUT, async {
            while let Some(seen_kind) = seen.recv().await {
                if seen_kind == kind {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Driver running over plain TCP, fed directly with commands
    struct Driver {
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<MqttStatus>,
        sink: Arc<RecordingSink>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Driver {
        fn start(port: u16) -> Self {
            let config = ConnectionConfig::new(
                "127.0.0.1",
                port,
                "driver-test",
                "unused.pem",
                "token",
                "",
            )
            .with_connect_timeout(Duration::from_secs(2))
            .with_operation_timeout(Duration::from_secs(2));
            let mut options = MqttOptions::new("driver-test", "127.0.0.1", port);
            options.set_keep_alive(config.keep_alive);

            let (commands, commands_rx) = mpsc::unbounded_channel();
            let (status_tx, status) = watch::channel(MqttStatus::default());
            let sink = Arc::new(RecordingSink::default());
            let handler = MqttHandler::new(
                &config,
                options,
                commands_rx,
                status_tx,
                sink.clone(),
                None,
            );
            let task = tokio::spawn(handler.run());
            Driver {
                commands,
                status,
                sink,
                task,
            }
        }

        fn call<T>(&self, command: impl FnOnce(Responder<T>) -> Command) -> Completion<T> {
            let (responder, completion) = Completion::channel(Handle::current());
            assert!(self.commands.send(command(responder)).is_ok());
            completion
        }

        fn connect(&self) -> Completion<()> {
            self.call(|responder| Command::Connect {
                clean_session: true,
                responder,
            })
        }

        fn disconnect(&self) -> Completion<()> {
            self.call(|responder| Command::Disconnect { responder })
        }

        fn subscribe(&self, topics: &[&str]) -> Completion<Subscribed> {
            let topics = topics.iter().map(|topic| topic.to_string()).collect();
            self.call(|responder| Command::Subscribe { topics, responder })
        }

        fn publish(&self, message: &str) -> Completion<()> {
            self.call(|responder| Command::Publish {
                topic: "v1/devices/me/telemetry".to_string(),
                message: message.to_string(),
                responder,
            })
        }

        fn shutdown(&self) -> Completion<()> {
            self.call(|responder| Command::Shutdown {
                responder: Some(responder),
            })
        }

        fn listen(&self, name: &str) -> mpsc::UnboundedReceiver<Result<String, String>> {
            let (tx, rx) = mpsc::unbounded_channel();
            let listener: MessageListener =
                Box::new(move |event: Result<&InboundMessage, &TransportError>| {
                    let _ = tx.send(
                        event
                            .map(|message| format!("{} {}", message.topic, message.payload))
                            .map_err(|error| error.to_string()),
                    );
                });
            assert!(self
                .commands
                .send(Command::RegisterListener {
                    name: name.to_string(),
                    listener,
                })
                .is_ok());
            rx
        }
    }

    async fn settle<T>(completion: Completion<T>) -> Result<T, TransportError> {
        timeout(TEST_TIMEOUT, completion).await.unwrap()
    }

    #[tokio::test]
    async fn session_round_trip_matches_acks_and_dispatches_inbound() {
        let (port, mut seen) = local_broker(Script {
            ack_publishes: true,
            inbound: Some((RPC_TOPIC, br#"{"method":"ping"}"#)),
            close_after_subscribe: false,
        })
        .await;
        let driver = Driver::start(port);
        let mut inbound = driver.listen("rpc");

        assert_eq!(settle(driver.connect()).await, Ok(()));
        assert_eq!(
            driver.status.borrow().connection_state,
            ConnectionState::Connected
        );

        let subscribed = settle(driver.subscribe(&[RPC_FILTER])).await.unwrap();
        assert_eq!(subscribed.topics, vec![RPC_FILTER.to_string()]);
        assert_eq!(
            subscribed.ack.return_codes,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]
        );

        let first = driver.publish(r#"{"n":1}"#);
        let second = driver.publish(r#"{"n":2}"#);
        let third = driver.publish(r#"{"n":3}"#);
        assert_eq!(settle(first).await, Ok(()));
        assert_eq!(settle(second).await, Ok(()));
        assert_eq!(settle(third).await, Ok(()));

        let message = timeout(TEST_TIMEOUT, inbound.recv()).await.unwrap();
        assert_eq!(
            message,
            Some(Ok(format!("{} {}", RPC_TOPIC, r#"{"method":"ping"}"#)))
        );

        assert_eq!(settle(driver.disconnect()).await, Ok(()));
        let status = driver.status.borrow().clone();
        assert_eq!(status.connection_state, ConnectionState::Disconnected);
        assert_eq!(status.messages_sent, 3);
        assert_eq!(status.messages_received, 1);
        assert!(saw_packet(&mut seen, DISCONNECT).await);
        assert!(driver.sink.errors().is_empty(), "{:?}", driver.sink.errors());
    }

    #[tokio::test]
    async fn registering_same_name_replaces_listener() {
        let (port, _seen) = local_broker(Script {
            inbound: Some((RPC_TOPIC, b"{}")),
            ..Script::default()
        })
        .await;
        let driver = Driver::start(port);
        let mut replaced = driver.listen("rpc");
        let mut current = driver.listen("rpc");

        settle(driver.connect()).await.unwrap();
        settle(driver.subscribe(&[RPC_FILTER])).await.unwrap();

        let message = timeout(TEST_TIMEOUT, current.recv()).await.unwrap();
        assert_eq!(message, Some(Ok(format!("{} {{}}", RPC_TOPIC))));
        // The replaced listener was dropped without ever being called.
        assert_eq!(replaced.recv().await, None);
    }

    #[tokio::test]
    async fn disconnect_right_after_unacked_publish_completes_both() {
        let (port, mut seen) = local_broker(Script::default()).await;
        let driver = Driver::start(port);
        settle(driver.connect()).await.unwrap();

        let publish = driver.publish(r#"{"pending":true}"#);
        let disconnect = driver.disconnect();

        assert_eq!(settle(disconnect).await, Ok(()));
        assert_eq!(settle(publish).await, Err(TransportError::Disconnected));
        assert!(saw_packet(&mut seen, DISCONNECT).await);
    }

    #[tokio::test]
    async fn broker_closing_socket_reaches_listeners() {
        let (port, _seen) = local_broker(Script {
            inbound: Some((RPC_TOPIC, b"{}")),
            close_after_subscribe: true,
            ..Script::default()
        })
        .await;
        let mut driver = Driver::start(port);
        let mut inbound = driver.listen("rpc");

        settle(driver.connect()).await.unwrap();
        settle(driver.subscribe(&[RPC_FILTER])).await.unwrap();

        let message = timeout(TEST_TIMEOUT, inbound.recv()).await.unwrap();
        assert!(matches!(message, Some(Ok(_))), "{:?}", message);
        let lost = timeout(TEST_TIMEOUT, inbound.recv()).await.unwrap();
        assert!(matches!(lost, Some(Err(_))), "{:?}", lost);

        timeout(
            TEST_TIMEOUT,
            driver
                .status
                .wait_for(|status| status.connection_state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            settle(driver.publish("{}")).await,
            Err(TransportError::NotConnected)
        );
        assert!(driver
            .sink
            .errors()
            .iter()
            .any(|line| line.starts_with("Connection to broker lost")));
    }

    #[tokio::test]
    async fn shutdown_while_connected_sends_disconnect() {
        let (port, mut seen) = local_broker(Script::default()).await;
        let driver = Driver::start(port);
        settle(driver.connect()).await.unwrap();

        assert_eq!(settle(driver.shutdown()).await, Ok(()));
        assert!(saw_packet(&mut seen, DISCONNECT).await);
        timeout(TEST_TIMEOUT, driver.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected_and_logged() {
        let (port, _seen) = local_broker(Script::default()).await;
        let driver = Driver::start(port);
        settle(driver.connect()).await.unwrap();

        assert_eq!(
            settle(driver.connect()).await,
            Err(TransportError::AlreadyConnected)
        );
        assert_eq!(
            driver.sink.errors(),
            vec![format!(
                "Error connecting to MQTT broker: {}",
                TransportError::AlreadyConnected
            )]
        );
    }

    #[tokio::test]
    async fn connect_during_disconnect_is_rejected() {
        let (port, _seen) = local_broker(Script::default()).await;
        let driver = Driver::start(port);
        settle(driver.connect()).await.unwrap();

        // Both commands are queued before the driver sees the DISCONNECT go out.
        let disconnect = driver.disconnect();
        let reconnect = driver.connect();

        assert_eq!(
            settle(reconnect).await,
            Err(TransportError::DisconnectInProgress)
        );
        assert_eq!(settle(disconnect).await, Ok(()));
    }

    #[tokio::test]
    async fn aborted_and_overlapping_connects_are_logged() {
        let driver = Driver::start(silent_broker().await);

        let first = driver.connect();
        let second = driver.connect();
        let disconnect = driver.disconnect();

        assert_eq!(settle(second).await, Err(TransportError::ConnectInProgress));
        assert_eq!(settle(disconnect).await, Ok(()));
        assert_eq!(settle(first).await, Err(TransportError::Disconnected));

        let errors = driver.sink.errors();
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors
            .iter()
            .all(|line| line.starts_with("Error connecting to MQTT broker")));
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_logged() {
        let driver = Driver::start(silent_broker().await);

        assert_eq!(
            settle(driver.disconnect()).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            driver.sink.errors(),
            vec![format!(
                "Error disconnecting from broker: {}",
                TransportError::NotConnected
            )]
        );
    }
}
