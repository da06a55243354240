use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Characters of payload shown by the `Display` impl
const PREVIEW_LEN: usize = 10;

/// A PUBLISH received from the broker with its payload decoded as UTF-8
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(PREVIEW_LEN).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            received_at: Local::now(),
        }
    }

    pub(crate) fn from_publish(publish: &rumqttc::Publish) -> Result<Self, TransportError> {
        let payload = String::from_utf8(publish.payload.to_vec()).map_err(|e| {
            TransportError::InvalidPayload {
                topic: publish.topic.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(InboundMessage {
            topic: publish.topic.clone(),
            payload,
            retain: publish.retain,
            received_at: Local::now(),
        })
    }
}

/// Callback invoked for every inbound message, or for an error affecting
/// message delivery (undecodable payload, lost connection)
pub type MessageListener = Box<dyn FnMut(Result<&InboundMessage, &TransportError>) + Send>;

/// Named message listeners of one client
///
/// Names are unique: registering under a taken name replaces the old
/// listener, so a message is delivered at most once per name.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: HashMap<String, MessageListener>,
}

impl ListenerRegistry {
    /// Returns `true` when an existing listener was replaced.
    pub(crate) fn register(&mut self, name: String, listener: MessageListener) -> bool {
        let replaced = self.listeners.insert(name.clone(), listener).is_some();
        debug!("Registered message listener '{}' (replaced: {})", name, replaced);
        replaced
    }

    pub(crate) fn remove(&mut self, name: &str) -> bool {
        self.listeners.remove(name).is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn dispatch_message(&mut self, message: &InboundMessage) {
        trace!(
            "Dispatching message on {} to {} listener(s)",
            message.topic,
            self.listeners.len()
        );
        for listener in self.listeners.values_mut() {
            listener(Ok(message));
        }
    }

    pub(crate) fn dispatch_error(&mut self, error: &TransportError) {
        for listener in self.listeners.values_mut() {
            listener(Err(error));
        }
    }

    /// Decodes a PUBLISH and forwards the outcome to every listener.
    pub(crate) fn dispatch_publish(
        &mut self,
        publish: &rumqttc::Publish,
    ) -> Option<InboundMessage> {
        match InboundMessage::from_publish(publish) {
            Ok(message) => {
                self.dispatch_message(&message);
                Some(message)
            }
            Err(error) => {
                self.dispatch_error(&error);
                None
            }
        }
    }
}
