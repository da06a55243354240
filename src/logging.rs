//! Logging capability injected into the client
//!
//! Operation outcomes (connected, subscribed, publish failed, ...) are written
//! to a [`LogSink`]. A client is built with zero or one sink; without one the
//! [`NoopSink`] is used so call sites never branch on its presence. Internal
//! diagnostics always go through `tracing` regardless of the sink.

use std::sync::Arc;
use tracing::{error, info};

/// Receiver for the client's operation log lines
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards log lines to `tracing` tagged with a label
#[derive(Debug, Clone)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new("tb-device-client")
    }
}

impl LogSink for TracingSink {
    fn info(&self, message: &str) {
        info!(label = %self.label, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(label = %self.label, "{}", message);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

pub(crate) fn resolve(sink: Option<Arc<dyn LogSink>>) -> Arc<dyn LogSink> {
    sink.unwrap_or_else(|| Arc::new(NoopSink))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every line, shared with the other test modules
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) lines: Mutex<Vec<(bool, String)>>,
    }

    impl RecordingSink {
        pub(crate) fn errors(&self) -> Vec<String> {
            self.lines
                .lock()
                .map(|lines| {
                    lines
                        .iter()
                        .filter(|(is_error, _)| *is_error)
                        .map(|(_, line)| line.clone())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    impl LogSink for RecordingSink {
        fn info(&self, message: &str) {
            if let Ok(mut lines) = self.lines.lock() {
                lines.push((false, message.to_string()));
            }
        }

        fn error(&self, message: &str) {
            if let Ok(mut lines) = self.lines.lock() {
                lines.push((true, message.to_string()));
            }
        }
    }

    #[test]
    fn missing_sink_resolves_to_noop() {
        let sink = resolve(None);
        sink.info("ignored");
        sink.error("ignored");
    }

    #[test]
    fn supplied_sink_is_kept() {
        let recording = Arc::new(RecordingSink::default());
        let sink = resolve(Some(recording.clone()));
        sink.info("one");
        sink.error("two");
        assert_eq!(recording.errors(), vec!["two".to_string()]);
        assert_eq!(recording.lines.lock().unwrap().len(), 2);
    }
}
