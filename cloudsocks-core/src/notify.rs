//! Notification sinks for user-visible session messages
//!
//! The controller reports every state change and failure as a line of text.
//! Front ends decide where the lines go: an in-memory event log, a channel
//! drained by a UI task, or the tracing output.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receives user-visible messages in the order they occur
pub trait Notifier: Send + Sync {
    fn on_log(&self, message: &str);
}

impl<F> Notifier for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_log(&self, message: &str) {
        self(message)
    }
}

/// A message with the time it was reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            message: message.into(),
        }
    }
}

/// Append-only in-memory log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry::now(text));
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Just the message texts, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }
}

impl Notifier for EventLog {
    fn on_log(&self, message: &str) {
        self.append(message);
    }
}

/// Forwards messages to a UI task over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn on_log(&self, message: &str) {
        // Receiver gone means the UI has shut down
        let _ = self.tx.send(LogEntry::now(message));
    }
}

/// Writes messages to the tracing output
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_log(&self, message: &str) {
        tracing::info!(target: "cloudsocks::session", "{}", message);
    }
}
