//! Event protocol pushed from discovery and SSH sessions to the front-end.
//!
//! Every notification is one variant of the closed [`Event`] enum.  Producers
//! hold an `Arc<dyn EventSink>` and never know who consumes the events: the
//! CLI prints them, a GUI would forward them to its web view, tests record
//! them.
//!
//! The serde representation is internally tagged so a JSON consumer sees
//! `{"event":"device_found","alias":"Device 1 (LAN)",...}`.

use serde::{Deserialize, Serialize};

/// Severity attached to [`Event::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// A notification from the discovery engine or a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Human-readable log line.
    Log { message: String, level: LogLevel },
    /// Installation step progress, e.g. `(3, 8, "Step 3/8")`.
    Progress {
        current: u32,
        total: u32,
        label: String,
    },
    /// A device (or a new address of a known device) was found.
    DeviceFound {
        alias: String,
        address: String,
        webapp_reachable: bool,
    },
    /// An address of an evicted device disappeared.
    DeviceGone { address: String },
    /// Current reachability of the device's management web UI.
    WebappStatus { address: String, reachable: bool },
}

impl Event {
    pub fn log(message: impl Into<String>, level: LogLevel) -> Self {
        Self::Log {
            message: message.into(),
            level,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::log(message, LogLevel::Info)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::log(message, LogLevel::Warning)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::log(message, LogLevel::Error)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::log(message, LogLevel::Success)
    }
}

/// Receiver of [`Event`]s.
///
/// Implementations must be cheap and non-blocking: events are emitted from
/// discovery worker threads and SSH polling loops.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event);
    }
}

/// Events sent after the receiver is dropped are discarded.
impl EventSink for std::sync::mpsc::Sender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// A full channel drops the event instead of blocking the producer.
impl EventSink for std::sync::mpsc::SyncSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.try_send(event);
    }
}

#[cfg(feature = "tokio")]
impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_device_found_serializes_with_event_tag() {
        // Arrange
        let event = Event::DeviceFound {
            alias: "Device 1 (LAN)".to_string(),
            address: "10.0.0.5".to_string(),
            webapp_reachable: true,
        };

        // Act
        let json = serde_json::to_value(&event).unwrap();

        // Assert
        assert_eq!(json["event"], "device_found");
        assert_eq!(json["alias"], "Device 1 (LAN)");
        assert_eq!(json["webapp_reachable"], true);
    }

    #[test]
    fn test_log_level_serializes_lowercase() {
        let json = serde_json::to_value(Event::warning("careful")).unwrap();
        assert_eq!(json["event"], "log");
        assert_eq!(json["level"], "warning");
    }

    #[test]
    fn test_closure_is_an_event_sink() {
        // Arrange
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink: Arc<dyn EventSink> = Arc::new(move |e: Event| seen_clone.lock().unwrap().push(e));

        // Act
        sink.emit(Event::DeviceGone {
            address: "10.0.0.5".to_string(),
        });

        // Assert
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_std_sender_sink_forwards_without_tokio() {
        // Arrange
        let (tx, rx) = std::sync::mpsc::channel();
        let (sync_tx, sync_rx) = std::sync::mpsc::sync_channel(1);

        // Act
        tx.emit(Event::info("plain"));
        sync_tx.emit(Event::info("bounded"));
        sync_tx.emit(Event::info("dropped when full"));

        // Assert
        assert_eq!(rx.try_recv().unwrap(), Event::info("plain"));
        assert_eq!(sync_rx.try_iter().collect::<Vec<_>>(), vec![Event::info("bounded")]);
    }

    #[cfg(feature = "tokio")]
    #[test]
    fn test_unbounded_sender_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.emit(Event::info("hello"));
        assert_eq!(rx.try_recv().unwrap(), Event::info("hello"));
    }

    #[cfg(feature = "tokio")]
    #[test]
    fn test_sink_ignores_dropped_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        drop(rx);
        tx.emit(Event::info("nobody listening"));
    }
}
