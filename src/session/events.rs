//! Typed signals emitted to the surrounding application, and the cloud-event
//! payloads delivered to subscription handlers.

use tokio::sync::broadcast;

use crate::core::{TransportError, RESERVED_EVENT_PREFIXES};

/// Classification of a connection failure, surfaced with `ConnectionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// DNS lookup produced no address.
    DnsNotFound,
    /// The endpoint refused the connection.
    ConnectionRefused,
    /// Anything else (timeouts, resets, handshake failures).
    Other,
}

impl ConnectionErrorKind {
    /// Classify a transport error per the reconnect policy.
    pub fn classify(err: &TransportError) -> Self {
        match err {
            TransportError::DnsNotFound(_) => Self::DnsNotFound,
            TransportError::ConnectionRefused(_) => Self::ConnectionRefused,
            _ => Self::Other,
        }
    }
}

/// An event delivered by the cloud to a device subscription.
#[derive(Debug, Clone)]
pub struct CloudEvent {
    /// Full event name (slash-separated path).
    pub name: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// Whether it arrived on the private-event URI.
    pub private: bool,
}

/// Signals the session engine emits to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt started.
    Connect,
    /// Handshake finished and the post-connect sequence ran.
    Connected,
    /// The session was torn down by user request.
    Disconnect,
    /// The session died and a reconnect is scheduled.
    Reconnect,
    /// A connection attempt or live session failed.
    ConnectionError {
        /// Failure classification.
        kind: ConnectionErrorKind,
        /// Human-readable cause.
        message: String,
    },
    /// A non-fatal protocol or callback error.
    Error {
        /// Human-readable cause.
        message: String,
    },
    /// An event was published (reserved prefixes are suppressed).
    Publish {
        /// Event name.
        name: String,
        /// Event payload.
        data: Vec<u8>,
    },
    /// A confirmable publish finished.
    PublishCompleted {
        /// Event name.
        name: String,
        /// Whether the ACK arrived in time.
        success: bool,
    },
    /// A subscription was acknowledged by the cloud.
    Subscribe {
        /// Subscribed event-name prefix.
        name: String,
    },
    /// Cloud time sync arrived.
    Time {
        /// Seconds since the Unix epoch.
        epoch_seconds: u64,
    },
    /// Server-requested signal/LED indication.
    Signal {
        /// Indication on or off.
        on: bool,
    },
    /// Cloud requested a DFU reset.
    Dfu,
    /// Cloud requested a safe-mode reset.
    SafeMode,
    /// Cloud requested a reboot.
    Reboot,
    /// The updates-forced flag changed.
    FirmwareUpdateForced {
        /// New flag value.
        forced: bool,
    },
    /// A firmware update is pending on the cloud side.
    FirmwareUpdatePending,
    /// A named file transfer completed inbound.
    FileReceived {
        /// Registered file name.
        name: String,
        /// Reassembled contents.
        data: Vec<u8>,
    },
    /// A named file transfer completed outbound.
    FileSent {
        /// Requested file name.
        name: String,
    },
    /// A validated firmware image arrived, header and trailer stripped.
    OtaReceived {
        /// The inner image bytes.
        image: Vec<u8>,
    },
}

/// Broadcast fan-out of [`Event`] to the application.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given buffered depth.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event; silently dropped when nobody listens.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Emit a non-fatal error signal.
    pub fn emit_error(&self, message: impl Into<String>) {
        self.emit(Event::Error {
            message: message.into(),
        });
    }

    /// Attach a new application listener.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Whether an event name carries a reserved system prefix.
pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_EVENT_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Whether a registered subscription prefix matches an incoming event name.
///
/// `a`, `a/b`, and `a/b/c` all match an incoming `a/b/c`.
pub fn prefix_matches(registered: &str, incoming: &str) -> bool {
    incoming.starts_with(registered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_errors() {
        assert_eq!(
            ConnectionErrorKind::classify(&TransportError::DnsNotFound("x".into())),
            ConnectionErrorKind::DnsNotFound
        );
        assert_eq!(
            ConnectionErrorKind::classify(&TransportError::ConnectionRefused("x".into())),
            ConnectionErrorKind::ConnectionRefused
        );
        assert_eq!(
            ConnectionErrorKind::classify(&TransportError::SocketTimeout),
            ConnectionErrorKind::Other
        );
    }

    #[test]
    fn reserved_prefixes_cover_both_brands() {
        assert!(is_reserved_name("iotready/device/reset"));
        assert!(is_reserved_name("trackle/device/owners"));
        assert!(!is_reserved_name("sensor/temp"));
    }

    #[test]
    fn prefix_matching_includes_every_ancestor() {
        for registered in ["a", "a/b", "a/b/c"] {
            assert!(prefix_matches(registered, "a/b/c"), "{registered}");
        }
        assert!(!prefix_matches("a/b/c/d", "a/b/c"));
        assert!(!prefix_matches("b", "a/b/c"));
    }

    #[tokio::test]
    async fn bus_fans_out_to_listeners() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(Event::Connected);
        match rx.recv().await.unwrap() {
            Event::Connected => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
