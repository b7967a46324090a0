//! Subscriber-visible notifications and the fan-out bus that carries them

use crate::error::ClientError;
use crate::throttle::ThrottleNotice;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered notifications per subscriber before the slowest one starts lagging
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Everything a subscriber can observe about the connection
#[derive(Debug, Clone)]
pub enum Notification {
    Connected,
    Disconnected,
    Reconnected,
    Error {
        error: Arc<ClientError>,
    },
    Fatal {
        reason: String,
        error: Option<Arc<ClientError>>,
    },
    /// One received line
    Message {
        line: String,
    },
    SendFailed {
        error: Arc<ClientError>,
        message: String,
    },
    StateChanged {
        is_connected: bool,
        was_connected: bool,
    },
    Throttled(ThrottleNotice),
}

impl Notification {
    pub fn error(error: ClientError) -> Self {
        Self::Error {
            error: Arc::new(error),
        }
    }

    pub fn fatal<S: Into<String>>(reason: S, error: Option<Arc<ClientError>>) -> Self {
        Self::Fatal {
            reason: reason.into(),
            error,
        }
    }

    /// Short stable name, used in logs and by tests
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Connected => "connected",
            Notification::Disconnected => "disconnected",
            Notification::Reconnected => "reconnected",
            Notification::Error { .. } => "error",
            Notification::Fatal { .. } => "fatal",
            Notification::Message { .. } => "message",
            Notification::SendFailed { .. } => "send_failed",
            Notification::StateChanged { .. } => "state_changed",
            Notification::Throttled(_) => "throttled",
        }
    }

    /// Notifications that describe a close itself and are never suppressed
    pub fn is_teardown(&self) -> bool {
        matches!(self, Notification::Disconnected)
    }
}

/// Fire-and-forget broadcast to zero or more subscribers
///
/// Emitting never waits: a subscriber that falls more than
/// [`EVENT_BUS_CAPACITY`] notifications behind sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        // No subscribers is not an error
        let _ = self.tx.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
