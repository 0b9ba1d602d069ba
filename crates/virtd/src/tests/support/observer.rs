//! Connection observer that records terminal events.

use std::sync::Mutex;

use crate::transport::{ConnectionError, ConnectionId, ConnectionObserver};

/// Terminal event seen by [`RecordingObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedEvent {
    /// `on_close` fired for the connection.
    Closed(ConnectionId),
    /// `on_error` fired for the connection.
    Failed(ConnectionId),
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    /// Events in the order they fired.
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().expect("observer mutex poisoned").clone()
    }

    fn record(&self, event: ObservedEvent) {
        self.events
            .lock()
            .expect("observer mutex poisoned")
            .push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_close(&self, connection: ConnectionId) {
        self.record(ObservedEvent::Closed(connection));
    }

    fn on_error(&self, connection: ConnectionId, _error: &ConnectionError) {
        self.record(ObservedEvent::Failed(connection));
    }
}
