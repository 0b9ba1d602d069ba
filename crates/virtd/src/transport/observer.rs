//! Connection lifecycle callbacks.

use tracing::{debug, warn};

use super::{ConnectionError, LISTENER_TARGET};

/// Identifier assigned to each accepted connection.
pub type ConnectionId = u64;

/// Receives the terminal event of every accepted connection.
///
/// Exactly one of the two callbacks fires per plain HTTP connection. An
/// upgraded connection reports through the WebSocket session instead and may
/// raise further errors for failed broadcasts.
pub trait ConnectionObserver: Send + Sync {
    /// The connection finished normally or hit its idle deadline.
    fn on_close(&self, connection: ConnectionId);

    /// The connection failed. The client only sees the socket drop.
    fn on_error(&self, connection: ConnectionId, error: &ConnectionError);
}

/// Observer that records terminal events in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_close(&self, connection: ConnectionId) {
        debug!(target: LISTENER_TARGET, connection, "connection closed");
    }

    fn on_error(&self, connection: ConnectionId, error: &ConnectionError) {
        warn!(target: LISTENER_TARGET, connection, %error, "connection failed");
    }
}
