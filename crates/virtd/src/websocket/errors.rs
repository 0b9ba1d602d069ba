//! WebSocket failures.

use thiserror::Error;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite;

use crate::transport::ConnectionId;

/// Errors raised by a WebSocket session or a send into one.
#[derive(Debug, Error)]
pub enum WebSocketError {
    /// The protocol layer failed reading or writing a frame.
    #[error("websocket protocol error: {source}")]
    Protocol {
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// The session has ended and accepts no more frames.
    #[error("websocket connection {connection} is closed")]
    Closed { connection: ConnectionId },
    /// A broadcast payload could not be serialised.
    #[error("failed to encode websocket payload: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    /// The writer task panicked or was cancelled.
    #[error("websocket writer task failed: {source}")]
    Writer {
        #[source]
        source: JoinError,
    },
}

impl From<tungstenite::Error> for WebSocketError {
    fn from(source: tungstenite::Error) -> Self {
        Self::Protocol {
            source: Box::new(source),
        }
    }
}
