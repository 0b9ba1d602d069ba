//! Error types for the socket listener and per-connection I/O.

use std::io;

use thiserror::Error;

use crate::hypervisor::HypervisorError;
use crate::websocket::WebSocketError;

/// Errors surfaced while binding the socket listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind unix listener at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to register unix listener at {path} with the reactor: {source}")]
    Register {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("existing unix socket {path} is already in use")]
    InUse { path: String },
    #[error("unix socket path {path} is not a socket")]
    NotSocket { path: String },
    #[error("failed to read metadata for unix socket {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to existing unix socket {path}: {source}")]
    LivenessCheck {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale unix socket {path}: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Errors that end a single accepted connection.
///
/// Reported through [`super::ConnectionObserver::on_error`]; never written to
/// the client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Reading the request or writing the response failed.
    #[error("http exchange failed: {source}")]
    Http {
        #[source]
        source: hyper::Error,
    },
    /// The WebSocket handshake did not complete.
    #[error("websocket handshake failed: {source}")]
    Handshake {
        #[source]
        source: WebSocketError,
    },
    /// The lifecycle subscription behind an upgraded socket could not be
    /// registered.
    #[error("failed to subscribe to lifecycle events: {source}")]
    Subscribe {
        #[source]
        source: HypervisorError,
    },
    /// An upgraded session failed.
    #[error("websocket session failed: {source}")]
    WebSocket {
        #[source]
        source: WebSocketError,
    },
}
