//! Unix socket transport.
//!
//! The listener accepts sockets; each one becomes an [`HttpConnection`] task
//! that serves a single request and either closes or is handed to the
//! WebSocket layer through an [`UpgradeHandler`].

mod connection;
mod errors;
mod listener;
mod observer;

pub use self::connection::{
    ConnectionServices, ConnectionState, HttpConnection, StateWatch, UpgradeHandler,
};
pub use self::errors::{ConnectionError, ListenerError};
pub use self::listener::SocketListener;
pub use self::observer::{ConnectionId, ConnectionObserver, LoggingObserver};

pub(crate) const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
