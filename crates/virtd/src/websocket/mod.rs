//! Upgraded WebSocket sessions and the per-user broadcast pool.

mod connection;
mod errors;
mod pool;

pub use self::connection::{WebSocketConnection, serve_session};
pub use self::errors::WebSocketError;
pub use self::pool::WebSocketPool;

pub(crate) const WEBSOCKET_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::websocket");
