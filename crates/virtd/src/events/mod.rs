//! Hypervisor event subscriptions delivered over WebSockets.
//!
//! [`LifecycleBridge`] runs the hypervisor's event loop on a dedicated thread.
//! [`Subscriptions`] keeps one lifecycle callback per user with an open
//! socket; each callback snapshots the affected domain and broadcasts it
//! through the [`crate::websocket::WebSocketPool`].

mod bridge;
mod errors;
mod registry;
mod subscriptions;

pub use self::bridge::LifecycleBridge;
pub use self::errors::BridgeError;
pub use self::registry::{Event, EventKind, EventsRegistry};
pub use self::subscriptions::{LifecycleMessage, Subscriptions};

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");
