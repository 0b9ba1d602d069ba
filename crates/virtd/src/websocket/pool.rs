//! Per-user registry of live WebSocket connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use super::{WEBSOCKET_TARGET, WebSocketConnection, WebSocketError};

type Members = HashMap<String, Vec<Arc<WebSocketConnection>>>;

/// Live WebSocket connections grouped by the user they subscribed for.
#[derive(Debug, Default)]
pub struct WebSocketPool {
    members: Mutex<Members>,
}

impl WebSocketPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection` under its user.
    pub fn add(&self, connection: Arc<WebSocketConnection>) {
        let user = connection.user().to_owned();
        let mut members = self.lock();
        let list = members.entry(user).or_default();
        list.push(connection);
        debug!(target: WEBSOCKET_TARGET, subscribers = list.len(), "websocket registered");
    }

    /// Removes exactly `connection`, compared by identity. Returns the number
    /// of connections the user still has.
    pub fn remove(&self, connection: &Arc<WebSocketConnection>) -> usize {
        let mut members = self.lock();
        let Some(list) = members.get_mut(connection.user()) else {
            return 0;
        };
        list.retain(|member| !Arc::ptr_eq(member, connection));
        let remaining = list.len();
        if remaining == 0 {
            members.remove(connection.user());
        }
        remaining
    }

    /// Number of connections registered for `user`.
    #[must_use]
    pub fn count(&self, user: &str) -> usize {
        self.lock().get(user).map_or(0, Vec::len)
    }

    /// Serialises `payload` once and queues it on every connection registered
    /// for `user`. Returns how many accepted it.
    ///
    /// A connection that refuses the frame reports through its own observer
    /// and does not affect delivery to the rest.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::Encode`] when `payload` cannot be serialised;
    /// nothing is sent in that case.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        user: &str,
        payload: &T,
    ) -> Result<usize, WebSocketError> {
        let text =
            serde_json::to_string(payload).map_err(|source| WebSocketError::Encode { source })?;
        let recipients: Vec<_> = self
            .lock()
            .get(user)
            .map(|list| list.iter().map(Arc::clone).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for connection in recipients {
            match connection.send_text(&text) {
                Ok(()) => delivered += 1,
                Err(error) => connection.report(error),
            }
        }
        debug!(target: WEBSOCKET_TARGET, user, delivered, "broadcast queued");
        Ok(delivered)
    }

    /// Closes every registered connection. Sessions remove themselves as
    /// they wind down.
    pub fn close_all(&self) {
        let connections: Vec<_> = self.lock().values().flatten().map(Arc::clone).collect();
        for connection in connections {
            connection.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
