//! WebSocket subscribers and the lifecycle callbacks that feed them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hyper_tungstenite::HyperWebsocket;
use serde::Serialize;
use tokio::task;
use tracing::{debug, error, warn};

use crate::hypervisor::{
    ConnectionPool, Domain, DomainSnapshot, HypervisorError, LifecycleCallback, LifecycleEvent,
    LifecycleKind, ReconnectListener,
};
use crate::transport::{ConnectionError, ConnectionId, ConnectionObserver, UpgradeHandler};
use crate::users::UserAccount;
use crate::websocket::{WebSocketConnection, WebSocketError, WebSocketPool, serve_session};

use super::{EVENTS_TARGET, Event, EventKind, EventsRegistry};

/// Frame broadcast to a user's sockets for every lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleMessage {
    /// What happened.
    pub event: LifecycleKind,
    /// Kind-specific detail code.
    pub detail: i32,
    /// The domain after the change.
    pub domain: DomainSnapshot,
}

/// Owns every user's [`EventsRegistry`] and serves upgraded sockets.
///
/// A user holds one lifecycle callback while at least one of their sockets is
/// open. The callback is registered when the first socket attaches and
/// dropped, which deregisters it, when the last one detaches. When the pool
/// replaces a dead session the callback is registered again on the new one.
pub struct Subscriptions {
    pool: Arc<ConnectionPool>,
    sockets: Arc<WebSocketPool>,
    observer: Arc<dyn ConnectionObserver>,
    registries: Mutex<HashMap<String, Arc<EventsRegistry>>>,
}

impl Subscriptions {
    /// Creates an empty subscription table.
    pub fn new(
        pool: Arc<ConnectionPool>,
        sockets: Arc<WebSocketPool>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            pool,
            sockets,
            observer,
            registries: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `connection` to the socket pool and makes sure its user has a live
    /// lifecycle callback. Blocking: calls into the hypervisor.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::NotConnected`] when the user's session is
    /// gone, or the binding's registration failure. The socket is not left in
    /// the pool on error.
    pub fn attach(&self, connection: &Arc<WebSocketConnection>) -> Result<(), HypervisorError> {
        self.sockets.add(Arc::clone(connection));
        let subscribed = self.subscribe(connection.user());
        if subscribed.is_err() {
            self.detach(connection);
        }
        subscribed
    }

    /// Removes `connection`; drops the user's callbacks when it was their last
    /// socket. Blocking: deregistration calls into the hypervisor.
    pub fn detach(&self, connection: &Arc<WebSocketConnection>) {
        let released = {
            let mut registries = self.lock();
            if self.sockets.remove(connection) == 0 {
                registries.remove(connection.user())
            } else {
                None
            }
        };
        if let Some(registry) = released {
            registry.clear();
            debug!(
                target: EVENTS_TARGET,
                user = connection.user(),
                "last subscriber left; events released"
            );
        }
    }

    /// Users with at least one registered event.
    #[must_use]
    pub fn subscribed_users(&self) -> usize {
        self.lock()
            .values()
            .filter(|registry| !registry.is_empty())
            .count()
    }

    /// Deregisters every callback. Sockets stay open until closed separately.
    pub fn clear(&self) {
        let registries: Vec<_> = self.lock().drain().map(|(_, registry)| registry).collect();
        for registry in registries {
            registry.clear();
        }
    }

    fn subscribe(&self, user: &str) -> Result<(), HypervisorError> {
        let registry = Arc::clone(self.lock().entry(user.to_owned()).or_default());
        if registry.is_live(EventKind::Lifecycle) {
            return Ok(());
        }
        let connection = self.pool.get(user);
        // Getting the connection may have reconnected it, and the reconnect
        // hook registers on the new session itself.
        if registry.is_live(EventKind::Lifecycle) {
            return Ok(());
        }
        let session = connection.session().ok_or_else(|| HypervisorError::NotConnected {
            uri: connection.uri().to_owned(),
        })?;
        let event = Event::lifecycle(user, session, self.lifecycle_callback(user))?;
        registry.insert(event);
        Ok(())
    }

    fn lifecycle_callback(&self, user: &str) -> LifecycleCallback {
        let sockets = Arc::clone(&self.sockets);
        let user = user.to_owned();
        Arc::new(move |event: LifecycleEvent| {
            let kind = event.kind;
            let snapshot = match Domain::new(event.domain).snapshot() {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(
                        target: EVENTS_TARGET,
                        user = %user,
                        event = %kind,
                        %error,
                        "failed to snapshot domain for lifecycle event"
                    );
                    return;
                }
            };
            let message = LifecycleMessage {
                event: kind,
                detail: event.detail,
                domain: snapshot,
            };
            if let Err(error) = sockets.broadcast(&user, &message) {
                warn!(target: EVENTS_TARGET, user = %user, %error, "lifecycle broadcast failed");
            }
        })
    }

    async fn serve(
        self: Arc<Self>,
        id: ConnectionId,
        user: UserAccount,
        websocket: HyperWebsocket,
    ) {
        let stream = match websocket.await {
            Ok(stream) => stream,
            Err(source) => {
                self.observer.on_error(
                    id,
                    &ConnectionError::Handshake {
                        source: WebSocketError::from(source),
                    },
                );
                return;
            }
        };
        let (connection, outbound) =
            WebSocketConnection::new(id, user.name, Arc::clone(&self.observer));
        let connection = Arc::new(connection);

        let attached = {
            let this = Arc::clone(&self);
            let connection = Arc::clone(&connection);
            task::spawn_blocking(move || this.attach(&connection)).await
        };
        match attached {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                self.observer
                    .on_error(id, &ConnectionError::Subscribe { source });
                return;
            }
            Err(join_error) => {
                error!(
                    target: EVENTS_TARGET,
                    connection = id,
                    error = %join_error,
                    "attach task failed"
                );
                return;
            }
        }

        let session = serve_session(stream, &connection, outbound).await;

        let detached = {
            let this = Arc::clone(&self);
            let connection = Arc::clone(&connection);
            task::spawn_blocking(move || this.detach(&connection)).await
        };
        if let Err(join_error) = detached {
            error!(
                target: EVENTS_TARGET,
                connection = id,
                error = %join_error,
                "detach task failed"
            );
        }
        match session {
            Ok(()) => self.observer.on_close(id),
            Err(source) => self
                .observer
                .on_error(id, &ConnectionError::WebSocket { source }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<EventsRegistry>>> {
        self.registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReconnectListener for Subscriptions {
    fn reconnected(&self, username: &str) {
        if !self.lock().contains_key(username) {
            return;
        }
        match self.subscribe(username) {
            Ok(()) => debug!(
                target: EVENTS_TARGET,
                user = username,
                "lifecycle callback moved to new session"
            ),
            Err(error) => warn!(
                target: EVENTS_TARGET,
                user = username,
                %error,
                "failed to resubscribe after reconnect"
            ),
        }
    }
}

impl UpgradeHandler for Subscriptions {
    fn accept(
        self: Arc<Self>,
        connection: ConnectionId,
        user: UserAccount,
        websocket: HyperWebsocket,
    ) {
        tokio::spawn(self.serve(connection, user, websocket));
    }
}
