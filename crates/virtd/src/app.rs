//! Application root wiring pools, router and transport together.

use std::io;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time;
use tracing::{debug, warn};

use virtd_config::Config;

use crate::dispatch::{Middleware, RouteError, RouteSettings, Router, build_router};
use crate::events::{BridgeError, LifecycleBridge, Subscriptions};
use crate::health::HealthReporter;
use crate::hypervisor::{ConnectionPool, Hypervisor, ReconnectListener};
use crate::transport::{
    ConnectionObserver, ConnectionServices, HttpConnection, LISTENER_TARGET, SocketListener,
    UpgradeHandler,
};
use crate::users::{UriRule, UserResolver};
use crate::websocket::WebSocketPool;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(150);

/// External collaborators the application is built from.
pub struct Collaborators {
    /// Hypervisor binding.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// OS account lookup.
    pub users: Arc<dyn UserResolver>,
    /// Lifecycle event sink.
    pub reporter: Arc<dyn HealthReporter>,
    /// Per-connection terminal event sink.
    pub observer: Arc<dyn ConnectionObserver>,
}

/// Owns the shared state every connection works against.
pub struct Application {
    config: Config,
    hypervisor: Arc<dyn Hypervisor>,
    pool: Arc<ConnectionPool>,
    sockets: Arc<WebSocketPool>,
    subscriptions: Arc<Subscriptions>,
    router: Arc<Router>,
    observer: Arc<dyn ConnectionObserver>,
    next_connection: AtomicU64,
}

impl Application {
    /// Builds the pools and installs the route table.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when a route pattern does not compile.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, RouteError> {
        let Collaborators {
            hypervisor,
            users,
            reporter,
            observer,
        } = collaborators;
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&hypervisor),
            reporter,
            UriRule::from_config(&config),
        ));
        let sockets = Arc::new(WebSocketPool::new());
        let subscriptions = Arc::new(Subscriptions::new(
            Arc::clone(&pool),
            Arc::clone(&sockets),
            Arc::clone(&observer),
        ));
        let listener: Weak<dyn ReconnectListener> = Arc::<Subscriptions>::downgrade(&subscriptions);
        pool.set_reconnect_listener(listener);
        let middleware = Middleware::new(users, Arc::clone(&pool));
        let router = build_router(&middleware, RouteSettings::from_config(&config))?;
        Ok(Self {
            config,
            hypervisor,
            pool,
            sockets,
            subscriptions,
            router: Arc::new(router),
            observer,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Per-user hypervisor connections.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Live WebSocket connections.
    #[must_use]
    pub fn sockets(&self) -> &Arc<WebSocketPool> {
        &self.sockets
    }

    /// Per-user event subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    /// Installed route table.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Starts the lifecycle bridge thread against this application's
    /// hypervisor.
    ///
    /// # Errors
    ///
    /// See [`LifecycleBridge::start`].
    pub fn start_bridge(&self) -> Result<LifecycleBridge, BridgeError> {
        LifecycleBridge::start(Arc::clone(&self.hypervisor), self.config.event_poll())
    }

    /// Accepts connections until the future is dropped, spawning one task per
    /// socket onto the current runtime.
    pub async fn serve(&self, listener: &SocketListener) {
        let services = self.services();
        let mut last_error = None::<io::ErrorKind>;
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    last_error = None;
                    let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!(target: LISTENER_TARGET, connection = id, "connection accepted");
                    let connection = HttpConnection::new(id, stream, services.clone());
                    tokio::spawn(connection.run());
                }
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: LISTENER_TARGET, %error, "socket accept error");
                    }
                    last_error = Some(kind);
                    time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Releases every event subscription, stops `bridge`, then closes every
    /// WebSocket and every hypervisor session. Blocking: calls into the
    /// hypervisor.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ThreadPanic`] when the bridge thread panicked;
    /// the remaining steps still run.
    pub fn teardown(&self, bridge: LifecycleBridge) -> Result<(), BridgeError> {
        self.subscriptions.clear();
        let stopped = bridge.stop();
        self.sockets.close_all();
        self.pool.close_all();
        stopped
    }

    fn services(&self) -> ConnectionServices {
        ConnectionServices {
            router: Arc::clone(&self.router),
            upgrades: Arc::clone(&self.subscriptions) as Arc<dyn UpgradeHandler>,
            observer: Arc::clone(&self.observer),
            idle_timeout: self.config.idle_timeout(),
        }
    }
}
