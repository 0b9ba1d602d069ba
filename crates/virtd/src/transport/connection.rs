//! Per-socket HTTP exchange with an idle deadline.
//!
//! Each accepted socket carries exactly one request. The exchange moves
//! through [`ConnectionState`] in order: the request is read and buffered,
//! dispatched to the router on a blocking thread, and then either the response
//! is written and the write side shut down, or the socket is handed to the
//! WebSocket layer. An idle deadline bounds reading the request and, afresh,
//! writing the response. It is suspended while the router runs, since a
//! handler may legitimately block for its own budget.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_tungstenite::HyperWebsocket;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::{task, time};
use tracing::{debug, error, warn};

use crate::dispatch::{EventSubscription, Request, Response, Router, error_response};
use crate::users::UserAccount;

use super::{ConnectionError, ConnectionId, ConnectionObserver, LISTENER_TARGET};

/// Receives sockets that completed a WebSocket handshake.
pub trait UpgradeHandler: Send + Sync {
    /// Takes ownership of an upgraded socket on behalf of `user`.
    ///
    /// Called from the reactor before the handshake response is written; the
    /// websocket resolves once it has been.
    fn accept(
        self: Arc<Self>,
        connection: ConnectionId,
        user: UserAccount,
        websocket: HyperWebsocket,
    );
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct ConnectionServices {
    /// Route table.
    pub router: Arc<Router>,
    /// Destination for upgraded sockets.
    pub upgrades: Arc<dyn UpgradeHandler>,
    /// Terminal event sink.
    pub observer: Arc<dyn ConnectionObserver>,
    /// Budget for reading the request, and again for writing the response.
    pub idle_timeout: Duration,
}

/// Where an exchange currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Reading,
    Dispatching,
    Writing,
    Upgraded,
    Closed,
}

impl ConnectionState {
    fn is_timed(self) -> bool {
        matches!(self, Self::Idle | Self::Reading | Self::Writing)
    }
}

/// Shared view of a connection's state.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<watch::Sender<ConnectionState>>);

impl StateWatch {
    fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionState::Idle);
        Self(Arc::new(sender))
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    fn set(&self, state: ConnectionState) {
        self.0.send_replace(state);
    }

    /// Resolves once the connection has spent `timeout` in a timed phase
    /// without moving on. Each phase change restarts the budget.
    async fn idle_deadline(&self, timeout: Duration) {
        let mut changes = self.0.subscribe();
        loop {
            let phase = *changes.borrow_and_update();
            let changed = if phase.is_timed() {
                tokio::select! {
                    () = time::sleep(timeout) => return,
                    changed = changes.changed() => changed,
                }
            } else {
                changes.changed().await
            };
            if changed.is_err() {
                // Unreachable while `self` holds the sender.
                future::pending::<()>().await;
            }
        }
    }
}

/// One accepted socket.
pub struct HttpConnection<S> {
    id: ConnectionId,
    stream: S,
    services: ConnectionServices,
    state: StateWatch,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an accepted socket.
    pub fn new(id: ConnectionId, stream: S, services: ConnectionServices) -> Self {
        Self {
            id,
            stream,
            services,
            state: StateWatch::new(),
        }
    }

    /// Returns a handle that keeps reporting the state after [`Self::run`]
    /// consumes the connection.
    #[must_use]
    pub fn state(&self) -> StateWatch {
        self.state.clone()
    }

    /// Serves the exchange to completion.
    ///
    /// Fires exactly one observer callback unless the socket was upgraded.
    /// The deadline and the exchange race inside a single `select!`, so a
    /// deadline that elapses after the exchange finished is never observed.
    /// Upgraded sockets are no longer subject to the deadline.
    pub async fn run(self) {
        let Self {
            id,
            stream,
            services,
            state,
        } = self;
        state.set(ConnectionState::Reading);

        let exchange = Arc::new(Exchange {
            id,
            router: Arc::clone(&services.router),
            upgrades: Arc::clone(&services.upgrades),
            state: state.clone(),
        });
        let service = service_fn(move |request| {
            let exchange = Arc::clone(&exchange);
            async move { exchange.respond(request).await }
        });
        let mut serve = Box::pin(
            http1::Builder::new()
                .keep_alive(false)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades(),
        );

        let finished = tokio::select! {
            outcome = &mut serve => Some(outcome),
            () = state.idle_deadline(services.idle_timeout) => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                let phase = state.get();
                drop(serve);
                debug!(
                    target: LISTENER_TARGET,
                    connection = id,
                    timeout_ms = services.idle_timeout.as_millis(),
                    ?phase,
                    "idle deadline elapsed; closing connection"
                );
                state.set(ConnectionState::Closed);
                services.observer.on_close(id);
                return;
            }
        };

        match outcome {
            Ok(()) if state.get() == ConnectionState::Upgraded => {
                debug!(target: LISTENER_TARGET, connection = id, "connection upgraded");
            }
            Ok(()) => {
                state.set(ConnectionState::Closed);
                services.observer.on_close(id);
            }
            Err(source) => {
                state.set(ConnectionState::Closed);
                services
                    .observer
                    .on_error(id, &ConnectionError::Http { source });
            }
        }
    }
}

struct Exchange {
    id: ConnectionId,
    router: Arc<Router>,
    upgrades: Arc<dyn UpgradeHandler>,
    state: StateWatch,
}

impl Exchange {
    async fn respond(
        &self,
        request: hyper::Request<Incoming>,
    ) -> Result<hyper::Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = request.into_parts();
        let body = body.collect().await?.to_bytes();
        let request = Request::from_parts(parts, body);

        self.state.set(ConnectionState::Dispatching);
        let router = Arc::clone(&self.router);
        let dispatched = task::spawn_blocking(move || {
            let response = router.dispatch(&request);
            (request, response)
        })
        .await;
        let (mut request, response) = match dispatched {
            Ok(pair) => pair,
            Err(join_error) => {
                error!(
                    target: LISTENER_TARGET,
                    connection = self.id,
                    error = %join_error,
                    "dispatch task failed"
                );
                return Ok(self.write(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                )));
            }
        };

        let Some(subscription) = upgrade_target(&request, &response) else {
            return Ok(self.write(response));
        };
        match hyper_tungstenite::upgrade(&mut request, None) {
            Ok((handshake, websocket)) => {
                self.state.set(ConnectionState::Upgraded);
                Arc::clone(&self.upgrades).accept(self.id, subscription.user, websocket);
                Ok(handshake)
            }
            Err(error) => {
                warn!(
                    target: LISTENER_TARGET,
                    connection = self.id,
                    %error,
                    "rejecting malformed websocket handshake"
                );
                Ok(self.write(error_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid WebSocket handshake",
                )))
            }
        }
    }

    fn write(&self, response: Response) -> hyper::Response<Full<Bytes>> {
        self.state.set(ConnectionState::Writing);
        response.map(Full::new)
    }
}

/// Returns the subscription to hand the socket to, if this exchange upgrades.
fn upgrade_target(request: &Request, response: &Response) -> Option<EventSubscription> {
    if !hyper_tungstenite::is_upgrade_request(request) || !response.status().is_success() {
        return None;
    }
    response.extensions().get::<EventSubscription>().cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use hyper::Method;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use crate::dispatch::{Handler, RouteMatch, write_json};
    use crate::hypervisor::HypervisorError;
    use crate::tests::support::{ObservedEvent, RecordingObserver};

    use super::*;

    const WEBSOCKET_REQUEST: &str = "GET /events/ HTTP/1.1\r\nHost: localhost\r\n\
        Connection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    #[derive(Default)]
    struct RecordingUpgrades {
        accepted: Mutex<Vec<(ConnectionId, String)>>,
    }

    impl RecordingUpgrades {
        fn accepted(&self) -> Vec<(ConnectionId, String)> {
            self.accepted.lock().expect("upgrades lock").clone()
        }
    }

    impl UpgradeHandler for RecordingUpgrades {
        fn accept(
            self: Arc<Self>,
            connection: ConnectionId,
            user: UserAccount,
            _websocket: HyperWebsocket,
        ) {
            self.accepted
                .lock()
                .expect("upgrades lock")
                .push((connection, user.name));
        }
    }

    struct Harness {
        observer: Arc<RecordingObserver>,
        upgrades: Arc<RecordingUpgrades>,
        services: ConnectionServices,
    }

    fn harness(idle_timeout: Duration, subscribe: bool) -> Harness {
        let mut router = Router::new(0);
        let health: Handler = Arc::new(|_: &RouteMatch, _: &Request, response: &mut Response| {
            write_json(response, StatusCode::OK, &serde_json::json!({ "status": "ok" }))
        });
        router.register("^/health/$", health).expect("health route");
        let events: Handler =
            Arc::new(move |_: &RouteMatch, _: &Request, response: &mut Response| {
                if subscribe {
                    response.extensions_mut().insert(EventSubscription {
                        user: UserAccount::new("alice", 1000),
                    });
                }
                Ok(())
            });
        router.register("^/events/$", events).expect("events route");
        let slow: Handler = Arc::new(|_: &RouteMatch, _: &Request, _: &mut Response| {
            std::thread::sleep(Duration::from_millis(250));
            Err(HypervisorError::ShutdownTimeout {
                timeout: Duration::from_millis(50),
            }
            .into())
        });
        router.register("^/slow/$", slow).expect("slow route");

        let observer = Arc::new(RecordingObserver::default());
        let upgrades = Arc::new(RecordingUpgrades::default());
        let services = ConnectionServices {
            router: Arc::new(router),
            upgrades: Arc::clone(&upgrades) as Arc<dyn UpgradeHandler>,
            observer: Arc::clone(&observer) as Arc<dyn ConnectionObserver>,
            idle_timeout,
        };
        Harness {
            observer,
            upgrades,
            services,
        }
    }

    async fn exchange(services: ConnectionServices, raw: &str) -> (String, StateWatch) {
        let (mut client, server): (DuplexStream, DuplexStream) = duplex(16 * 1024);
        let connection = HttpConnection::new(7, server, services);
        let state = connection.state();
        let running = tokio::spawn(connection.run());

        client.write_all(raw.as_bytes()).await.expect("write request");
        let mut buffer = Vec::new();
        client.read_to_end(&mut buffer).await.expect("read response");
        running.await.expect("connection task");
        (String::from_utf8_lossy(&buffer).into_owned(), state)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_connection_is_closed_once() {
        let harness = harness(Duration::from_millis(10), false);
        let (client, server) = duplex(1024);
        let connection = HttpConnection::new(1, server, harness.services.clone());
        let state = connection.state();

        connection.run().await;

        assert_eq!(state.get(), ConnectionState::Closed);
        assert_eq!(harness.observer.events(), vec![ObservedEvent::Closed(1)]);
        drop(client);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_exchange_ignores_later_deadline() {
        let harness = harness(Duration::from_millis(200), false);

        let (response, state) = exchange(
            harness.services.clone(),
            "GET /health/ HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        time::sleep(Duration::from_millis(300)).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with(r#"{"status":"ok"}"#), "{response}");
        assert_eq!(state.get(), ConnectionState::Closed);
        assert_eq!(harness.observer.events(), vec![ObservedEvent::Closed(7)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_handler_outlives_idle_deadline() {
        let harness = harness(Duration::from_millis(100), false);

        let (response, state) = exchange(
            harness.services.clone(),
            "POST /slow/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 504"), "{response}");
        assert!(
            response.contains("Shutdown operation timed out"),
            "{response}"
        );
        assert_eq!(state.get(), ConnectionState::Closed);
        assert_eq!(harness.observer.events(), vec![ObservedEvent::Closed(7)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_request_body_hits_deadline() {
        let harness = harness(Duration::from_millis(50), false);
        let (mut client, server) = duplex(1024);
        let connection = HttpConnection::new(3, server, harness.services.clone());
        let state = connection.state();
        let running = tokio::spawn(connection.run());

        client
            .write_all(b"POST /health/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\nab")
            .await
            .expect("write partial request");
        running.await.expect("connection task");

        assert_eq!(state.get(), ConnectionState::Closed);
        assert_eq!(harness.observer.events(), vec![ObservedEvent::Closed(3)]);
    }

    #[rstest]
    #[case(Method::OPTIONS, "/nowhere/", "404")]
    #[case(Method::GET, "/nowhere/", "404")]
    #[case(Method::GET, "/health", "307")]
    #[tokio::test(flavor = "multi_thread")]
    async fn writes_router_responses(
        #[case] method: Method,
        #[case] path: &str,
        #[case] status: &str,
    ) {
        let harness = harness(Duration::from_secs(5), false);

        let (response, _) = exchange(
            harness.services.clone(),
            &format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"),
        )
        .await;

        assert!(
            response.starts_with(&format!("HTTP/1.1 {status}")),
            "{response}"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upgrades_only_with_subscription_marker() {
        let harness = harness(Duration::from_secs(5), true);

        let (response, state) = exchange(harness.services.clone(), WEBSOCKET_REQUEST).await;

        assert!(
            response.starts_with("HTTP/1.1 101 Switching Protocols"),
            "{response}"
        );
        assert_eq!(state.get(), ConnectionState::Upgraded);
        assert_eq!(harness.upgrades.accepted(), vec![(7, "alice".to_owned())]);
        assert!(harness.observer.events().is_empty(), "no close for upgrades");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upgrade_request_without_marker_gets_plain_response() {
        let harness = harness(Duration::from_secs(5), false);

        let (response, state) = exchange(harness.services.clone(), WEBSOCKET_REQUEST).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert_eq!(state.get(), ConnectionState::Closed);
        assert!(harness.upgrades.accepted().is_empty());
    }
}
