//! End-to-end tests over a real Unix socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rstest::rstest;
use tokio::net::UnixStream;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use crate::app::{Application, Collaborators};
use crate::health::StructuredHealthReporter;
use crate::hypervisor::memory::{MemoryDomain, MemoryHypervisor};
use crate::hypervisor::{DomainState, LifecycleKind};
use crate::transport::{LoggingObserver, SocketListener};
use crate::users::StaticUserResolver;

use super::support::{TestConfigLoader, send_request};

const ALICE_URI: &str = "test:///alice";
const CAROL_URI: &str = "test:///carol";

struct Served {
    loader: TestConfigLoader,
    hypervisor: MemoryHypervisor,
    app: Arc<Application>,
    server: JoinHandle<()>,
}

impl Drop for Served {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve() -> Served {
    let loader = TestConfigLoader::new();
    let config = loader.config();
    config
        .prepare_socket_directory()
        .expect("prepare socket directory");
    let hypervisor = MemoryHypervisor::new();
    hypervisor.define(ALICE_URI, MemoryDomain::shutoff("web"));
    hypervisor.fail_connect(CAROL_URI);
    let app = Application::new(
        config.clone(),
        Collaborators {
            hypervisor: Arc::new(hypervisor.clone()),
            users: Arc::new(
                StaticUserResolver::new()
                    .with_user("alice", 1000)
                    .with_user("carol", 1002),
            ),
            reporter: Arc::new(StructuredHealthReporter::new()),
            observer: Arc::new(LoggingObserver),
        },
    )
    .expect("routes compile");
    let app = Arc::new(app);
    let listener = SocketListener::bind(config.socket_path()).expect("bind socket");
    let server = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.serve(&listener).await }
    });
    Served {
        loader,
        hypervisor,
        app,
        server,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[rstest]
#[case("GET", "/health/", 200)]
#[case("GET", "/users/mallory/domains/", 404)]
#[case("GET", "/users/alice/events/", 400)]
#[case("DELETE", "/users/alice/domains/", 405)]
#[case("GET", "/nowhere/", 404)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn answers_with_status(#[case] method: &str, #[case] path: &str, #[case] status: u16) {
    let served = serve().await;

    let response = send_request(served.loader.socket_path(), method, path, "").await;

    assert_eq!(response.status, status);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_trailing_slash_redirects() {
    let served = serve().await;

    let response = send_request(
        served.loader.socket_path(),
        "POST",
        "/users/alice/domains",
        "",
    )
    .await;

    assert_eq!(response.status, 307);
    assert_eq!(response.header("location"), Some("/users/alice/domains/"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_the_users_domains() {
    let served = serve().await;

    let response = send_request(
        served.loader.socket_path(),
        "GET",
        "/users/alice/domains/",
        "",
    )
    .await;

    assert_eq!(response.status, 200);
    let domains: serde_json::Value = serde_json::from_str(&response.body).expect("JSON body");
    assert_eq!(domains[0]["name"], "web");
    assert_eq!(domains[0]["state"], "shutoff");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starts_a_domain() {
    let served = serve().await;

    let response = send_request(
        served.loader.socket_path(),
        "POST",
        "/users/alice/domains/web/start/",
        "",
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(
        served.hypervisor.domain_state(ALICE_URI, "web"),
        Some(DomainState::Running)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_hypervisor_is_a_server_error() {
    let served = serve().await;

    let response = send_request(
        served.loader.socket_path(),
        "GET",
        "/users/carol/domains/",
        "",
    )
    .await;

    assert_eq!(response.status, 500);
    assert_eq!(response.detail(), "Unable to connect to libvirt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_receive_lifecycle_frames() {
    let served = serve().await;
    let bridge = served.app.start_bridge().expect("start bridge");
    let stream = UnixStream::connect(served.loader.socket_path())
        .await
        .expect("connect");

    let (mut socket, response) =
        tokio_tungstenite::client_async("ws://localhost/users/alice/events/", stream)
            .await
            .expect("handshake");
    assert_eq!(response.status().as_u16(), 101);

    wait_until(|| served.hypervisor.callback_count(ALICE_URI) == 1).await;
    served
        .hypervisor
        .emit_lifecycle(ALICE_URI, "web", LifecycleKind::Started, 1);

    let frame = time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("frame arrives in time")
        .expect("socket stays open")
        .expect("frame decodes");
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    let message: serde_json::Value = serde_json::from_str(&text).expect("JSON frame");
    assert_eq!(message["event"], "started");
    assert_eq!(message["detail"], 1);
    assert_eq!(message["domain"]["name"], "web");

    socket.close(None).await.expect("close");
    wait_until(|| served.hypervisor.callback_count(ALICE_URI) == 0).await;
    assert_eq!(served.app.sockets().count("alice"), 0);

    task::spawn_blocking(move || bridge.stop())
        .await
        .expect("join stop")
        .expect("bridge stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_hypervisor_refuses_subscription() {
    let served = serve().await;
    let stream = UnixStream::connect(served.loader.socket_path())
        .await
        .expect("connect");

    let error = tokio_tungstenite::client_async("ws://localhost/users/carol/events/", stream)
        .await
        .expect_err("handshake is refused");

    let tokio_tungstenite::tungstenite::Error::Http(response) = error else {
        panic!("expected an HTTP refusal, got {error}");
    };
    assert_eq!(response.status().as_u16(), 500);
}
