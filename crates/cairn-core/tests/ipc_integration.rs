//! Cross-process interface round trips over a real Unix socket

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::config::{BackgroundSettings, EngineSettings, RoutingConfig, ServerSettings};
use cairn_core::ipc::{Request, Response, RoutingClient, RoutingServer, PROTOCOL_VERSION};
use cairn_core::metrics::MetricsStore;
use cairn_core::routing::{ContentDescriptor, RoutingManager};
use cairn_core::Error;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    manager: Arc<RoutingManager>,
    socket: PathBuf,
    shutdown: CancellationToken,
    handle: JoinHandle<cairn_core::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start_server(backends: &[&str], server: ServerSettings) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = EngineSettings::in_dir(dir.path());
    settings.background = BackgroundSettings {
        prune_metrics: false,
        ..Default::default()
    };

    let manager = Arc::new(
        RoutingManager::builder(settings.clone())
            .with_store(MetricsStore::in_memory().await.unwrap())
            .with_initial_config(RoutingConfig {
                backends: backends.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .build()
            .await
            .unwrap(),
    );

    let socket = settings.socket_path.clone();
    let server = RoutingServer::bind(manager.clone(), &socket, server).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(shutdown.clone()));

    TestServer {
        manager,
        socket,
        shutdown,
        handle,
        _dir: dir,
    }
}

fn pdf() -> ContentDescriptor {
    ContentDescriptor::new("application/pdf", 1_048_576)
}

#[tokio::test]
async fn select_and_report_on_one_connection() {
    let server = start_server(&["A", "B", "C"], ServerSettings::default()).await;
    let mut client = RoutingClient::connect(&server.socket).await.unwrap();

    assert_eq!(client.ping().await.unwrap(), PROTOCOL_VERSION);

    let first = client.select_backend(&pdf(), None, None, None).await.unwrap();
    for _ in 0..5 {
        client.record_outcome(&first, &pdf(), false, Some(900)).await.unwrap();
    }
    let second = client.select_backend(&pdf(), None, None, None).await.unwrap();
    assert_ne!(first, second);

    let learned = server
        .manager
        .scoring()
        .learned_score(&first, "application/pdf")
        .unwrap();
    assert_eq!(learned.failures, 5);

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn request_errors_keep_connection_open() {
    let server = start_server(&["A"], ServerSettings::default()).await;
    let mut client = RoutingClient::connect(&server.socket).await.unwrap();

    let err = client
        .select_backend(&pdf(), None, None, Some(&[][..]))
        .await
        .unwrap_err();
    match err {
        Error::Remote { code, .. } => assert_eq!(code, "E100"),
        other => panic!("unexpected error {other:?}"),
    }

    // unknown backends are dropped server-side, not reported as errors
    client.record_outcome("ghost", &pdf(), true, None).await.unwrap();
    assert_eq!(client.select_backend(&pdf(), None, None, None).await.unwrap(), "A");
    assert_eq!(server.manager.get_routing_insights().unknown_outcomes, 1);

    server.stop().await;
}

#[tokio::test]
async fn pipelined_requests_answer_in_order() {
    let server = start_server(&["A", "B"], ServerSettings::default()).await;
    let mut client = RoutingClient::connect(&server.socket).await.unwrap();

    let mut restricted = Request::select(&pdf());
    if let Request::SelectBackend { available, .. } = &mut restricted {
        *available = Some(vec!["B".to_string()]);
    }

    let responses = client
        .pipeline(vec![
            Request::select(&pdf()),
            Request::outcome("A", &pdf(), true, Some(12)),
            Request::Ping,
            restricted,
        ])
        .await
        .unwrap();

    assert_eq!(responses.len(), 4);
    assert!(matches!(&responses[0], Response::Selected { backend_id, .. } if backend_id == "A"));
    assert_eq!(responses[1], Response::Ack);
    assert_eq!(responses[2], Response::Pong { version: PROTOCOL_VERSION });
    assert!(matches!(&responses[3], Response::Selected { backend_id, .. } if backend_id == "B"));

    server.stop().await;
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() {
    let server = start_server(&["A"], ServerSettings::default()).await;
    let mut good = RoutingClient::connect(&server.socket).await.unwrap();

    let mut bad = UnixStream::connect(&server.socket).await.unwrap();
    bad.write_all(b"XX\x01\x01\x00\x00\x00\x00").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), bad.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.starts_with(b"CR"));

    assert_eq!(good.ping().await.unwrap(), PROTOCOL_VERSION);
    assert_eq!(good.select_backend(&pdf(), None, None, None).await.unwrap(), "A");

    server.stop().await;
}

#[tokio::test]
async fn stalled_partial_frame_is_discarded() {
    let settings = ServerSettings {
        io_timeout_secs: 1,
        ..Default::default()
    };
    let server = start_server(&["A"], settings).await;

    let mut stalled = UnixStream::connect(&server.socket).await.unwrap();
    stalled.write_all(b"CR\x01").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.manager.flush_metrics().await;
    assert_eq!(server.manager.store().row_counts().await.unwrap().decisions, 0);

    server.stop().await;
}

#[tokio::test]
async fn connections_beyond_the_cap_are_closed() {
    let settings = ServerSettings {
        max_connections: 1,
        ..Default::default()
    };
    let server = start_server(&["A"], settings).await;

    let mut first = RoutingClient::connect(&server.socket).await.unwrap();
    assert_eq!(first.ping().await.unwrap(), PROTOCOL_VERSION);

    let mut second = UnixStream::connect(&server.socket).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());

    // the admitted client is unaffected
    assert_eq!(first.select_backend(&pdf(), None, None, None).await.unwrap(), "A");

    // a client that vanishes without disconnecting frees its slot
    drop(first);
    let mut admitted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let Ok(mut client) = RoutingClient::connect(&server.socket).await else {
            continue;
        };
        if client.ping().await.is_ok() {
            admitted = true;
            break;
        }
    }
    assert!(admitted);

    server.stop().await;
}

#[tokio::test]
async fn idle_connections_are_reaped() {
    let settings = ServerSettings {
        idle_timeout_secs: 1,
        io_timeout_secs: 1,
        ..Default::default()
    };
    let server = start_server(&["A"], settings).await;

    let mut quiet = UnixStream::connect(&server.socket).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), quiet.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());

    let mut client = RoutingClient::connect(&server.socket).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), PROTOCOL_VERSION);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_removes_socket_and_rebind_replaces_stale_file() {
    let server = start_server(&["A"], ServerSettings::default()).await;
    let socket = server.socket.clone();
    let manager = server.manager.clone();

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
    assert!(!socket.exists());

    // a leftover regular file at the socket path is treated as stale
    std::fs::write(&socket, b"").unwrap();
    let rebound = RoutingServer::bind(manager, &socket, ServerSettings::default()).unwrap();
    assert_eq!(rebound.socket_path(), socket.as_path());
}

#[tokio::test]
async fn connect_to_missing_socket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = RoutingClient::connect(dir.path().join("missing.sock")).await;
    assert!(matches!(result, Err(Error::Io(_))));
}
