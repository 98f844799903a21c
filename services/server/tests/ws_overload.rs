//! Admission control: load-based refusal and per-IP connect limiting.

use mp_core::clock::SystemClock;
use mp_core::fleet::FixedSampler;
use mp_core::store::MemoryStore;
use mp_core::{Core, CoreConfig, CoreDeps};
use mp_protocol::{ClientMessage, Modality, QueueJoin, ServerMessage};
use mp_test_utils::{MockAuth, RecordingHistory, RecordingReports, TestWsClient};
use server::AppState;
use server::collab::OpenDirectory;
use server::metrics::SnapshotMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

struct Harness {
    url: String,
    core: Arc<Core>,
    auth: Arc<MockAuth>,
    sampler: Arc<FixedSampler>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server() -> Harness {
    let clock = Arc::new(SystemClock);
    let auth = Arc::new(MockAuth::new());
    let directory = Arc::new(OpenDirectory::new(false));
    let metrics = Arc::new(SnapshotMetrics::new());
    let sampler = Arc::new(FixedSampler::new(5.0, 5.0));
    let core = Core::new(CoreDeps {
        store: Arc::new(MemoryStore::new(clock.clone())),
        clock,
        metrics: metrics.clone(),
        auth: auth.clone(),
        directory: directory.clone(),
        reports: Arc::new(RecordingReports::new()),
        history: Arc::new(RecordingHistory::new()),
        sampler: sampler.clone(),
        config: CoreConfig::default(),
        host: "127.0.0.1".to_owned(),
        port: 0,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    core.start_background(shutdown_rx).await;

    let state = AppState::new(core.clone(), metrics, directory);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            server::build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Harness {
        url: format!("ws://{addr}/ws"),
        core,
        auth,
        sampler,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn overloaded_instance_refuses_new_upgrades_only() {
    let harness = start_server().await;
    harness.auth.grant("tok-a", "u-a");
    harness.auth.grant("tok-b", "u-b");

    // An existing connection, made while healthy.
    let (mut a, _) = TestWsClient::connect_and_auth(&harness.url, "tok-a")
        .await
        .unwrap();

    // CPU spikes past the admission threshold.
    harness.sampler.set(95.0, 40.0);
    harness.core.fleet.heartbeat_once().await.unwrap();
    assert!(!harness.core.should_accept());

    let refused = TestWsClient::connect(&harness.url).await;
    assert!(refused.is_err(), "upgrade must be refused while overloaded");

    // The existing connection keeps working.
    a.send(&ClientMessage::QueueJoin(QueueJoin {
        session_type: Modality::Video,
    }))
    .await
    .unwrap();
    match a.recv_event().await.unwrap() {
        ServerMessage::QueuePosition(p) => assert_eq!(p.position, 1),
        other => panic!("expected queue:position, got {other:?}"),
    }

    // Load drops, admission resumes.
    harness.sampler.set(10.0, 10.0);
    harness.core.fleet.heartbeat_once().await.unwrap();
    let (_b, success) = TestWsClient::connect_and_auth(&harness.url, "tok-b")
        .await
        .unwrap();
    assert_eq!(success.user_id, "u-b");
}

#[tokio::test]
async fn connects_per_ip_are_rate_limited() {
    let harness = start_server().await;

    // The default budget is 10 connects per minute per IP; every test
    // connection comes from 127.0.0.1.
    for _ in 0..10 {
        let client = TestWsClient::connect(&harness.url).await;
        assert!(client.is_ok(), "within budget");
    }
    let refused = TestWsClient::connect(&harness.url).await;
    assert!(refused.is_err(), "11th connect in a minute must be refused");
}
