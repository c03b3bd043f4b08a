mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::Harness;
use core_engine::model::ProvisioningToken;
use core_engine::monitor::{reap_once, sweep_once, HealthMonitor, MonitorSettings};
use core_engine::registration::RegistrationRequest;
use core_engine::store::TokenStore;
use core_engine::{NodeClass, NodeState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_settings(auto_reconnect: bool) -> MonitorSettings {
    MonitorSettings {
        class: Some(NodeClass::Worker),
        sweep_interval: Duration::from_millis(10),
        reap_interval: Duration::from_millis(10),
        connecting_timeout: Duration::from_millis(20),
        auto_reconnect,
    }
}

fn monitor(h: &Harness, settings: MonitorSettings) -> HealthMonitor {
    HealthMonitor::new(Arc::clone(h.engine.supervisor()), h.store.clone(), settings)
}

async fn register_worker(h: &Harness, id: &str) {
    h.engine
        .registrar()
        .register(RegistrationRequest::new(id, NodeClass::Worker))
        .await
        .unwrap();
}

#[tokio::test]
async fn start_and_stop_toggle_the_loops() {
    let h = Harness::new();
    let monitor = monitor(&h, fast_settings(false));

    assert!(!monitor.is_running());
    assert!(monitor.start());
    assert!(!monitor.start());
    assert!(monitor.is_running());

    monitor.stop().await;
    assert!(!monitor.is_running());

    assert!(monitor.start());
    monitor.stop().await;
    assert!(!monitor.is_running());
}

#[tokio::test]
async fn reaper_fails_nodes_that_never_connect() {
    let h = Harness::new();
    h.probe.set_default(false);
    register_worker(&h, "worker-1").await;

    let monitor = monitor(&h, fast_settings(false));
    monitor.start();
    let state = h
        .wait_for_state("worker-1", &[NodeState::Error], Duration::from_secs(2))
        .await;
    monitor.stop().await;

    assert_eq!(state, NodeState::Error);
}

#[tokio::test]
async fn sweep_reconnects_dropped_nodes_when_enabled() {
    let h = Harness::with_config(|config| config.supervisor.max_attempts = 1);
    register_worker(&h, "worker-1").await;
    h.engine.supervisor().activate("worker-1").await.unwrap();

    h.probe.set_default(false);
    let monitor = monitor(&h, fast_settings(true));
    monitor.start();

    let dropped = h
        .wait_for_state(
            "worker-1",
            &[NodeState::Disconnected, NodeState::Error],
            Duration::from_secs(2),
        )
        .await;
    assert_ne!(dropped, NodeState::Connected);

    h.probe.set_default(true);
    let back = h
        .wait_for_state("worker-1", &[NodeState::Connected], Duration::from_secs(2))
        .await;
    monitor.stop().await;

    assert_eq!(back, NodeState::Connected);
}

#[tokio::test]
async fn single_passes_can_be_driven_directly() {
    let h = Harness::new();
    register_worker(&h, "worker-1").await;
    let supervisor = Arc::clone(h.engine.supervisor());

    sweep_once(
        Arc::clone(&supervisor),
        fast_settings(false),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(h.state_of("worker-1").await, NodeState::Connected);

    reap_once(
        supervisor,
        h.store.clone(),
        Duration::ZERO,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(h.state_of("worker-1").await, NodeState::Connected);
}

#[tokio::test]
async fn reaper_drops_expired_tokens() {
    let h = Harness::new();
    let mut expired = ProvisioningToken::mint("worker-9", NodeClass::Worker, ChronoDuration::minutes(5));
    expired.expires_at = Utc::now() - ChronoDuration::seconds(1);
    h.store.insert_token(expired).await.unwrap();
    let live = h
        .engine
        .registrar()
        .issue_token("worker-8", NodeClass::Worker, ChronoDuration::minutes(5))
        .await
        .unwrap();

    reap_once(
        Arc::clone(h.engine.supervisor()),
        h.store.clone(),
        Duration::from_secs(60),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(h.store.purge_expired_tokens(Utc::now()).await.unwrap(), 0);
    let (node_id, class) = h.engine.registrar().redeem(&live.value).await.unwrap();
    assert_eq!((node_id.as_str(), class), ("worker-8", NodeClass::Worker));
}

#[tokio::test]
async fn stop_returns_while_a_health_check_hangs() {
    let h = Harness::new();
    register_worker(&h, "worker-1").await;
    h.engine.supervisor().activate("worker-1").await.unwrap();
    let before = h.probe.calls();

    h.probe.hang(true);
    let monitor = monitor(&h, fast_settings(false));
    monitor.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.probe.calls() == before && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(h.probe.calls(), before + 1);

    tokio::time::timeout(Duration::from_secs(1), monitor.stop())
        .await
        .expect("stop should not wait on the hung check");
    assert!(!monitor.is_running());

    // The aborted check released its node lock and changed nothing.
    let guard = tokio::time::timeout(
        Duration::from_millis(200),
        h.engine.supervisor().lock_node("worker-1"),
    )
    .await;
    assert!(guard.is_ok());
    drop(guard);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.probe.calls(), before + 1);
    assert_eq!(h.state_of("worker-1").await, NodeState::Connected);
}
