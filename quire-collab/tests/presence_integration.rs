//! Presence and advisory locks between live sessions.

use std::sync::Arc;

use quire_collab::config::SyncConfig;
use quire_collab::locks::{LockError, LockState};
use quire_collab::relay::{RelayConfig, RelayServer};
use quire_collab::session::{InitOptions, SyncController};
use quire_collab::storage::MemoryRemoteStore;
use tokio::time::{Duration, Instant};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server() -> String {
    let port = free_port().await;
    let relay = RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::for_testing()
    });
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn join(url: &str, name: &str) -> SyncController {
    let config = SyncConfig::for_testing("deck")
        .with_relay(url)
        .with_display_name(name);
    let session = SyncController::initialize(config, Arc::new(MemoryRemoteStore::new()), InitOptions::default())
        .await
        .unwrap();
    session.connect().await.unwrap();
    session.wait_for_sync().await;
    session
}

/// Poll until `session` reports `expected` for `component`.
async fn wait_for_lock_state(session: &SyncController, component: &str, expected: LockState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if session.lock_state(component).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_sessions_see_each_other() {
    let url = start_test_server().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while alice.presence().await.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let peers = alice.presence().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "Bob");
    assert_eq!(peers[0].session_id, bob.session_id());
    assert_eq!(peers[0].color, bob.local_presence().await.color);
}

#[tokio::test]
async fn test_active_page_is_shared() {
    let url = start_test_server().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    let page = alice.store().root_pages()[0].id.clone();
    alice.set_active_page(Some(page.clone())).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let seen = bob.presence().await;
        if seen.iter().any(|p| p.page_id.as_deref() == Some(page.as_str())) {
            break;
        }
        assert!(Instant::now() < deadline, "page change not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_lock_flow_between_sessions() {
    let url = start_test_server().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    alice.request_lock("c1").await.unwrap();
    assert_eq!(alice.lock_state("c1").await, LockState::LockedBySelf);
    assert!(wait_for_lock_state(&bob, "c1", LockState::LockedByOther(alice.session_id())).await);

    match bob.request_lock("c1").await {
        Err(LockError::HeldByOther { holder, .. }) => assert_eq!(holder, alice.session_id()),
        other => panic!("expected denial, got {other:?}"),
    }

    alice.shutdown().await;
    assert!(wait_for_lock_state(&bob, "c1", LockState::Unlocked).await);
    bob.request_lock("c1").await.unwrap();
    assert_eq!(bob.lock_state("c1").await, LockState::LockedBySelf);
}

#[tokio::test]
async fn test_release_unlocks_for_others() {
    let url = start_test_server().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    alice.request_lock("c1").await.unwrap();
    assert!(wait_for_lock_state(&bob, "c1", LockState::LockedByOther(alice.session_id())).await);

    alice.release_lock().await;
    assert!(wait_for_lock_state(&bob, "c1", LockState::Unlocked).await);
    assert!(bob.locks().await.is_empty());
}
