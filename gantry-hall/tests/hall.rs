//! Hall service scenarios: login ownership, re-login replacement, kicks.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gantry_core::{Service, ServiceContainer};
use gantry_hall::{EchoHandler, HallConfig, HallService};
use gantry_net::{HallClient, HallMessage, HallStatus};
use gantry_registry::{Registry, RegistryConfig};
use gantry_store::{KvStore, MemStore};
use tokio_util::sync::CancellationToken;

struct Fixture {
    store: Arc<MemStore>,
    root: CancellationToken,
    container: ServiceContainer,
    registry: Arc<Registry>,
    hall: Arc<HallService>,
    addr: String,
}

async fn start_hall(store: Arc<MemStore>, peer_id: i32) -> Fixture {
    let root = CancellationToken::new();
    let store_dyn: Arc<dyn KvStore> = store.clone();
    let registry = Registry::start(
        store_dyn,
        RegistryConfig::new("hall", peer_id, "127.0.0.1:0"),
        &root,
    )
    .await
    .unwrap();

    let hall = HallService::new(
        registry.clone(),
        HallConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            build_time: 1_000,
            app_version: "test".to_string(),
        },
        Arc::new(EchoHandler),
    );
    let container = ServiceContainer::new(&root);
    let svc: Arc<dyn Service> = hall.clone();
    container.start_service("hall", svc).await.unwrap();
    let addr = hall.bound_addr().unwrap().to_string();
    Fixture {
        store,
        root,
        container,
        registry,
        hall,
        addr,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn login_locks_the_user_and_serves_it() {
    let fixture = start_hall(Arc::new(MemStore::new()), 1).await;
    let client = HallClient::connect(&fixture.addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let (mut sink, mut stream) = client.open_client_stream(1, "u-1").await.unwrap();
    sink.send(7, &Bytes::from_static(b"login")).await.unwrap();
    match stream.recv().await.unwrap() {
        HallMessage::Data { req_id, data, .. } => {
            assert_eq!(req_id, 7);
            assert_eq!(data, Bytes::from_static(b"OK"));
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(fixture.registry.players().local_player("u-1").is_some());
    let health = client.health_check().await.unwrap();
    assert_eq!(health.status, HallStatus::Ok);
    assert_eq!(health.player_count, 1);

    fixture.container.stop().await.unwrap();
    fixture.root.cancel();
}

#[tokio::test]
async fn relogin_replaces_the_previous_session() {
    let fixture = start_hall(Arc::new(MemStore::new()), 1).await;
    let client = HallClient::connect(&fixture.addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let (mut old_sink, mut old_stream) = client.open_client_stream(1, "u-1").await.unwrap();
    old_sink.send(1, &Bytes::from_static(b"login")).await.unwrap();
    old_stream.recv().await.unwrap();

    let (mut new_sink, mut new_stream) = client.open_client_stream(2, "u-1").await.unwrap();
    new_sink.send(2, &Bytes::from_static(b"login")).await.unwrap();

    // The old session is told it was replaced; the new one is served.
    match old_stream.recv().await.unwrap() {
        HallMessage::UserInstead(reason) => {
            assert!(reason.contains("another session"));
        }
        other => panic!("unexpected {other:?}"),
    }
    match new_stream.recv().await.unwrap() {
        HallMessage::Data { req_id, .. } => assert_eq!(req_id, 2),
        other => panic!("unexpected {other:?}"),
    }

    assert!(wait_until(|| fixture.hall.session_count() == 1).await);
    assert!(fixture.registry.players().local_player("u-1").is_some());
    fixture.root.cancel();
}

#[tokio::test]
async fn user_served_elsewhere_is_refused_with_a_kick() {
    let store = Arc::new(MemStore::new());
    // Another hall instance owns the user already.
    let other = start_hall(store.clone(), 2).await;
    let other_client = HallClient::connect(&other.addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();
    let (mut sink, mut stream) = other_client.open_client_stream(1, "u-9").await.unwrap();
    sink.send(1, &Bytes::from_static(b"login")).await.unwrap();
    stream.recv().await.unwrap();

    let fixture = start_hall(store, 1).await;
    let client = HallClient::connect(&fixture.addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();
    let (mut sink2, mut stream2) = client.open_client_stream(2, "u-9").await.unwrap();
    sink2.send(2, &Bytes::from_static(b"login")).await.unwrap();

    match stream2.recv().await.unwrap() {
        HallMessage::Kick(reason) => assert!(reason.contains("hall/2"), "reason: {reason}"),
        other_msg => panic!("unexpected {other_msg:?}"),
    }
    assert_eq!(fixture.hall.session_count(), 0);
    other.root.cancel();
    fixture.root.cancel();
}

#[tokio::test]
async fn session_end_releases_the_user() {
    let fixture = start_hall(Arc::new(MemStore::new()), 1).await;
    let client = HallClient::connect(&fixture.addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let (mut sink, mut stream) = client.open_client_stream(1, "u-1").await.unwrap();
    sink.send(1, &Bytes::from_static(b"login")).await.unwrap();
    stream.recv().await.unwrap();
    assert!(fixture.registry.players().local_player("u-1").is_some());

    drop(sink);
    drop(stream);

    assert!(wait_until(|| fixture.registry.players().local_player("u-1").is_none()).await);
    assert_eq!(fixture.hall.session_count(), 0);

    // The store no longer holds the ownership keys either.
    let raw: Arc<dyn KvStore> = fixture.store.clone();
    assert!(raw.get("/user/u-1").await.unwrap().is_none());
    fixture.root.cancel();
}
