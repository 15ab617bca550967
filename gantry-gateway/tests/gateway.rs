//! Gateway scenarios against stub halls over loopback TCP.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::Peer;
use gantry_gateway::{GatewayServer, UpstreamConfig, UpstreamPool};
use gantry_net::{
    split, Frame, FrameKind, FrameReader, FrameWriter, HallApi, HallListener, HallStatus, Health,
    Info, SessionChannel,
};
use gantry_registry::PeerHandler;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A scriptable hall: fixed build time, adjustable health, recorded frames.
struct StubHall {
    build_time: i64,
    status: AtomicU8,
    player_count: AtomicI64,
    received: Mutex<Vec<(u64, u64, Vec<u8>)>>,
    token: CancellationToken,
}

impl StubHall {
    fn new(build_time: i64, player_count: i64) -> Arc<Self> {
        Arc::new(Self {
            build_time,
            status: AtomicU8::new(HallStatus::Ok as u8),
            player_count: AtomicI64::new(player_count),
            received: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        })
    }

    fn set_status(&self, status: HallStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn received_req_ids(&self) -> Vec<u64> {
        self.received.lock().unwrap().iter().map(|r| r.1).collect()
    }

    fn kill(&self) {
        self.token.cancel();
    }
}

#[async_trait]
impl HallApi for StubHall {
    async fn info(&self) -> Info {
        Info {
            build_time: self.build_time,
            app_version: "test".to_string(),
        }
    }

    async fn health(&self) -> Health {
        Health {
            status: HallStatus::from_u8(self.status.load(Ordering::SeqCst)),
            player_count: self.player_count.load(Ordering::SeqCst),
        }
    }

    async fn on_session(&self, mut session: SessionChannel) {
        loop {
            let frame = tokio::select! {
                () = self.token.cancelled() => return,
                frame = session.reader.read_frame() => match frame {
                    Ok(frame) => frame,
                    Err(_) => return,
                },
            };
            let (_, data) = gantry_net::parse_session_data(&frame).unwrap();
            self.received
                .lock()
                .unwrap()
                .push((frame.session_id, frame.req_id, data.to_vec()));
            let reply = if data.as_ref() == b"kickme" {
                Frame::hall_kick(frame.session_id, "requested kick")
            } else {
                Frame::hall_data(frame.session_id, frame.req_id, "", &Bytes::from_static(b"OK"))
            };
            if session.writer.write_frame(&reply).await.is_err() {
                return;
            }
        }
    }
}

async fn start_hall(hall: &Arc<StubHall>) -> String {
    let listener = HallListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(listener.serve(hall.clone(), hall.token.clone()));
    addr
}

fn pool_config() -> UpstreamConfig {
    let mut config = UpstreamConfig::new("hall", "gateway/1");
    config.heartbeat_interval = Duration::from_millis(200);
    config.connect_timeout = Duration::from_secs(1);
    config
}

async fn add_hall(pool: &Arc<UpstreamPool>, id: i32, addr: &str) {
    pool.on_peer_add(&Peer::new("hall", id, addr));
    assert!(
        wait_until(|| pool.agent(id).is_some_and(|a| a.is_connected())).await,
        "agent {id} never connected"
    );
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Minimal framed client against the gateway's client surface.
struct TestClient {
    reader: FrameReader,
    writer: FrameWriter,
}

impl TestClient {
    async fn connect(addr: &str, member_id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = split(stream);
        writer
            .write_frame(&Frame::client_hello(member_id))
            .await
            .unwrap();
        Self { reader, writer }
    }

    async fn send(&mut self, req_id: u64, data: &[u8]) {
        self.writer
            .write_frame(&Frame::client_request(req_id, &Bytes::copy_from_slice(data)))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .expect("timed out waiting for gateway frame")
            .unwrap()
    }
}

#[tokio::test]
async fn select_prefers_freshest_build_then_least_loaded() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);

    let old_hall = StubHall::new(100, 0);
    let new_busy = StubHall::new(200, 50);
    let new_idle = StubHall::new(200, 3);
    add_hall(&pool, 1, &start_hall(&old_hall).await).await;
    add_hall(&pool, 2, &start_hall(&new_busy).await).await;
    add_hall(&pool, 3, &start_hall(&new_idle).await).await;

    // Let heartbeats populate the player counts.
    assert!(wait_until(|| pool.agent(2).unwrap().player_count() == 50).await);
    assert!(wait_until(|| pool.agent(3).unwrap().player_count() == 3).await);

    let selected = pool.select_peer().await.unwrap();
    assert_eq!(selected.full_name, "hall/3");
    root.cancel();
}

#[tokio::test]
async fn select_with_no_live_peer_returns_none() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    assert!(pool.select_peer().await.is_none());

    // One peer, health-checking as unavailable: no fallback, still none.
    let sick = StubHall::new(100, 0);
    add_hall(&pool, 1, &start_hall(&sick).await).await;
    sick.set_status(HallStatus::Unavailable);
    assert!(pool.select_peer().await.is_none());
    root.cancel();
}

#[tokio::test]
async fn peer_delete_tears_the_agent_down() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    let hall = StubHall::new(100, 0);
    let addr = start_hall(&hall).await;
    add_hall(&pool, 1, &addr).await;

    pool.on_peer_delete(&Peer::new("hall", 1, &addr));
    assert_eq!(pool.agent_count(), 0);
    root.cancel();
}

async fn start_gateway(pool: Arc<UpstreamPool>, root: &CancellationToken) -> (Arc<GatewayServer>, String) {
    let server = GatewayServer::new(pool, root);
    let listener = GatewayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.clone().serve(listener));
    (server, addr)
}

#[tokio::test]
async fn lone_login_roundtrips_through_the_hall() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    let hall = StubHall::new(100, 0);
    add_hall(&pool, 1, &start_hall(&hall).await).await;
    let (server, addr) = start_gateway(pool, &root).await;

    let mut client = TestClient::connect(&addr, "member-1").await;
    client.send(7, b"login").await;

    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ClientResponse);
    assert_eq!(frame.req_id, 7);
    assert_eq!(frame.payload.as_ref(), b"OK");

    assert!(wait_until(|| server.session_count() == 1).await);
    assert_eq!(hall.received_req_ids(), vec![7]);
    root.cancel();
}

#[tokio::test]
async fn login_with_no_upstream_gets_an_error_reply() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    let (server, addr) = start_gateway(pool, &root).await;

    let mut client = TestClient::connect(&addr, "member-1").await;
    client.send(7, b"login").await;

    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ClientError);
    assert_eq!(frame.req_id, 7);
    // The session never came up.
    assert!(wait_until(|| server.session_count() == 0).await);
    root.cancel();
}

#[tokio::test]
async fn failover_suspends_resumes_and_replays_in_order() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    // Same build, h2 emptier: the session lands on h2.
    let h1 = StubHall::new(100, 40);
    let h2 = StubHall::new(100, 1);
    add_hall(&pool, 1, &start_hall(&h1).await).await;
    add_hall(&pool, 2, &start_hall(&h2).await).await;
    assert!(wait_until(|| pool.agent(1).unwrap().player_count() == 40).await);

    let (_server, addr) = start_gateway(pool.clone(), &root).await;
    let mut client = TestClient::connect(&addr, "member-1").await;
    client.send(7, b"login").await;
    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ClientResponse);
    assert_eq!(h2.received_req_ids(), vec![7]);

    // Kill h2; its streams end, the forwarder must suspend.
    h2.kill();
    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ServerSuspend);

    // Frames sent during the gap are queued.
    client.send(8, b"during-gap-1").await;
    client.send(9, b"during-gap-2").await;

    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ServerResume);

    // The pending queue drains ahead of the next inbound frame.
    client.send(10, b"after-resume").await;

    for expect in [8u64, 9, 10] {
        let frame = client.recv().await;
        assert_eq!(frame.kind, FrameKind::ClientResponse);
        assert_eq!(frame.req_id, expect);
    }
    assert_eq!(h1.received_req_ids(), vec![8, 9, 10]);
    root.cancel();
}

#[tokio::test]
async fn rollout_prefers_the_newer_build_until_it_leaves() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    let old_hall = StubHall::new(100, 0);
    let new_hall = StubHall::new(200, 99);
    let old_addr = start_hall(&old_hall).await;
    let new_addr = start_hall(&new_hall).await;
    add_hall(&pool, 1, &old_addr).await;
    add_hall(&pool, 2, &new_addr).await;
    assert!(wait_until(|| pool.agent(2).unwrap().player_count() == 99).await);

    let (_server, addr) = start_gateway(pool.clone(), &root).await;

    let mut client = TestClient::connect(&addr, "member-1").await;
    client.send(1, b"login").await;
    client.recv().await;
    assert_eq!(new_hall.received_req_ids(), vec![1]);

    // The newer build leaves; fresh logins land on the old one.
    pool.on_peer_delete(&Peer::new("hall", 2, &new_addr));
    new_hall.kill();

    let mut second = TestClient::connect(&addr, "member-2").await;
    second.send(2, b"login").await;
    let frame = second.recv().await;
    assert_eq!(frame.kind, FrameKind::ClientResponse);
    assert_eq!(old_hall.received_req_ids(), vec![2]);
    root.cancel();
}

#[tokio::test]
async fn upstream_kick_closes_the_client_with_the_reason() {
    let root = CancellationToken::new();
    let pool = UpstreamPool::new(pool_config(), &root);
    let hall = StubHall::new(100, 0);
    add_hall(&pool, 1, &start_hall(&hall).await).await;
    let (server, addr) = start_gateway(pool, &root).await;

    let mut client = TestClient::connect(&addr, "member-1").await;
    client.send(1, b"login").await;
    client.recv().await;

    client.send(2, b"kickme").await;
    let frame = client.recv().await;
    assert_eq!(frame.kind, FrameKind::ClientKick);
    assert_eq!(frame.reason(), "requested kick");

    assert!(wait_until(|| server.session_count() == 0).await);
    root.cancel();
}
