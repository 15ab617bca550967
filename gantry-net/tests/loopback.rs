//! Client/listener conversations over loopback TCP.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gantry_net::{
    Frame, HallApi, HallClient, HallListener, HallMessage, HallStatus, Health, Info,
    SessionChannel,
};
use tokio_util::sync::CancellationToken;

struct EchoHall;

#[async_trait]
impl HallApi for EchoHall {
    async fn info(&self) -> Info {
        Info {
            build_time: 424_242,
            app_version: "0.3.0".to_string(),
        }
    }

    async fn health(&self) -> Health {
        Health {
            status: HallStatus::Ok,
            player_count: 5,
        }
    }

    async fn on_session(&self, mut session: SessionChannel) {
        while let Ok(frame) = session.reader.read_frame().await {
            let (member_id, data) = gantry_net::parse_session_data(&frame).unwrap();
            assert_eq!(member_id, session.member_id);
            let reply = Frame::hall_data(session.session_id, frame.req_id, "echo", &data);
            if session.writer.write_frame(&reply).await.is_err() {
                return;
            }
        }
    }
}

async fn start_hall(token: &CancellationToken) -> String {
    let listener = HallListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(listener.serve(Arc::new(EchoHall), token.clone()));
    addr
}

#[tokio::test]
async fn unary_calls_roundtrip_on_the_control_connection() {
    let token = CancellationToken::new();
    let addr = start_hall(&token).await;

    let client = HallClient::connect(&addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let info = client.info().await.unwrap();
    assert_eq!(info.build_time, 424_242);
    assert_eq!(info.app_version, "0.3.0");

    let health = client.health_check().await.unwrap();
    assert_eq!(health.status, HallStatus::Ok);
    assert_eq!(health.player_count, 5);

    // Calls serialize on one connection; a second pair still works.
    let info = client.info().await.unwrap();
    assert_eq!(info.build_time, 424_242);
    token.cancel();
}

#[tokio::test]
async fn session_stream_echoes_in_order() {
    let token = CancellationToken::new();
    let addr = start_hall(&token).await;
    let client = HallClient::connect(&addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let (mut sink, mut stream) = client.open_client_stream(11, "member-7").await.unwrap();
    for req_id in 1..=3u64 {
        sink.send(req_id, &Bytes::from(format!("req-{req_id}")))
            .await
            .unwrap();
    }
    for req_id in 1..=3u64 {
        match stream.recv().await.unwrap() {
            HallMessage::Data {
                route,
                req_id: got,
                data,
            } => {
                assert_eq!(route, "echo");
                assert_eq!(got, req_id);
                assert_eq!(data, Bytes::from(format!("req-{req_id}")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    token.cancel();
}

#[tokio::test]
async fn gate_stream_ends_when_the_hall_shuts_down() {
    let token = CancellationToken::new();
    let addr = start_hall(&token).await;
    let client = HallClient::connect(&addr, "gateway/1", Duration::from_secs(1))
        .await
        .unwrap();

    let mut gate = client.open_gate_stream().await.unwrap();
    // Give the listener a beat to adopt the gate connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), gate.recv()).await;
    assert!(matches!(result, Ok(Err(_))));
}

#[tokio::test]
async fn connect_to_dead_address_is_unreachable() {
    let err = HallClient::connect("127.0.0.1:1", "gateway/1", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        gantry_core::GantryError::UpstreamUnreachable
    ));
}
