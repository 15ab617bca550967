//! The client-facing connection surface.
//!
//! The forwarder only ever talks to [`GatewayConn`]; [`NetGatewayConn`] is
//! the framed-TCP implementation the gateway server hands it.

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::Result;
use gantry_net::{Frame, FrameKind, FrameReader, FrameWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// One client-originated request frame.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub req_id: u64,
    pub data: Bytes,
}

/// Abstract client connection as the forwarder sees it.
#[async_trait]
pub trait GatewayConn: Send + Sync + 'static {
    async fn recv(&self) -> Result<ClientMessage>;
    async fn response(&self, req_id: u64, data: &Bytes) -> Result<()>;
    async fn push(&self, route: &str, data: &Bytes) -> Result<()>;
    /// Application-level error reply on a specific request.
    async fn error(&self, req_id: u64, code: i32, message: &str) -> Result<()>;
    async fn send_server_suspend(&self, reason: &str) -> Result<()>;
    async fn send_server_resume(&self, reason: &str) -> Result<()>;
    /// Authoritative close with a reason; no further frames follow.
    async fn kick(&self, reason: &str) -> Result<()>;
    async fn close(&self);
}

pub struct NetGatewayConn {
    member_id: String,
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
}

impl NetGatewayConn {
    #[must_use]
    pub fn new(member_id: String, reader: FrameReader, writer: FrameWriter) -> Self {
        Self {
            member_id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    #[must_use]
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        self.writer.lock().await.write_frame(&frame).await
    }
}

#[async_trait]
impl GatewayConn for NetGatewayConn {
    async fn recv(&self) -> Result<ClientMessage> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = reader.read_frame().await?;
            match frame.kind {
                FrameKind::ClientRequest => {
                    return Ok(ClientMessage {
                        req_id: frame.req_id,
                        data: frame.payload,
                    })
                }
                other => {
                    debug!(
                        target: "gantry::gateway",
                        member_id = %self.member_id,
                        kind = ?other,
                        "ignoring unexpected client frame"
                    );
                }
            }
        }
    }

    async fn response(&self, req_id: u64, data: &Bytes) -> Result<()> {
        self.write(Frame::client_response(req_id, data)).await
    }

    async fn push(&self, route: &str, data: &Bytes) -> Result<()> {
        self.write(Frame::client_push(route, data)).await
    }

    async fn error(&self, req_id: u64, code: i32, message: &str) -> Result<()> {
        self.write(Frame::client_error(req_id, code, message)).await
    }

    async fn send_server_suspend(&self, reason: &str) -> Result<()> {
        self.write(Frame::reason_frame(FrameKind::ServerSuspend, reason))
            .await
    }

    async fn send_server_resume(&self, reason: &str) -> Result<()> {
        self.write(Frame::reason_frame(FrameKind::ServerResume, reason))
            .await
    }

    async fn kick(&self, reason: &str) -> Result<()> {
        self.write(Frame::reason_frame(FrameKind::ClientKick, reason))
            .await?;
        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}
