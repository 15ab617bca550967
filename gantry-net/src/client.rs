//! Gateway-side client for one hall peer.
//!
//! Holds the control connection for unary calls; gate and session streams
//! are separate connections opened on demand.

use std::time::Duration;

use bytes::Bytes;
use gantry_core::{GantryError, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::conn::{split, FrameReader, FrameWriter};
use crate::frame::{Frame, HallMessage, Health, Info};
use crate::protocol::{FrameKind, StreamKind};

/// Per-call ceiling on unary control round-trips.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HallClient {
    addr: String,
    caller: String,
    control: Mutex<(FrameReader, FrameWriter)>,
    connect_timeout: Duration,
}

impl HallClient {
    /// Dial the hall and open the control connection.
    pub async fn connect(addr: &str, caller: &str, connect_timeout: Duration) -> Result<Self> {
        let (reader, writer) =
            open_stream(addr, caller, StreamKind::Control, 0, connect_timeout).await?;
        debug!(target: "gantry::net", addr, caller, "control connection open");
        Ok(Self {
            addr: addr.to_string(),
            caller: caller.to_string(),
            control: Mutex::new((reader, writer)),
            connect_timeout,
        })
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn info(&self) -> Result<Info> {
        let frame = self
            .unary(Frame::info_request(), FrameKind::InfoResponse)
            .await?;
        Info::parse(&frame)
    }

    pub async fn health_check(&self) -> Result<Health> {
        let frame = self
            .unary(Frame::health_request(), FrameKind::HealthResponse)
            .await?;
        Health::parse(&frame)
    }

    /// Open the long-lived control channel the hall may push on.
    pub async fn open_gate_stream(&self) -> Result<GateStream> {
        let (reader, writer) = open_stream(
            &self.addr,
            &self.caller,
            StreamKind::Gate,
            0,
            self.connect_timeout,
        )
        .await?;
        Ok(GateStream {
            reader,
            _writer: writer,
        })
    }

    /// Open one bidirectional session stream.
    pub async fn open_client_stream(
        &self,
        session_id: u64,
        member_id: &str,
    ) -> Result<(SessionSink, SessionStream)> {
        let (reader, writer) = open_stream(
            &self.addr,
            member_id,
            StreamKind::Session,
            session_id,
            self.connect_timeout,
        )
        .await?;
        Ok((
            SessionSink {
                writer,
                session_id,
                member_id: member_id.to_string(),
            },
            SessionStream { reader },
        ))
    }

    async fn unary(&self, request: Frame, expect: FrameKind) -> Result<Frame> {
        let mut guard = self.control.lock().await;
        let (reader, writer) = &mut *guard;
        let response = tokio::time::timeout(RPC_TIMEOUT, async {
            writer.write_frame(&request).await?;
            reader.read_frame().await
        })
        .await
        .map_err(|_| GantryError::Protocol("unary call timed out".to_string()))??;
        if response.kind != expect {
            return Err(GantryError::Protocol(format!(
                "expected {expect:?}, got {:?}",
                response.kind
            )));
        }
        Ok(response)
    }
}

async fn open_stream(
    addr: &str,
    name: &str,
    stream_kind: StreamKind,
    session_id: u64,
    connect_timeout: Duration,
) -> Result<(FrameReader, FrameWriter)> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| GantryError::UpstreamUnreachable)?
        .map_err(|_| GantryError::UpstreamUnreachable)?;
    let (reader, mut writer) = split(stream);
    writer
        .write_frame(&Frame::hello(stream_kind, session_id, name))
        .await?;
    Ok((reader, writer))
}

/// Receiving end of the gate stream. A receive error means the hall is gone.
pub struct GateStream {
    reader: FrameReader,
    _writer: FrameWriter,
}

impl GateStream {
    pub async fn recv(&mut self) -> Result<Frame> {
        self.reader.read_frame().await
    }
}

/// Sending half of a session stream.
pub struct SessionSink {
    writer: FrameWriter,
    session_id: u64,
    member_id: String,
}

impl SessionSink {
    pub async fn send(&mut self, req_id: u64, data: &Bytes) -> Result<()> {
        self.writer
            .write_frame(&Frame::session_data(
                self.session_id,
                req_id,
                &self.member_id,
                data,
            ))
            .await
    }
}

/// Receiving half of a session stream.
pub struct SessionStream {
    reader: FrameReader,
}

impl SessionStream {
    pub async fn recv(&mut self) -> Result<HallMessage> {
        let frame = self.reader.read_frame().await?;
        HallMessage::parse(&frame)
    }
}
