//! Hall-side listener: accepts connections and dispatches them by the
//! stream kind announced in the opening hello.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{GantryError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::{split, FrameReader, FrameWriter};
use crate::frame::{Frame, Health, Hello, Info};
use crate::protocol::{FrameKind, StreamKind};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// One accepted session stream, handed to the hall whole.
pub struct SessionChannel {
    pub session_id: u64,
    pub member_id: String,
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

/// What a hall exposes to its gateways.
#[async_trait]
pub trait HallApi: Send + Sync + 'static {
    async fn info(&self) -> Info;
    async fn health(&self) -> Health;
    /// Runs for the lifetime of one session stream.
    async fn on_session(&self, session: SessionChannel);
}

pub struct HallListener {
    listener: TcpListener,
}

impl HallListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve the wire surface until the token is cancelled.
    pub async fn serve(self, api: Arc<dyn HallApi>, token: CancellationToken) -> Result<()> {
        let listener = self.listener;
        info!(target: "gantry::net", addr = %listener.local_addr()?, "hall listening");
        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(target: "gantry::net", error = %err, "accept failed");
                            continue;
                        }
                    };
                    let api = api.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(stream, api, token).await {
                            debug!(target: "gantry::net", remote = %remote, error = %err, "connection ended");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_conn(
    stream: TcpStream,
    api: Arc<dyn HallApi>,
    token: CancellationToken,
) -> Result<()> {
    let (mut reader, writer) = split(stream);
    let first = tokio::time::timeout(HELLO_TIMEOUT, reader.read_frame())
        .await
        .map_err(|_| GantryError::Protocol("hello timed out".to_string()))??;
    if first.kind != FrameKind::Hello {
        return Err(GantryError::Protocol(format!(
            "expected hello, got {:?}",
            first.kind
        )));
    }
    let hello = Hello::parse(&first)?;
    match hello.stream {
        StreamKind::Control => serve_control(reader, writer, api, token).await,
        StreamKind::Gate => serve_gate(reader, hello, token).await,
        StreamKind::Session => {
            api.on_session(SessionChannel {
                session_id: first.session_id,
                member_id: hello.name,
                reader,
                writer,
            })
            .await;
            Ok(())
        }
    }
}

async fn serve_control(
    mut reader: FrameReader,
    mut writer: FrameWriter,
    api: Arc<dyn HallApi>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            () = token.cancelled() => return Ok(()),
            frame = reader.read_frame() => frame?,
        };
        match frame.kind {
            FrameKind::InfoRequest => {
                let info = api.info().await;
                writer.write_frame(&Frame::info_response(&info)).await?;
            }
            FrameKind::HealthRequest => {
                let health = api.health().await;
                writer.write_frame(&Frame::health_response(&health)).await?;
            }
            other => {
                return Err(GantryError::Protocol(format!(
                    "unexpected control frame {other:?}"
                )))
            }
        }
    }
}

/// The gate stream carries liveness: hold it open until the gateway drops
/// it or we shut down. Shutting down closes it, which is exactly the signal
/// gateways key their failover on.
async fn serve_gate(
    mut reader: FrameReader,
    hello: Hello,
    token: CancellationToken,
) -> Result<()> {
    debug!(target: "gantry::net", gateway = %hello.name, "gate stream open");
    loop {
        tokio::select! {
            () = token.cancelled() => return Ok(()),
            frame = reader.read_frame() => {
                // Gateways do not currently send on the gate stream; tolerate
                // pings, bail on close.
                frame?;
            }
        }
    }
}
