//! Client-facing gateway server.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{GantryError, Result};
use gantry_net::{parse_client_hello, split, FrameKind};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::{GatewayConn, NetGatewayConn};
use crate::session::Forwarder;
use crate::upstream::UpstreamPool;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GatewayServer {
    pool: Arc<UpstreamPool>,
    token: CancellationToken,
    session_count: AtomicI64,
    next_session_id: AtomicU64,
}

impl GatewayServer {
    #[must_use]
    pub fn new(pool: Arc<UpstreamPool>, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            pool,
            token: parent.child_token(),
            session_count: AtomicI64::new(0),
            next_session_id: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn session_count(&self) -> i64 {
        self.session_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accept clients until the gateway scope is cancelled. Every session is
    /// a child of that scope.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(target: "gantry::gateway", addr = %listener.local_addr()?, "gateway listening");
        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    self.pool.shutdown();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(target: "gantry::gateway", error = %err, "accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_client(stream).await {
                            debug!(target: "gantry::gateway", remote = %remote, error = %err, "client session ended");
                        }
                    });
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut reader, writer) = split(stream);
        let hello = tokio::time::timeout(HELLO_TIMEOUT, reader.read_frame())
            .await
            .map_err(|_| GantryError::Protocol("client hello timed out".to_string()))??;
        if hello.kind != FrameKind::ClientHello {
            return Err(GantryError::Protocol(format!(
                "expected client hello, got {:?}",
                hello.kind
            )));
        }
        let member_id = parse_client_hello(&hello)?;
        let conn: Arc<dyn GatewayConn> =
            Arc::new(NetGatewayConn::new(member_id.clone(), reader, writer));

        // The first request frame is the login; the forwarder replies with
        // an application error if no upstream can take it.
        let first = tokio::select! {
            () = self.token.cancelled() => return Ok(()),
            first = conn.recv() => first?,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.session_count.fetch_add(1, Ordering::AcqRel);
        let forwarder = Forwarder::new(self.pool.clone(), session_id, member_id, &self.token);
        let result = forwarder.serve(conn, first).await;
        self.session_count.fetch_sub(1, Ordering::AcqRel);
        result
    }
}
