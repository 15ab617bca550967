//! The session forwarder: one per accepted client.
//!
//! Two tasks bridge the client and the hall. The client-to-upstream task
//! owns the pending queue outright; nothing else touches it, so ordering is
//! a structural property: queued frames always drain FIFO before anything
//! newer is sent. The upstream-to-client task owns the receive half and, on
//! upstream loss, runs the reselection loop — suspend, pick a new peer every
//! second, swap the sink in place, resume. The replacement stream lives on
//! the session scope, never the upstream's, so an agent dying later cannot
//! tear the session down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{GantryError, Result};
use gantry_net::{HallMessage, SessionSink, SessionStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conn::{ClientMessage, GatewayConn};
use crate::upstream::{sleep_or_cancelled, UpstreamPool};

const RESELECT_RETRY: Duration = Duration::from_secs(1);

type SharedSink = Arc<Mutex<Option<SessionSink>>>;

pub struct Forwarder {
    session_id: u64,
    member_id: String,
    pool: Arc<UpstreamPool>,
    token: CancellationToken,
}

impl Forwarder {
    #[must_use]
    pub fn new(
        pool: Arc<UpstreamPool>,
        session_id: u64,
        member_id: String,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            session_id,
            member_id,
            pool,
            token: parent.child_token(),
        }
    }

    /// Run the session to completion. `first` is the login request that
    /// opened it.
    pub async fn serve(self, client: Arc<dyn GatewayConn>, first: ClientMessage) -> Result<()> {
        let session_id = self.session_id;
        let upstream = match self.pool.select_peer().await {
            Some(upstream) => upstream,
            None => {
                info!(target: "gantry::gateway", session_id, "login with no upstream available");
                let err = GantryError::UpstreamUnavailable;
                let _ = client
                    .error(first.req_id, err.code(), "no upstream available")
                    .await;
                return Err(err);
            }
        };
        let (sink, stream) = match upstream
            .open_client_stream(session_id, &self.member_id)
            .await
        {
            Ok(pair) => pair,
            Err(_) => {
                let err = GantryError::UpstreamUnreachable;
                let _ = client
                    .error(first.req_id, err.code(), "upstream unreachable")
                    .await;
                return Err(err);
            }
        };
        info!(
            target: "gantry::gateway",
            session_id,
            upstream = %upstream.full_name,
            "session open"
        );

        let sender: SharedSink = Arc::new(Mutex::new(Some(sink)));

        let up = tokio::spawn(upstream_to_client(
            stream,
            sender.clone(),
            client.clone(),
            self.pool.clone(),
            self.token.clone(),
            session_id,
            self.member_id.clone(),
        ));
        let down = tokio::spawn(client_to_upstream(
            client.clone(),
            sender,
            self.token.clone(),
            session_id,
            first,
        ));

        let (up_result, down_result) = tokio::join!(up, down);
        for result in [up_result, down_result] {
            if let Err(join_err) = result {
                if join_err.is_panic() {
                    error!(
                        target: "gantry::gateway",
                        session_id,
                        error = %join_err,
                        "forwarder flow panicked"
                    );
                }
            }
        }
        self.token.cancel();
        client.close().await;
        info!(target: "gantry::gateway", session_id, "session close");
        Ok(())
    }
}

/// Forward hall frames to the client; on upstream loss, suspend and
/// reselect until a new stream is in place.
async fn upstream_to_client(
    mut stream: SessionStream,
    sender: SharedSink,
    client: Arc<dyn GatewayConn>,
    pool: Arc<UpstreamPool>,
    token: CancellationToken,
    session_id: u64,
    member_id: String,
) {
    loop {
        let message = tokio::select! {
            () = token.cancelled() => return,
            message = stream.recv() => message,
        };
        match message {
            Ok(HallMessage::Data { route, req_id, data }) => {
                let delivered = if req_id != 0 {
                    client.response(req_id, &data).await
                } else {
                    client.push(&route, &data).await
                };
                if delivered.is_err() {
                    token.cancel();
                    return;
                }
            }
            Ok(HallMessage::UserInstead(reason)) | Ok(HallMessage::Kick(reason)) => {
                info!(target: "gantry::gateway", session_id, reason = %reason, "kicked by upstream");
                let _ = client.kick(&reason).await;
                token.cancel();
                return;
            }
            Err(err) => {
                if token.is_cancelled() {
                    return;
                }
                warn!(
                    target: "gantry::gateway",
                    session_id,
                    error = %err,
                    "upstream stream lost, suspending"
                );
                sender.lock().await.take();
                let _ = client.send_server_suspend("").await;
                match reselect(&pool, &sender, &token, session_id, &member_id).await {
                    Some(new_stream) => {
                        stream = new_stream;
                        let _ = client.send_server_resume("").await;
                        info!(target: "gantry::gateway", session_id, "session resumed");
                    }
                    None => return,
                }
            }
        }
    }
}

/// Pick a new upstream every second until a stream opens or the session
/// dies. The new sink is swapped in for the sender task atomically.
async fn reselect(
    pool: &Arc<UpstreamPool>,
    sender: &SharedSink,
    token: &CancellationToken,
    session_id: u64,
    member_id: &str,
) -> Option<SessionStream> {
    loop {
        if token.is_cancelled() {
            return None;
        }
        let Some(upstream) = pool.select_peer().await else {
            debug!(target: "gantry::gateway", session_id, "no upstream available, retrying");
            if sleep_or_cancelled(token, RESELECT_RETRY).await {
                return None;
            }
            continue;
        };
        match upstream.open_client_stream(session_id, member_id).await {
            Ok((sink, stream)) => {
                *sender.lock().await = Some(sink);
                info!(
                    target: "gantry::gateway",
                    session_id,
                    upstream = %upstream.full_name,
                    "reselected upstream"
                );
                return Some(stream);
            }
            Err(err) => {
                warn!(
                    target: "gantry::gateway",
                    session_id,
                    upstream = %upstream.full_name,
                    error = %err,
                    "reopen failed"
                );
                if sleep_or_cancelled(token, RESELECT_RETRY).await {
                    return None;
                }
            }
        }
    }
}

/// Pump client frames to the current sink, queueing whatever cannot be
/// delivered. The queue drains in order before any newer frame is sent.
async fn client_to_upstream(
    client: Arc<dyn GatewayConn>,
    sender: SharedSink,
    token: CancellationToken,
    session_id: u64,
    first: ClientMessage,
) {
    let mut pending: VecDeque<ClientMessage> = VecDeque::new();
    if let Err(err) = send_via(&sender, &first).await {
        debug!(target: "gantry::gateway", session_id, error = %err, "queueing login frame");
        pending.push_back(first);
    }
    loop {
        let message = tokio::select! {
            () = token.cancelled() => return,
            message = client.recv() => match message {
                Ok(message) => message,
                Err(err) => {
                    debug!(target: "gantry::gateway", session_id, error = %err, "client recv ended");
                    token.cancel();
                    return;
                }
            },
        };
        while let Some(front) = pending.front() {
            match send_via(&sender, front).await {
                Ok(()) => {
                    debug!(target: "gantry::gateway", session_id, req_id = front.req_id, "replayed queued frame");
                    pending.pop_front();
                }
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            pending.push_back(message);
            continue;
        }
        if let Err(err) = send_via(&sender, &message).await {
            warn!(
                target: "gantry::gateway",
                session_id,
                req_id = message.req_id,
                error = %err,
                "upstream send failed, queueing"
            );
            pending.push_back(message);
        }
    }
}

async fn send_via(sender: &SharedSink, message: &ClientMessage) -> Result<()> {
    let mut guard = sender.lock().await;
    match guard.as_mut() {
        None => Err(GantryError::UpstreamUnavailable),
        Some(sink) => {
            if let Err(err) = sink.send(message.req_id, &message.data).await {
                // The sink is dead; drop it so later sends fail fast until
                // the failover path installs a replacement.
                *guard = None;
                return Err(err);
            }
            Ok(())
        }
    }
}
