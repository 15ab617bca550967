//! Upstream agents and the selection policy.
//!
//! One agent per hall peer, running three activities under the agent's
//! scope: a one second dial loop, the gate-stream receiver and a periodic
//! health check. The agent publishes `{client, build_time, player_count,
//! status}` through atomics and a lock the selection path reads without
//! blocking the agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use gantry_core::{GantryError, Peer, Result};
use gantry_net::{HallClient, HallStatus, Health, SessionSink, SessionStream};
use gantry_registry::PeerHandler;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DIAL_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Peer type served by this pool.
    pub hall_type: String,
    /// Our own full name, announced on every hall connection.
    pub self_full_name: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    #[must_use]
    pub fn new(hall_type: &str, self_full_name: &str) -> Self {
        Self {
            hall_type: hall_type.to_string(),
            self_full_name: self_full_name.to_string(),
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A gateway's view of one hall peer.
pub struct Upstream {
    pub id: i32,
    pub full_name: String,
    address: RwLock<String>,
    client: RwLock<Option<Arc<HallClient>>>,
    build_time: AtomicI64,
    player_count: AtomicI64,
    status: AtomicU8,
    app_version: RwLock<String>,
    token: CancellationToken,
}

impl Upstream {
    fn new(peer: &Peer, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: peer.id,
            full_name: peer.full_name.clone(),
            address: RwLock::new(peer.address.clone()),
            client: RwLock::new(None),
            build_time: AtomicI64::new(0),
            player_count: AtomicI64::new(0),
            status: AtomicU8::new(HallStatus::Unavailable as u8),
            app_version: RwLock::new(String::new()),
            token: parent.child_token(),
        })
    }

    #[must_use]
    pub fn build_time(&self) -> i64 {
        self.build_time.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn player_count(&self) -> i64 {
        self.player_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> HallStatus {
        HallStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn app_version(&self) -> String {
        read_lock(&self.app_version).clone()
    }

    /// Live client handle present and the agent not torn down.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.token.is_cancelled() && read_lock(&self.client).is_some()
    }

    fn client(&self) -> Result<Arc<HallClient>> {
        read_lock(&self.client)
            .clone()
            .ok_or(GantryError::NullPointer("upstream client"))
    }

    /// Probe the hall and refresh the published snapshot. Non-OK status is
    /// an error so the selection policy can reject without a fallback.
    pub async fn health_check(&self) -> Result<Health> {
        let client = self.client()?;
        let health = client.health_check().await?;
        self.player_count.store(health.player_count, Ordering::Release);
        self.status.store(health.status as u8, Ordering::Release);
        if health.status != HallStatus::Ok {
            return Err(GantryError::UpstreamUnavailable);
        }
        Ok(health)
    }

    pub async fn open_client_stream(
        &self,
        session_id: u64,
        member_id: &str,
    ) -> Result<(SessionSink, SessionStream)> {
        let client = self.client()?;
        client.open_client_stream(session_id, member_id).await
    }

    fn close(&self) {
        self.token.cancel();
    }

    async fn serve(self: Arc<Self>, config: Arc<UpstreamConfig>) {
        let address = read_lock(&self.address).clone();
        // Dial until the scope dies.
        let client = loop {
            match HallClient::connect(&address, &config.self_full_name, config.connect_timeout)
                .await
            {
                Ok(client) => break Arc::new(client),
                Err(err) => {
                    warn!(
                        target: "gantry::gateway",
                        full_name = %self.full_name,
                        address = %address,
                        error = %err,
                        "upstream dial failed"
                    );
                    if sleep_or_cancelled(&self.token, DIAL_RETRY).await {
                        return;
                    }
                }
            }
        };
        debug!(target: "gantry::gateway", full_name = %self.full_name, "upstream dialed");

        let mut gate = loop {
            match client.open_gate_stream().await {
                Ok(gate) => break gate,
                Err(err) => {
                    warn!(
                        target: "gantry::gateway",
                        full_name = %self.full_name,
                        error = %err,
                        "gate stream open failed"
                    );
                    if sleep_or_cancelled(&self.token, DIAL_RETRY).await {
                        return;
                    }
                }
            }
        };

        let hall_info = match client.info().await {
            Ok(info) => info,
            Err(err) => {
                warn!(
                    target: "gantry::gateway",
                    full_name = %self.full_name,
                    error = %err,
                    "upstream info failed"
                );
                self.finish();
                return;
            }
        };
        self.build_time.store(hall_info.build_time, Ordering::Release);
        *write_lock(&self.app_version) = hall_info.app_version.clone();
        *write_lock(&self.client) = Some(client.clone());
        self.status.store(HallStatus::Ok as u8, Ordering::Release);
        info!(
            target: "gantry::gateway",
            full_name = %self.full_name,
            build_time = hall_info.build_time,
            app_version = %hall_info.app_version,
            "upstream ready"
        );

        // Heartbeat runs beside the gate receiver; the gate stream ending is
        // the agent's exit condition.
        let heartbeat_token = self.token.child_token();
        let heartbeat = tokio::spawn({
            let upstream = self.clone();
            let client = client.clone();
            let token = heartbeat_token.clone();
            let period = config.heartbeat_interval;
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = token.cancelled() => return,
                        _ = ticker.tick() => match client.health_check().await {
                            Ok(health) => {
                                upstream.player_count.store(health.player_count, Ordering::Release);
                                upstream.status.store(health.status as u8, Ordering::Release);
                                debug!(
                                    target: "gantry::gateway",
                                    full_name = %upstream.full_name,
                                    player_count = health.player_count,
                                    "heartbeat"
                                );
                            }
                            Err(err) => {
                                warn!(
                                    target: "gantry::gateway",
                                    full_name = %upstream.full_name,
                                    error = %err,
                                    "heartbeat failed"
                                );
                            }
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                frame = gate.recv() => match frame {
                    Ok(frame) => {
                        debug!(target: "gantry::gateway", full_name = %self.full_name, kind = ?frame.kind, "gate recv");
                    }
                    Err(err) => {
                        warn!(
                            target: "gantry::gateway",
                            full_name = %self.full_name,
                            error = %err,
                            "gate stream ended"
                        );
                        break;
                    }
                }
            }
        }

        heartbeat_token.cancel();
        let _ = heartbeat.await;
        self.finish();
        info!(target: "gantry::gateway", full_name = %self.full_name, "upstream agent exit");
    }

    /// Publish the terminal snapshot and cancel the agent scope. The pool
    /// recreates the agent on the next peer event.
    fn finish(&self) {
        *write_lock(&self.client) = None;
        self.status
            .store(HallStatus::Unavailable as u8, Ordering::Release);
        self.token.cancel();
    }
}

/// One agent per hall peer, plugged into peer discovery.
pub struct UpstreamPool {
    config: Arc<UpstreamConfig>,
    token: CancellationToken,
    agents: RwLock<HashMap<i32, Arc<Upstream>>>,
}

impl UpstreamPool {
    #[must_use]
    pub fn new(config: UpstreamConfig, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            token: parent.child_token(),
            agents: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn agent(&self, id: i32) -> Option<Arc<Upstream>> {
        read_lock(&self.agents).get(&id).cloned()
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        read_lock(&self.agents).len()
    }

    /// Deterministic given the snapshots: freshest `build_time` first, then
    /// the smallest `player_count`; the winner must still pass a health
    /// probe. No second choice is tried — the caller retries.
    pub async fn select_peer(&self) -> Option<Arc<Upstream>> {
        let candidates: Vec<Arc<Upstream>> = read_lock(&self.agents).values().cloned().collect();

        let mut max_build_time = 0;
        for upstream in &candidates {
            if upstream.is_connected() && upstream.build_time() > max_build_time {
                max_build_time = upstream.build_time();
            }
        }
        let mut selected: Option<Arc<Upstream>> = None;
        let mut min_players = i64::MAX;
        for upstream in &candidates {
            if upstream.is_connected()
                && upstream.build_time() == max_build_time
                && upstream.player_count() < min_players
            {
                min_players = upstream.player_count();
                selected = Some(upstream.clone());
            }
        }
        let selected = selected?;
        match selected.health_check().await {
            Ok(_) => Some(selected),
            Err(err) => {
                warn!(
                    target: "gantry::gateway",
                    full_name = %selected.full_name,
                    error = %err,
                    "selected peer failed pre-select probe"
                );
                None
            }
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        for agent in read_lock(&self.agents).values() {
            agent.close();
        }
    }

    fn spawn_agent(&self, peer: &Peer) {
        let upstream = Upstream::new(peer, &self.token);
        let previous = write_lock(&self.agents).insert(peer.id, upstream.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        info!(
            target: "gantry::gateway",
            full_name = %peer.full_name,
            address = %peer.address,
            "upstream added"
        );
        tokio::spawn(upstream.serve(self.config.clone()));
    }
}

impl PeerHandler for UpstreamPool {
    fn on_peer_add(&self, peer: &Peer) {
        if peer.type_name != self.config.hall_type {
            return;
        }
        self.spawn_agent(peer);
    }

    fn on_peer_update(&self, peer: &Peer) {
        if peer.type_name != self.config.hall_type {
            return;
        }
        if let Some(agent) = read_lock(&self.agents).get(&peer.id) {
            *write_lock(&agent.address) = peer.address.clone();
        }
    }

    fn on_peer_delete(&self, peer: &Peer) {
        if peer.type_name != self.config.hall_type {
            return;
        }
        let removed = write_lock(&self.agents).remove(&peer.id);
        if let Some(agent) = removed {
            info!(target: "gantry::gateway", full_name = %peer.full_name, "upstream removed");
            agent.close();
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) async fn sleep_or_cancelled(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = tokio::time::sleep(period) => false,
    }
}
