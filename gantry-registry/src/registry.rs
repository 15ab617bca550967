//! Registry facade: one lease, three registries, four loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{format_full_name, GantryError, LocalPlayer, Peer, Result, ServiceName};
use gantry_store::{KvStore, LeaseId};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::handler::{PeerHandler, PlayerHandler, ServiceHandler};
use crate::peer::{PeerRegistry, PEER_ATTRIBUTE_PREFIX};
use crate::player::PlayerRegistry;
use crate::service::{RegisterOptions, ServiceRegistry, WhereOptions};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub peer_type: String,
    pub peer_id: i32,
    pub address: String,
    pub metadata: HashMap<String, String>,
    pub lease_ttl_secs: i64,
}

impl RegistryConfig {
    #[must_use]
    pub fn new(peer_type: &str, peer_id: i32, address: &str) -> Self {
        Self {
            peer_type: peer_type.to_string(),
            peer_id,
            address: address.to_string(),
            metadata: HashMap::new(),
            lease_ttl_secs: 10,
        }
    }
}

/// The coordination plane of one peer.
///
/// Owns the session lease every self-publication rides on. Losing the lease
/// keep-alive means this process is partitioned; the registry cancels its
/// scope so the owner can restart cleanly.
pub struct Registry {
    store: Arc<dyn KvStore>,
    token: CancellationToken,
    lease: LeaseId,
    peers: Arc<PeerRegistry>,
    services: Arc<ServiceRegistry>,
    players: Arc<PlayerRegistry>,
}

impl Registry {
    /// Grant the lease, publish self, run startup recovery and start the
    /// watch and keep-alive loops.
    pub async fn start(
        store: Arc<dyn KvStore>,
        config: RegistryConfig,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        if config.peer_type.is_empty() || config.peer_type.contains('/') {
            return Err(GantryError::InvalidArgs);
        }
        let token = parent.child_token();
        let lease = store.lease_grant(config.lease_ttl_secs).await?;

        let mut self_peer = Peer::new(&config.peer_type, config.peer_id, &config.address);
        self_peer.metadata = config.metadata.clone();
        let full_name = format_full_name(&config.peer_type, config.peer_id);
        info!(
            target: "gantry::registry",
            full_name = %full_name,
            lease,
            "registry starting"
        );

        let peers = Arc::new(PeerRegistry::new(self_peer));
        let services = Arc::new(ServiceRegistry::new(peers.clone(), config.peer_id, lease));
        let players = Arc::new(PlayerRegistry::new(peers.clone(), lease));

        peers.publish_self(store.as_ref(), lease).await?;
        services.recover(store.as_ref()).await?;
        players.recover(store.as_ref()).await?;

        // Prime the mirrors before the loops take over, so lookups work the
        // moment start returns.
        let (kvs, _) = store.get_prefix(PEER_ATTRIBUTE_PREFIX).await?;
        peers.resync(&kvs);
        let (kvs, _) = store.get_prefix(crate::service::SERVICE_PREFIX).await?;
        services.resync(&kvs);

        tokio::spawn(peers.clone().run_watch(store.clone(), token.clone()));
        tokio::spawn(services.clone().run_watch(store.clone(), token.clone()));
        tokio::spawn(players.clone().run_watch(store.clone(), token.clone()));

        let registry = Arc::new(Self {
            store,
            token,
            lease,
            peers,
            services,
            players,
        });
        tokio::spawn(registry.clone().run_keep_alive(config.lease_ttl_secs));
        Ok(registry)
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn self_peer(&self) -> &Peer {
        self.peers.self_peer()
    }

    #[must_use]
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    #[must_use]
    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    pub fn add_peer_handler(&self, handler: Arc<dyn PeerHandler>) {
        self.peers.add_handler(handler);
    }

    pub fn add_service_handler(&self, handler: Arc<dyn ServiceHandler>) {
        self.services.add_handler(handler);
    }

    pub fn add_player_handler(&self, handler: Arc<dyn PlayerHandler>) {
        self.players.add_handler(handler);
    }

    pub fn get_peer(&self, full_name: &str) -> Option<Peer> {
        self.peers.get_peer(full_name)
    }

    pub async fn register_service(
        &self,
        name: &str,
        options: RegisterOptions,
    ) -> Result<ServiceName> {
        self.services
            .register(self.store.as_ref(), name, options)
            .await
    }

    pub async fn unregister_service(&self, full_name: &str) -> Result<()> {
        self.services
            .unregister(self.store.as_ref(), full_name)
            .await
    }

    #[must_use]
    pub fn where_is_service(&self, name: &str, options: WhereOptions) -> Vec<Peer> {
        self.services.where_is(name, options)
    }

    pub async fn lock_user(&self, user_id: &str) -> Result<LocalPlayer> {
        self.players.lock_user(self.store.as_ref(), user_id).await
    }

    pub async fn unlock_user(&self, user_id: &str) -> Result<()> {
        self.players.unlock_user(self.store.as_ref(), user_id).await
    }

    pub async fn where_is_user(&self, user_id: &str) -> Result<Peer> {
        self.players
            .where_is_user(self.store.as_ref(), user_id)
            .await
    }

    /// Orderly shutdown: explicit deletes for everything this peer holds,
    /// then the lease itself, then the scope.
    pub async fn stop(&self) {
        info!(target: "gantry::registry", full_name = %self.peers.self_peer().full_name, "registry stopping");
        self.services.unregister_all(self.store.as_ref()).await;
        self.players.unlock_all(self.store.as_ref()).await;
        if let Err(err) = self.store.lease_revoke(self.lease).await {
            error!(target: "gantry::registry", error = %err, "lease revoke failed");
        }
        self.token.cancel();
    }

    async fn run_keep_alive(self: Arc<Self>, ttl_secs: i64) {
        // Renew well inside the TTL; a single missed tick must not cost the
        // lease.
        let period = Duration::from_millis(((ttl_secs.max(1) as u64) * 1000 / 3).max(200));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.store.lease_keep_alive(self.lease).await {
                        error!(
                            target: "gantry::registry",
                            lease = self.lease,
                            error = %err,
                            "lease keep-alive failed, treating process as partitioned"
                        );
                        self.token.cancel();
                        return;
                    }
                }
            }
        }
    }
}
