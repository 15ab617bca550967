//! Fleet-wide exclusive ownership of user ids.
//!
//! A lock is one transaction guarded on `/peer_type/user/<type>/<uid>` never
//! having been created by a live peer. `/user/<uid>` and the guard ride the
//! session lease so a crashed owner frees its users at lease expiry, while
//! `/peer/user/<self>/<uid>` stays durable as the recovery record for a
//! clean restart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use gantry_core::{GantryError, LocalPlayer, Peer, Result};
use gantry_store::{Cmp, CmpOp, EventKind, KeyValue, KvStore, LeaseId, Txn, TxnOp, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{notify, PlayerHandler};
use crate::peer::{read_lock, sleep_or_cancelled, write_lock, PeerRegistry};

pub(crate) const USER_PREFIX: &str = "/user/";
pub(crate) const PEER_USER_PREFIX: &str = "/peer/user/";
pub(crate) const PEER_TYPE_USER_PREFIX: &str = "/peer_type/user/";

pub struct PlayerRegistry {
    peers: Arc<PeerRegistry>,
    peer_prefix: String,
    peer_type_prefix: String,
    self_full_name: String,
    lease: LeaseId,
    local_players: RwLock<HashMap<String, LocalPlayer>>,
    handlers: RwLock<Vec<Arc<dyn PlayerHandler>>>,
}

impl PlayerRegistry {
    #[must_use]
    pub(crate) fn new(peers: Arc<PeerRegistry>, lease: LeaseId) -> Self {
        let self_peer = peers.self_peer();
        let peer_prefix = format!("{PEER_USER_PREFIX}{}/", self_peer.full_name);
        let peer_type_prefix = format!("{PEER_TYPE_USER_PREFIX}{}/", self_peer.type_name);
        let self_full_name = self_peer.full_name.clone();
        Self {
            peers,
            peer_prefix,
            peer_type_prefix,
            self_full_name,
            lease,
            local_players: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn PlayerHandler>) {
        let known: Vec<LocalPlayer> = read_lock(&self.local_players).values().cloned().collect();
        for player in &known {
            handler.on_local_player_add(player);
        }
        write_lock(&self.handlers).push(handler);
    }

    #[must_use]
    pub fn local_player(&self, user_id: &str) -> Option<LocalPlayer> {
        read_lock(&self.local_players).get(user_id).cloned()
    }

    #[must_use]
    pub fn list_local_users(&self) -> Vec<String> {
        read_lock(&self.local_players).keys().cloned().collect()
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        read_lock(&self.local_players).len()
    }

    /// Claim exclusive ownership of `user_id` across the fleet.
    pub async fn lock_user(&self, store: &dyn KvStore, user_id: &str) -> Result<LocalPlayer> {
        if user_id.is_empty() {
            return Err(GantryError::InvalidArgs);
        }
        let user_key = format!("{USER_PREFIX}{user_id}");
        let local_key = format!("{}{user_id}", self.peer_prefix);
        let guard_key = format!("{}{user_id}", self.peer_type_prefix);
        let login_time = unix_now();

        let result = store
            .txn(
                Txn::new()
                    .when(vec![Cmp::create_revision(&guard_key, CmpOp::Equal, 0)])
                    .and_then(vec![
                        TxnOp::put(&user_key, &self.self_full_name, Some(self.lease)),
                        TxnOp::put(&local_key, &login_time.to_string(), None),
                        TxnOp::put(&guard_key, &self.self_full_name, Some(self.lease)),
                    ])
                    .or_else(vec![TxnOp::get(&guard_key)]),
            )
            .await?;

        if !result.succeeded {
            let holder = result.first_get_value().map(str::to_string);
            warn!(
                target: "gantry::registry",
                user_id,
                locked_by = holder.as_deref().unwrap_or("<unknown>"),
                "user lock conflict"
            );
            let owner = holder
                .as_deref()
                .and_then(|name| self.peers.get_peer(name))
                .map(Box::new);
            return Err(GantryError::UserLocked { owner });
        }

        let player = LocalPlayer {
            user_id: user_id.to_string(),
            login_time,
            create_revision: result.revision,
        };
        info!(
            target: "gantry::registry",
            user_id,
            create_revision = player.create_revision,
            "user locked"
        );
        self.adopt(player.clone());
        Ok(player)
    }

    /// Release ownership of `user_id`.
    ///
    /// Guarded on the recorded create revision, so a stale unlock can never
    /// evict a newer login.
    pub async fn unlock_user(&self, store: &dyn KvStore, user_id: &str) -> Result<()> {
        let player = self
            .local_player(user_id)
            .ok_or(GantryError::UserNotFound)?;
        let user_key = format!("{USER_PREFIX}{user_id}");
        let local_key = format!("{}{user_id}", self.peer_prefix);
        let guard_key = format!("{}{user_id}", self.peer_type_prefix);

        let result = store
            .txn(
                Txn::new()
                    .when(vec![Cmp::create_revision(
                        &user_key,
                        CmpOp::Equal,
                        player.create_revision,
                    )])
                    .and_then(vec![
                        TxnOp::delete(&local_key),
                        TxnOp::delete(&guard_key),
                        TxnOp::delete(&user_key),
                    ])
                    .or_else(vec![TxnOp::get(&guard_key)]),
            )
            .await?;

        if !result.succeeded {
            let owner = result
                .first_get_value()
                .and_then(|name| self.peers.get_peer(name))
                .map(Box::new);
            warn!(target: "gantry::registry", user_id, "user unlock guard miss");
            return Err(GantryError::UserLocked { owner });
        }

        info!(target: "gantry::registry", user_id, "user unlocked");
        self.drop_player(user_id);
        Ok(())
    }

    /// Which peer serves `user_id` right now? Own players short-circuit.
    pub async fn where_is_user(&self, store: &dyn KvStore, user_id: &str) -> Result<Peer> {
        if read_lock(&self.local_players).contains_key(user_id) {
            return Ok(self.peers.self_peer().clone());
        }
        let user_key = format!("{USER_PREFIX}{user_id}");
        let kv = store.get(&user_key).await?.ok_or(GantryError::UserNotFound)?;
        self.peers
            .get_peer(&kv.value)
            .ok_or(GantryError::PeerNotFound)
    }

    /// Re-adopt players recorded under `/peer/user/<self>/` by a previous
    /// incarnation of this peer.
    pub(crate) async fn recover(&self, store: &dyn KvStore) -> Result<()> {
        let (kvs, _) = store.get_prefix(&self.peer_prefix).await?;
        for kv in &kvs {
            self.apply_event(&WatchEvent {
                kind: EventKind::Put,
                kv: kv.clone(),
                prev_kv: None,
            });
        }
        if !kvs.is_empty() {
            info!(target: "gantry::registry", recovered = kvs.len(), "recovered local players");
        }
        Ok(())
    }

    /// Release every local player, guarded only on the recovery record still
    /// existing.
    pub(crate) async fn unlock_all(&self, store: &dyn KvStore) {
        for user_id in self.list_local_users() {
            let user_key = format!("{USER_PREFIX}{user_id}");
            let local_key = format!("{}{user_id}", self.peer_prefix);
            let guard_key = format!("{}{user_id}", self.peer_type_prefix);
            let txn = Txn::new()
                .when(vec![Cmp::create_revision(&local_key, CmpOp::NotEqual, 0)])
                .and_then(vec![
                    TxnOp::delete(&local_key),
                    TxnOp::delete(&guard_key),
                    TxnOp::delete(&user_key),
                ]);
            match store.txn(txn).await {
                Ok(result) if result.succeeded => {
                    debug!(target: "gantry::registry", user_id = %user_id, "user released");
                }
                Ok(_) => {
                    warn!(target: "gantry::registry", user_id = %user_id, "user release guard miss");
                }
                Err(err) => {
                    warn!(target: "gantry::registry", user_id = %user_id, error = %err, "user release failed");
                }
            }
            self.drop_player(&user_id);
        }
    }

    /// Watch this peer's own `/peer/user/<self>/` prefix until cancelled.
    pub(crate) async fn run_watch(self: Arc<Self>, store: Arc<dyn KvStore>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let (kvs, revision) = match store.get_prefix(&self.peer_prefix).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "player snapshot failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            self.resync(&kvs);
            let mut stream = match store.watch_prefix(&self.peer_prefix, revision + 1).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "player watch failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(target: "gantry::registry", watch_start_revision = revision + 1, "player registry watching");
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    batch = stream.recv() => match batch {
                        Some(events) => {
                            for event in events {
                                self.apply_event(&event);
                            }
                        }
                        None => {
                            warn!(target: "gantry::registry", "player watch stream closed, resyncing");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn apply_event(&self, event: &WatchEvent) {
        let Some(user_id) = event.kv.key.strip_prefix(self.peer_prefix.as_str()) else {
            warn!(target: "gantry::registry", key = %event.kv.key, "invalid player key");
            return;
        };
        match event.kind {
            EventKind::Put => {
                let Ok(login_time) = event.kv.value.parse::<i64>() else {
                    warn!(target: "gantry::registry", user_id, value = %event.kv.value, "invalid login time");
                    return;
                };
                if read_lock(&self.local_players).contains_key(user_id) {
                    // Re-put for a player we already track; keep ours.
                    warn!(target: "gantry::registry", user_id, "player already present");
                    return;
                }
                self.adopt(LocalPlayer {
                    user_id: user_id.to_string(),
                    login_time,
                    create_revision: event.kv.create_revision,
                });
            }
            EventKind::Delete => self.drop_player(user_id),
        }
    }

    fn resync(&self, kvs: &[KeyValue]) {
        let desired: HashMap<&str, &KeyValue> = kvs
            .iter()
            .filter_map(|kv| {
                kv.key
                    .strip_prefix(self.peer_prefix.as_str())
                    .map(|uid| (uid, kv))
            })
            .collect();
        let stale: Vec<String> = read_lock(&self.local_players)
            .keys()
            .filter(|uid| !desired.contains_key(uid.as_str()))
            .cloned()
            .collect();
        for user_id in stale {
            self.drop_player(&user_id);
        }
        for (_, kv) in desired {
            self.apply_event(&WatchEvent {
                kind: EventKind::Put,
                kv: (*kv).clone(),
                prev_kv: None,
            });
        }
    }

    fn adopt(&self, player: LocalPlayer) {
        {
            let mut players = write_lock(&self.local_players);
            if players.contains_key(&player.user_id) {
                return;
            }
            players.insert(player.user_id.clone(), player.clone());
        }
        let handlers = read_lock(&self.handlers).clone();
        notify(&handlers, "player", |h| h.on_local_player_add(&player));
    }

    fn drop_player(&self, user_id: &str) {
        let removed = write_lock(&self.local_players).remove(user_id);
        let Some(player) = removed else {
            debug!(target: "gantry::registry", user_id, "delete for unknown player");
            return;
        };
        let handlers = read_lock(&self.handlers).clone();
        notify(&handlers, "player", |h| h.on_local_player_delete(&player));
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
