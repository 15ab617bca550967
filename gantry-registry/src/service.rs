//! Named service locks and the global service mirror.
//!
//! Registration is one conditional transaction against the pair
//! `/service/<name>` + `/peer/service/<self>/<name>`: create both iff the
//! service key was never created, otherwise read back the current owner.
//! A watch over `/service/` mirrors the whole fleet's services into a local
//! map plus a prefix trie for catalog lookups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gantry_core::{split_segments, GantryError, Result, ServiceName};
use gantry_store::{
    Cmp, CmpOp, EventKind, KeyValue, KvStore, LeaseId, Txn, TxnOp, WatchEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{notify, ServiceHandler};
use crate::peer::{read_lock, sleep_or_cancelled, write_lock, PeerRegistry};
use crate::trie::WordTrie;

pub(crate) const SERVICE_PREFIX: &str = "/service/";
pub(crate) const PEER_SERVICE_PREFIX: &str = "/peer/service/";

/// Options for [`ServiceRegistry::register`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Suffix the service name with this peer's id, so each peer holds its
    /// own instance of the name.
    pub as_app_service: bool,
}

/// Options for [`ServiceRegistry::where_is`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WhereOptions {
    /// Match every service under the name instead of the exact name.
    pub prefix: bool,
    /// Catalog mode; same matching as `prefix`.
    pub catalog: bool,
    /// Cap on returned peers for prefix/catalog lookups. `0` is unbounded.
    pub max_count: usize,
}

pub struct ServiceRegistry {
    peers: Arc<PeerRegistry>,
    peer_service_prefix: String,
    self_full_name: String,
    app_id: i32,
    lease: LeaseId,
    services: RwLock<HashMap<String, ServiceName>>,
    self_services: RwLock<HashMap<String, ServiceName>>,
    index: WordTrie,
    handlers: RwLock<Vec<Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub(crate) fn new(peers: Arc<PeerRegistry>, app_id: i32, lease: LeaseId) -> Self {
        let self_full_name = peers.self_peer().full_name.clone();
        Self {
            peers,
            peer_service_prefix: format!("{PEER_SERVICE_PREFIX}{self_full_name}/"),
            self_full_name,
            app_id,
            lease,
            services: RwLock::new(HashMap::new()),
            self_services: RwLock::new(HashMap::new()),
            index: WordTrie::new(),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn ServiceHandler>) {
        let known: Vec<ServiceName> = read_lock(&self.services).values().cloned().collect();
        for service in &known {
            handler.on_service_add(service);
        }
        write_lock(&self.handlers).push(handler);
    }

    /// The name a registration would claim after options are applied.
    #[must_use]
    pub fn scoped_name(&self, name: &str, options: RegisterOptions) -> String {
        if options.as_app_service {
            format!("{name}/{}", self.app_id)
        } else {
            name.to_string()
        }
    }

    /// Claim `name` for this peer.
    ///
    /// On conflict the error carries the owning peer, when discovery knows it.
    pub async fn register(
        &self,
        store: &dyn KvStore,
        name: &str,
        options: RegisterOptions,
    ) -> Result<ServiceName> {
        let full_name = self.scoped_name(name, options);
        let segments = split_segments(&full_name).map_err(|_| GantryError::InvalidService)?;
        if segments.is_empty() {
            return Err(GantryError::InvalidService);
        }
        let type_name = (segments.len() > 1).then(|| segments[0].to_string());

        let service_key = format!("{SERVICE_PREFIX}{full_name}");
        let peer_key = format!("{}{full_name}", self.peer_service_prefix);
        debug!(target: "gantry::registry", service_key = %service_key, "register service");
        let result = store
            .txn(
                Txn::new()
                    .when(vec![Cmp::create_revision(&service_key, CmpOp::Equal, 0)])
                    .and_then(vec![
                        TxnOp::put(&service_key, &self.self_full_name, Some(self.lease)),
                        TxnOp::put(&peer_key, &self.self_full_name, Some(self.lease)),
                    ])
                    .or_else(vec![TxnOp::get(&service_key)]),
            )
            .await?;

        if !result.succeeded {
            let owner_name = result.first_get_value().map(str::to_string);
            warn!(
                target: "gantry::registry",
                service_name = %full_name,
                locked_by = owner_name.as_deref().unwrap_or("<unknown>"),
                "service register conflict"
            );
            let owner = owner_name
                .as_deref()
                .and_then(|name| self.peers.get_peer(name))
                .map(Box::new);
            return Err(GantryError::ServiceLocked { owner });
        }

        let service = ServiceName {
            full_name: full_name.clone(),
            type_name,
            peer_full_name: self.self_full_name.clone(),
            is_self: true,
            create_revision: result.revision,
        };
        self.adopt(service.clone());
        Ok(service)
    }

    /// Release a name this peer holds. The name must already be app-scoped
    /// if it was registered that way.
    pub async fn unregister(&self, store: &dyn KvStore, full_name: &str) -> Result<()> {
        let service_key = format!("{SERVICE_PREFIX}{full_name}");
        let peer_key = format!("{}{full_name}", self.peer_service_prefix);
        let result = store
            .txn(
                Txn::new()
                    .when(vec![
                        Cmp::value(&service_key, CmpOp::Equal, &self.self_full_name),
                        Cmp::create_revision(&service_key, CmpOp::NotEqual, 0),
                    ])
                    .and_then(vec![TxnOp::delete(&peer_key), TxnOp::delete(&service_key)])
                    .or_else(vec![TxnOp::get(&service_key)]),
            )
            .await?;

        if !result.succeeded {
            let owner = result
                .first_get_value()
                .and_then(|name| self.peers.get_peer(name))
                .map(Box::new);
            warn!(target: "gantry::registry", service_name = %full_name, "service unregister conflict");
            return Err(GantryError::ServiceLocked { owner });
        }
        debug!(target: "gantry::registry", service_name = %full_name, "service unregistered");
        // The mirror will also observe the delete; dropping local state now
        // keeps lookups on this peer consistent without waiting for it.
        self.drop_service(full_name);
        Ok(())
    }

    /// Where does `name` run? Exact lookup yields at most one peer;
    /// prefix/catalog mode walks the index. Ordering across matches is
    /// unspecified.
    #[must_use]
    pub fn where_is(&self, name: &str, options: WhereOptions) -> Vec<gantry_core::Peer> {
        let mut found = Vec::new();
        if options.prefix || options.catalog {
            let services = read_lock(&self.services);
            for matched in self.index.search(name) {
                let Some(service) = services.get(&matched) else {
                    continue;
                };
                if let Some(peer) = self.peers.get_peer(&service.peer_full_name) {
                    found.push(peer);
                    if options.max_count > 0 && found.len() >= options.max_count {
                        break;
                    }
                }
            }
        } else if let Some(service) = read_lock(&self.services).get(name) {
            if let Some(peer) = self.peers.get_peer(&service.peer_full_name) {
                found.push(peer);
            }
        }
        found
    }

    #[must_use]
    pub fn self_services(&self) -> Vec<ServiceName> {
        read_lock(&self.self_services).values().cloned().collect()
    }

    /// Reclaim names this peer left behind on an unclean exit: every entry
    /// still under `/peer/service/<self>/` gets the conditional delete pair.
    pub(crate) async fn recover(&self, store: &dyn KvStore) -> Result<()> {
        let (kvs, _) = store.get_prefix(&self.peer_service_prefix).await?;
        for kv in kvs {
            let Some(name) = kv.key.strip_prefix(self.peer_service_prefix.as_str()) else {
                continue;
            };
            let service_key = format!("{SERVICE_PREFIX}{name}");
            let peer_key = format!("{}{name}", self.peer_service_prefix);
            let result = store
                .txn(
                    Txn::new()
                        .when(vec![Cmp::create_revision(&service_key, CmpOp::NotEqual, 0)])
                        .and_then(vec![TxnOp::delete(&peer_key), TxnOp::delete(&service_key)]),
                )
                .await?;
            if result.succeeded {
                info!(target: "gantry::registry", service_name = name, "reclaimed stale service");
            } else {
                warn!(target: "gantry::registry", service_name = name, "stale service already gone");
            }
        }
        Ok(())
    }

    /// Release every name this peer still holds, guarded on the recorded
    /// create revision so a newer owner is never evicted.
    pub(crate) async fn unregister_all(&self, store: &dyn KvStore) {
        let held = self.self_services();
        for service in held {
            let service_key = format!("{SERVICE_PREFIX}{}", service.full_name);
            let peer_key = format!("{}{}", self.peer_service_prefix, service.full_name);
            let txn = Txn::new()
                .when(vec![Cmp::create_revision(
                    &service_key,
                    CmpOp::Equal,
                    service.create_revision,
                )])
                .and_then(vec![TxnOp::delete(&service_key), TxnOp::delete(&peer_key)]);
            match store.txn(txn).await {
                Ok(result) if result.succeeded => {
                    debug!(target: "gantry::registry", service_name = %service.full_name, "service released");
                }
                Ok(_) => {
                    warn!(target: "gantry::registry", service_name = %service.full_name, "service owner changed, skipping release");
                }
                Err(err) => {
                    warn!(target: "gantry::registry", service_name = %service.full_name, error = %err, "service release failed");
                }
            }
            self.drop_service(&service.full_name);
        }
    }

    /// Mirror `/service/` until the token is cancelled.
    pub(crate) async fn run_watch(self: Arc<Self>, store: Arc<dyn KvStore>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let (kvs, revision) = match store.get_prefix(SERVICE_PREFIX).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "service snapshot failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            self.resync(&kvs);
            let mut stream = match store.watch_prefix(SERVICE_PREFIX, revision + 1).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "service watch failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(target: "gantry::registry", watch_start_revision = revision + 1, "service registry watching");
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
                            warn!(target: "gantry::registry", "service watch stream closed, resyncing");
                            break;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn apply_event(&self, event: &WatchEvent) {
        let Some(full_name) = event.kv.key.strip_prefix(SERVICE_PREFIX) else {
            warn!(target: "gantry::registry", key = %event.kv.key, "invalid service key");
            return;
        };
        match event.kind {
            EventKind::Put => self.apply_put(full_name, &event.kv),
            EventKind::Delete => self.drop_service(full_name),
        }
    }

    fn apply_put(&self, full_name: &str, kv: &KeyValue) {
        if read_lock(&self.services).contains_key(full_name) {
            return;
        }
        let Ok(segments) = split_segments(full_name) else {
            warn!(target: "gantry::registry", service_name = full_name, "invalid service name");
            return;
        };
        if segments.is_empty() {
            return;
        }
        let service = ServiceName {
            full_name: full_name.to_string(),
            type_name: (segments.len() > 1).then(|| segments[0].to_string()),
            peer_full_name: kv.value.clone(),
            is_self: kv.value == self.self_full_name,
            create_revision: kv.create_revision,
        };
        self.adopt(service);
    }

    pub(crate) fn resync(&self, kvs: &[KeyValue]) {
        let desired: HashMap<&str, &KeyValue> = kvs
            .iter()
            .filter_map(|kv| kv.key.strip_prefix(SERVICE_PREFIX).map(|name| (name, kv)))
            .collect();
        let stale: Vec<String> = read_lock(&self.services)
            .keys()
            .filter(|name| !desired.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            self.drop_service(&name);
        }
        for (name, kv) in desired {
            self.apply_put(name, kv);
        }
    }

    fn adopt(&self, service: ServiceName) {
        {
            let mut services = write_lock(&self.services);
            if services.contains_key(&service.full_name) {
                return;
            }
            services.insert(service.full_name.clone(), service.clone());
        }
        if let Err(err) = self.index.add(&service.full_name) {
            warn!(target: "gantry::registry", service_name = %service.full_name, error = %err, "index add failed");
        }
        if service.is_self {
            write_lock(&self.self_services).insert(service.full_name.clone(), service.clone());
        }
        debug!(
            target: "gantry::registry",
            service_name = %service.full_name,
            peer = %service.peer_full_name,
            "service add"
        );
        let handlers = read_lock(&self.handlers).clone();
        notify(&handlers, "service", |h| h.on_service_add(&service));
    }

    fn drop_service(&self, full_name: &str) {
        let removed = write_lock(&self.services).remove(full_name);
        let Some(service) = removed else {
            debug!(target: "gantry::registry", service_name = full_name, "delete for unknown service");
            return;
        };
        if let Err(err) = self.index.delete(full_name) {
            warn!(target: "gantry::registry", service_name = full_name, error = %err, "index delete failed");
        }
        if service.is_self {
            write_lock(&self.self_services).remove(full_name);
        }
        debug!(
            target: "gantry::registry",
            service_name = %service.full_name,
            peer = %service.peer_full_name,
            "service delete"
        );
        let handlers = read_lock(&self.handlers).clone();
        notify(&handlers, "service", |h| h.on_service_delete(&service));
    }
}
