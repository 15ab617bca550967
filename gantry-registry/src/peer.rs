//! Peer discovery over the `/peer/attribute/` prefix.
//!
//! Every peer publishes one key per attribute, all bound to its session
//! lease; discovery groups key events by peer full name. The first attribute
//! seen for a name is a peer-add, later mutations are updates, and the last
//! attribute going away (lease expiry or explicit delete) is a peer-delete.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use gantry_core::{parse_full_name, Peer, Result};
use gantry_store::{EventKind, KeyValue, KvStore, LeaseId, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{notify, PeerHandler};
use crate::RETRY_INTERVAL;

pub(crate) const PEER_ATTRIBUTE_PREFIX: &str = "/peer/attribute/";

/// Attribute key carrying the peer's network address.
pub(crate) const ADDRESS_ATTRIBUTE: &str = "grpc";

struct PeerEntry {
    peer: Peer,
    attrs: HashSet<String>,
}

enum PeerEvent {
    Add(Peer),
    Update(Peer),
    Delete(Peer),
}

pub struct PeerRegistry {
    self_peer: Peer,
    peers: RwLock<HashMap<String, PeerEntry>>,
    handlers: RwLock<Vec<Arc<dyn PeerHandler>>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(self_peer: Peer) -> Self {
        Self {
            self_peer,
            peers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn self_peer(&self) -> &Peer {
        &self.self_peer
    }

    /// Look up a discovered peer by full name. The local peer resolves even
    /// before its own publication has round-tripped through the watch.
    #[must_use]
    pub fn get_peer(&self, full_name: &str) -> Option<Peer> {
        if let Some(entry) = read_lock(&self.peers).get(full_name) {
            return Some(entry.peer.clone());
        }
        (full_name == self.self_peer.full_name).then(|| self.self_peer.clone())
    }

    #[must_use]
    pub fn list_peers(&self) -> Vec<Peer> {
        read_lock(&self.peers)
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Register a handler. A late subscriber receives a synthetic add for
    /// every peer already known.
    pub fn add_handler(&self, handler: Arc<dyn PeerHandler>) {
        let known = self.list_peers();
        for peer in &known {
            handler.on_peer_add(peer);
        }
        write_lock(&self.handlers).push(handler);
    }

    /// Publish this peer's address and metadata under its lease.
    pub(crate) async fn publish_self(&self, store: &dyn KvStore, lease: LeaseId) -> Result<()> {
        let prefix = format!("{PEER_ATTRIBUTE_PREFIX}{}/", self.self_peer.full_name);
        store
            .put(
                &format!("{prefix}{ADDRESS_ATTRIBUTE}"),
                &self.self_peer.address,
                Some(lease),
            )
            .await?;
        for (attr, value) in &self.self_peer.metadata {
            store.put(&format!("{prefix}{attr}"), value, Some(lease)).await?;
        }
        info!(
            target: "gantry::registry",
            full_name = %self.self_peer.full_name,
            address = %self.self_peer.address,
            "published self attributes"
        );
        Ok(())
    }

    /// Mirror the `/peer/attribute/` prefix until the token is cancelled.
    pub(crate) async fn run_watch(self: Arc<Self>, store: Arc<dyn KvStore>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let (kvs, revision) = match store.get_prefix(PEER_ATTRIBUTE_PREFIX).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "peer snapshot failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            self.resync(&kvs);
            let mut stream = match store.watch_prefix(PEER_ATTRIBUTE_PREFIX, revision + 1).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: "gantry::registry", error = %err, "peer watch failed");
                    if sleep_or_cancelled(&token).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(target: "gantry::registry", watch_start_revision = revision + 1, "peer registry watching");
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
                            warn!(target: "gantry::registry", "peer watch stream closed, resyncing");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn apply_event(&self, event: &WatchEvent) {
        let Some((full_name, attr)) = split_attribute_key(&event.kv.key) else {
            warn!(target: "gantry::registry", key = %event.kv.key, "invalid peer attribute key");
            return;
        };
        let fired = match event.kind {
            EventKind::Put => self.apply_put(&full_name, &attr, &event.kv.value),
            EventKind::Delete => self.apply_delete(&full_name, &attr),
        };
        if let Some(fired) = fired {
            self.fire(fired);
        }
    }

    fn apply_put(&self, full_name: &str, attr: &str, value: &str) -> Option<PeerEvent> {
        let mut peers = write_lock(&self.peers);
        if let Some(entry) = peers.get_mut(full_name) {
            set_attribute(&mut entry.peer, attr, value);
            entry.attrs.insert(attr.to_string());
            return Some(PeerEvent::Update(entry.peer.clone()));
        }
        let mut peer = match new_peer(full_name) {
            Ok(peer) => peer,
            Err(_) => {
                warn!(target: "gantry::registry", full_name, "unparseable peer name");
                return None;
            }
        };
        set_attribute(&mut peer, attr, value);
        let mut attrs = HashSet::new();
        attrs.insert(attr.to_string());
        peers.insert(
            full_name.to_string(),
            PeerEntry {
                peer: peer.clone(),
                attrs,
            },
        );
        Some(PeerEvent::Add(peer))
    }

    fn apply_delete(&self, full_name: &str, attr: &str) -> Option<PeerEvent> {
        let mut peers = write_lock(&self.peers);
        let emptied = {
            let entry = peers.get_mut(full_name)?;
            entry.attrs.remove(attr);
            clear_attribute(&mut entry.peer, attr);
            entry.attrs.is_empty()
        };
        if emptied {
            let peer = peers.remove(full_name)?.peer;
            info!(target: "gantry::registry", full_name, "peer gone");
            return Some(PeerEvent::Delete(peer));
        }
        Some(PeerEvent::Update(peers.get(full_name)?.peer.clone()))
    }

    /// Reconcile the mirror with a fresh snapshot. Peers never seen before
    /// produce adds, changed ones updates, vanished ones deletes — a peer
    /// that survived a watch outage gets no duplicate add.
    pub(crate) fn resync(&self, kvs: &[KeyValue]) {
        let mut desired: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for kv in kvs {
            if let Some((full_name, attr)) = split_attribute_key(&kv.key) {
                desired
                    .entry(full_name)
                    .or_default()
                    .push((attr, kv.value.clone()));
            }
        }
        let mut fired = Vec::new();
        {
            let mut peers = write_lock(&self.peers);
            let stale: Vec<String> = peers
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect();
            for name in stale {
                if let Some(entry) = peers.remove(&name) {
                    fired.push(PeerEvent::Delete(entry.peer));
                }
            }
            for (full_name, attrs) in desired {
                match peers.get_mut(&full_name) {
                    Some(entry) => {
                        let before = entry.peer.clone();
                        entry.attrs = attrs.iter().map(|(a, _)| a.clone()).collect();
                        entry.peer.address.clear();
                        entry.peer.metadata.clear();
                        for (attr, value) in &attrs {
                            set_attribute(&mut entry.peer, attr, value);
                        }
                        if entry.peer != before {
                            fired.push(PeerEvent::Update(entry.peer.clone()));
                        }
                    }
                    None => {
                        let Ok(mut peer) = new_peer(&full_name) else {
                            warn!(target: "gantry::registry", full_name, "unparseable peer name");
                            continue;
                        };
                        for (attr, value) in &attrs {
                            set_attribute(&mut peer, attr, value);
                        }
                        peers.insert(
                            full_name.clone(),
                            PeerEntry {
                                peer: peer.clone(),
                                attrs: attrs.iter().map(|(a, _)| a.clone()).collect(),
                            },
                        );
                        fired.push(PeerEvent::Add(peer));
                    }
                }
            }
        }
        for event in fired {
            self.fire(event);
        }
    }

    fn fire(&self, event: PeerEvent) {
        let handlers = read_lock(&self.handlers).clone();
        match event {
            PeerEvent::Add(peer) => {
                debug!(target: "gantry::registry", full_name = %peer.full_name, address = %peer.address, "peer add");
                notify(&handlers, "peer", |h| h.on_peer_add(&peer));
            }
            PeerEvent::Update(peer) => {
                notify(&handlers, "peer", |h| h.on_peer_update(&peer));
            }
            PeerEvent::Delete(peer) => {
                notify(&handlers, "peer", |h| h.on_peer_delete(&peer));
            }
        }
    }
}

fn new_peer(full_name: &str) -> Result<Peer> {
    let (type_name, id) = parse_full_name(full_name)?;
    Ok(Peer {
        id,
        type_name,
        full_name: full_name.to_string(),
        address: String::new(),
        metadata: HashMap::new(),
    })
}

fn set_attribute(peer: &mut Peer, attr: &str, value: &str) {
    if attr == ADDRESS_ATTRIBUTE {
        peer.address = value.to_string();
    } else {
        peer.metadata.insert(attr.to_string(), value.to_string());
    }
}

fn clear_attribute(peer: &mut Peer, attr: &str) {
    if attr == ADDRESS_ATTRIBUTE {
        peer.address.clear();
    } else {
        peer.metadata.remove(attr);
    }
}

/// `/peer/attribute/<type>/<id>/<attr>` → (`<type>/<id>`, `<attr>`).
fn split_attribute_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(PEER_ATTRIBUTE_PREFIX)?;
    let (full_name, attr) = rest.rsplit_once('/')?;
    if full_name.is_empty() || attr.is_empty() {
        return None;
    }
    Some((full_name.to_string(), attr.to_string()))
}

pub(crate) async fn sleep_or_cancelled(token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = tokio::time::sleep(RETRY_INTERVAL) => false,
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        adds: Mutex<Vec<String>>,
        updates: AtomicUsize,
        deletes: Mutex<Vec<String>>,
    }

    impl PeerHandler for Recorder {
        fn on_peer_add(&self, peer: &Peer) {
            self.adds.lock().unwrap().push(peer.full_name.clone());
        }
        fn on_peer_update(&self, _peer: &Peer) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn on_peer_delete(&self, peer: &Peer) {
            self.deletes.lock().unwrap().push(peer.full_name.clone());
        }
    }

    fn put_event(key: &str, value: &str) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                create_revision: 1,
                mod_revision: 1,
                lease: 0,
            },
            prev_kv: None,
        }
    }

    fn delete_event(key: &str) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: 0,
                mod_revision: 2,
                lease: 0,
            },
            prev_kv: None,
        }
    }

    #[test]
    fn first_attribute_is_add_then_updates() {
        let registry = PeerRegistry::new(Peer::new("gateway", 1, "127.0.0.1:7000"));
        let recorder = Arc::new(Recorder::default());
        registry.add_handler(recorder.clone());

        registry.apply_event(&put_event("/peer/attribute/hall/3/grpc", "127.0.0.1:7100"));
        registry.apply_event(&put_event("/peer/attribute/hall/3/zone", "eu"));

        assert_eq!(*recorder.adds.lock().unwrap(), vec!["hall/3"]);
        assert_eq!(recorder.updates.load(Ordering::SeqCst), 1);

        let peer = registry.get_peer("hall/3").unwrap();
        assert_eq!(peer.address, "127.0.0.1:7100");
        assert_eq!(peer.metadata.get("zone").map(String::as_str), Some("eu"));
    }

    #[test]
    fn last_attribute_delete_removes_the_peer() {
        let registry = PeerRegistry::new(Peer::new("gateway", 1, "127.0.0.1:7000"));
        let recorder = Arc::new(Recorder::default());
        registry.add_handler(recorder.clone());

        registry.apply_event(&put_event("/peer/attribute/hall/3/grpc", "127.0.0.1:7100"));
        registry.apply_event(&put_event("/peer/attribute/hall/3/zone", "eu"));
        registry.apply_event(&delete_event("/peer/attribute/hall/3/zone"));
        assert!(registry.get_peer("hall/3").is_some());

        registry.apply_event(&delete_event("/peer/attribute/hall/3/grpc"));
        assert!(registry.get_peer("hall/3").is_none());
        assert_eq!(*recorder.deletes.lock().unwrap(), vec!["hall/3"]);
    }

    #[test]
    fn late_subscriber_gets_synthetic_adds() {
        let registry = PeerRegistry::new(Peer::new("gateway", 1, "127.0.0.1:7000"));
        registry.apply_event(&put_event("/peer/attribute/hall/3/grpc", "a"));
        registry.apply_event(&put_event("/peer/attribute/hall/4/grpc", "b"));

        let recorder = Arc::new(Recorder::default());
        registry.add_handler(recorder.clone());
        let mut adds = recorder.adds.lock().unwrap().clone();
        adds.sort();
        assert_eq!(adds, vec!["hall/3", "hall/4"]);
    }

    #[test]
    fn resync_never_duplicates_adds() {
        let registry = PeerRegistry::new(Peer::new("gateway", 1, "127.0.0.1:7000"));
        let recorder = Arc::new(Recorder::default());
        registry.add_handler(recorder.clone());

        let snapshot = vec![KeyValue {
            key: "/peer/attribute/hall/3/grpc".into(),
            value: "127.0.0.1:7100".into(),
            create_revision: 1,
            mod_revision: 1,
            lease: 0,
        }];
        registry.resync(&snapshot);
        registry.resync(&snapshot);
        assert_eq!(*recorder.adds.lock().unwrap(), vec!["hall/3"]);

        registry.resync(&[]);
        assert_eq!(*recorder.deletes.lock().unwrap(), vec!["hall/3"]);
    }

    #[test]
    fn panicking_handler_does_not_block_delivery() {
        struct Bomb;
        impl PeerHandler for Bomb {
            fn on_peer_add(&self, _peer: &Peer) {
                panic!("boom");
            }
        }

        let registry = PeerRegistry::new(Peer::new("gateway", 1, "127.0.0.1:7000"));
        registry.add_handler(Arc::new(Bomb));
        let recorder = Arc::new(Recorder::default());
        registry.add_handler(recorder.clone());

        registry.apply_event(&put_event("/peer/attribute/hall/3/grpc", "a"));
        assert_eq!(*recorder.adds.lock().unwrap(), vec!["hall/3"]);
    }
}
