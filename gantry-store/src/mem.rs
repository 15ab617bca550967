//! In-process [`KvStore`] backend.
//!
//! Implements the full store contract — monotonic revisions, transactions,
//! prefix watches with bounded replay history, lease-bound keys — so the
//! registries can be exercised without an etcd cluster. Also usable for
//! single-process development deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gantry_core::{GantryError, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{
    Cmp, CmpOp, EventKind, KeyValue, LeaseId, Txn, TxnOp, TxnOpResult, TxnResult, WatchEvent,
    WatchStream,
};
use crate::KvStore;

const WATCH_CHANNEL_CAPACITY: usize = 256;
const HISTORY_CAPACITY: usize = 4096;

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Vec<WatchEvent>>,
}

struct Inner {
    revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
    history: VecDeque<(i64, Vec<WatchEvent>)>,
    /// Highest revision whose events have been dropped from `history`.
    compacted_revision: i64,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 0,
                watchers: Vec::new(),
                history: VecDeque::new(),
                compacted_revision: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sweep_expired(&mut inner);
        inner
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.lock();
        Ok(inner.kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)> {
        let inner = self.lock();
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok((kvs, inner.revision))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64> {
        let mut inner = self.lock();
        let revision = inner.revision + 1;
        let event = apply_put(&mut inner, key, value, lease, revision)?;
        commit(&mut inner, revision, vec![event]);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let mut inner = self.lock();
        let revision = inner.revision + 1;
        match apply_delete(&mut inner, key, revision) {
            Some(event) => {
                commit(&mut inner, revision, vec![event]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut inner = self.lock();
        let succeeded = txn.compares.iter().all(|cmp| evaluate(&inner, cmp));
        let ops = if succeeded { &txn.success } else { &txn.failure };

        let mutates = ops
            .iter()
            .any(|op| matches!(op, TxnOp::Put { .. } | TxnOp::Delete { .. }));
        let revision = if mutates {
            inner.revision + 1
        } else {
            inner.revision
        };

        let mut results = Vec::with_capacity(ops.len());
        let mut events = Vec::new();
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    let event = apply_put(&mut inner, key, value, *lease, revision)?;
                    events.push(event);
                    results.push(TxnOpResult::Put { revision });
                }
                TxnOp::Delete { key } => {
                    let deleted = match apply_delete(&mut inner, key, revision) {
                        Some(event) => {
                            events.push(event);
                            1
                        }
                        None => 0,
                    };
                    results.push(TxnOpResult::Delete { deleted });
                }
                TxnOp::Get { key } => {
                    let kvs = inner.kvs.get(key.as_str()).cloned().into_iter().collect();
                    results.push(TxnOpResult::Get { kvs });
                }
            }
        }
        if mutates {
            commit(&mut inner, revision, events);
        }
        Ok(TxnResult {
            succeeded,
            revision,
            results,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut inner = self.lock();
        if start_revision > 0 && start_revision <= inner.compacted_revision {
            return Err(GantryError::Store(format!(
                "revision {start_revision} compacted (oldest retained {})",
                inner.compacted_revision + 1
            )));
        }
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        for (revision, batch) in &inner.history {
            if *revision < start_revision {
                continue;
            }
            let filtered: Vec<WatchEvent> = batch
                .iter()
                .filter(|e| e.kv.key.starts_with(prefix))
                .cloned()
                .collect();
            if !filtered.is_empty() {
                // A fresh channel cannot be full here unless the replay alone
                // overflows it; that counts as a dead watcher, same as etcd.
                if tx.try_send(filtered).is_err() {
                    return Err(GantryError::Store("watch replay overflow".to_string()));
                }
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(GantryError::InvalidArgs);
        }
        let mut inner = self.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        let ttl = Duration::from_secs(ttl_secs as u64);
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock();
        let state = inner
            .leases
            .get_mut(&lease)
            .ok_or_else(|| GantryError::Store(format!("lease {lease} not found")))?;
        state.deadline = Instant::now() + state.ttl;
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock();
        if !inner.leases.contains_key(&lease) {
            return Err(GantryError::Store(format!("lease {lease} not found")));
        }
        revoke_lease(&mut inner, lease);
        Ok(())
    }
}

fn evaluate(inner: &Inner, cmp: &Cmp) -> bool {
    match cmp {
        Cmp::CreateRevision { key, op, revision } => {
            let actual = inner.kvs.get(key).map_or(0, |kv| kv.create_revision);
            match op {
                CmpOp::Equal => actual == *revision,
                CmpOp::NotEqual => actual != *revision,
            }
        }
        Cmp::Value { key, op, value } => match inner.kvs.get(key) {
            Some(kv) => match op {
                CmpOp::Equal => kv.value == *value,
                CmpOp::NotEqual => kv.value != *value,
            },
            None => false,
        },
    }
}

fn apply_put(
    inner: &mut Inner,
    key: &str,
    value: &str,
    lease: Option<LeaseId>,
    revision: i64,
) -> Result<WatchEvent> {
    let lease_id = lease.unwrap_or(0);
    if lease_id != 0 && !inner.leases.contains_key(&lease_id) {
        return Err(GantryError::Store(format!("lease {lease_id} not found")));
    }
    let prev = inner.kvs.get(key).cloned();
    if let Some(prev_kv) = &prev {
        if prev_kv.lease != 0 && prev_kv.lease != lease_id {
            if let Some(old) = inner.leases.get_mut(&prev_kv.lease) {
                old.keys.remove(key);
            }
        }
    }
    if lease_id != 0 {
        if let Some(state) = inner.leases.get_mut(&lease_id) {
            state.keys.insert(key.to_string());
        }
    }
    let kv = KeyValue {
        key: key.to_string(),
        value: value.to_string(),
        create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
        mod_revision: revision,
        lease: lease_id,
    };
    inner.kvs.insert(key.to_string(), kv.clone());
    Ok(WatchEvent {
        kind: EventKind::Put,
        kv,
        prev_kv: prev,
    })
}

fn apply_delete(inner: &mut Inner, key: &str, revision: i64) -> Option<WatchEvent> {
    let prev = inner.kvs.remove(key)?;
    if prev.lease != 0 {
        if let Some(state) = inner.leases.get_mut(&prev.lease) {
            state.keys.remove(key);
        }
    }
    Some(WatchEvent {
        kind: EventKind::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: String::new(),
            create_revision: 0,
            mod_revision: revision,
            lease: 0,
        },
        prev_kv: Some(prev),
    })
}

/// Stamp the new revision, record the batch and fan it out to watchers.
fn commit(inner: &mut Inner, revision: i64, events: Vec<WatchEvent>) {
    inner.revision = revision;
    if events.is_empty() {
        return;
    }
    inner.history.push_back((revision, events.clone()));
    while inner.history.len() > HISTORY_CAPACITY {
        if let Some((dropped, _)) = inner.history.pop_front() {
            inner.compacted_revision = dropped;
        }
    }
    inner.watchers.retain(|watcher| {
        let filtered: Vec<WatchEvent> = events
            .iter()
            .filter(|e| e.kv.key.starts_with(&watcher.prefix))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return true;
        }
        // A full or closed channel kills the watcher; the consumer notices
        // the stream end and resynchronizes from a fresh snapshot.
        watcher.tx.try_send(filtered).is_ok()
    });
}

/// Delete every key of the lease under one revision, then forget the lease.
fn revoke_lease(inner: &mut Inner, lease: LeaseId) {
    let keys: Vec<String> = inner
        .leases
        .remove(&lease)
        .map(|state| state.keys.into_iter().collect())
        .unwrap_or_default();
    if keys.is_empty() {
        return;
    }
    debug!(target: "gantry::store", lease, keys = keys.len(), "revoking lease");
    let revision = inner.revision + 1;
    let mut events = Vec::with_capacity(keys.len());
    for key in &keys {
        if let Some(event) = apply_delete(inner, key, revision) {
            events.push(event);
        }
    }
    commit(inner, revision, events);
}

fn sweep_expired(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<LeaseId> = inner
        .leases
        .iter()
        .filter(|(_, state)| state.deadline <= now)
        .map(|(id, _)| *id)
        .collect();
    for lease in expired {
        debug!(target: "gantry::store", lease, "lease expired");
        revoke_lease(inner, lease);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_preserves_create_revision_across_overwrites() {
        let store = MemStore::new();
        let first = store.put("/k", "a", None).await.unwrap();
        let second = store.put("/k", "b", None).await.unwrap();
        assert!(second > first);

        let kv = store.get("/k").await.unwrap().unwrap();
        assert_eq!(kv.create_revision, first);
        assert_eq!(kv.mod_revision, second);
        assert_eq!(kv.value, "b");
    }

    #[tokio::test]
    async fn txn_create_guard_admits_exactly_one_writer() {
        let store = MemStore::new();
        let claim = |owner: &str| {
            Txn::new()
                .when(vec![Cmp::create_revision("/lock", CmpOp::Equal, 0)])
                .and_then(vec![TxnOp::put("/lock", owner, None)])
                .or_else(vec![TxnOp::get("/lock")])
        };

        let win = store.txn(claim("a")).await.unwrap();
        assert!(win.succeeded);

        let lose = store.txn(claim("b")).await.unwrap();
        assert!(!lose.succeeded);
        assert_eq!(lose.first_get_value(), Some("a"));
    }

    #[tokio::test]
    async fn value_compare_fails_on_missing_key() {
        let store = MemStore::new();
        let txn = Txn::new()
            .when(vec![Cmp::value("/missing", CmpOp::Equal, "x")])
            .and_then(vec![TxnOp::put("/out", "never", None)]);
        let result = store.txn(txn).await.unwrap();
        assert!(!result.succeeded);
        assert!(store.get("/out").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_delivers_puts_and_deletes_in_order() {
        let store = MemStore::new();
        let (_, revision) = store.get_prefix("/w/").await.unwrap();
        let mut stream = store.watch_prefix("/w/", revision + 1).await.unwrap();

        store.put("/w/a", "1", None).await.unwrap();
        store.delete("/w/a").await.unwrap();
        store.put("/other", "x", None).await.unwrap();

        let batch = stream.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, EventKind::Put);
        assert_eq!(batch[0].kv.key, "/w/a");

        let batch = stream.recv().await.unwrap();
        assert_eq!(batch[0].kind, EventKind::Delete);
        assert_eq!(batch[0].prev_kv.as_ref().unwrap().value, "1");
    }

    #[tokio::test]
    async fn watch_replays_history_from_start_revision() {
        let store = MemStore::new();
        let first = store.put("/w/a", "1", None).await.unwrap();
        store.put("/w/b", "2", None).await.unwrap();

        let mut stream = store.watch_prefix("/w/", first + 1).await.unwrap();
        let batch = stream.recv().await.unwrap();
        assert_eq!(batch[0].kv.key, "/w/b");
    }

    #[tokio::test]
    async fn lease_revoke_drops_all_keys_in_one_revision() {
        let store = MemStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        store.put("/l/a", "1", Some(lease)).await.unwrap();
        store.put("/l/b", "2", Some(lease)).await.unwrap();
        store.put("/l/c", "3", None).await.unwrap();

        let (_, revision) = store.get_prefix("/l/").await.unwrap();
        let mut stream = store.watch_prefix("/l/", revision + 1).await.unwrap();

        store.lease_revoke(lease).await.unwrap();

        let batch = stream.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.kind == EventKind::Delete));
        let revs: Vec<i64> = batch.iter().map(|e| e.kv.mod_revision).collect();
        assert_eq!(revs[0], revs[1]);

        assert!(store.get("/l/a").await.unwrap().is_none());
        assert!(store.get("/l/c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keep_alive_requires_live_lease() {
        let store = MemStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        store.lease_keep_alive(lease).await.unwrap();
        store.lease_revoke(lease).await.unwrap();
        assert!(store.lease_keep_alive(lease).await.is_err());
    }
}
