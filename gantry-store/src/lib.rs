#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Coordination-store abstraction.
//!
//! Every registry talks to the store through [`KvStore`]: revisioned gets and
//! puts, multi-op transactions guarded by `create_revision`/value compares,
//! prefix watches and process-lifetime leases. [`EtcdStore`] is the
//! production backend; [`MemStore`] implements the same contract in-process
//! and backs the test suites.

mod etcd;
mod mem;
mod types;

pub use etcd::EtcdStore;
pub use mem::MemStore;
pub use types::{
    Cmp, CmpOp, EventKind, KeyValue, LeaseId, Txn, TxnOp, TxnOpResult, TxnResult, WatchEvent,
    WatchStream,
};

use async_trait::async_trait;
use gantry_core::Result;

/// The store primitives the registries rely on.
///
/// Every mutation is revisioned; a transaction commits all of its ops under a
/// single revision or none of them. Keys put with a lease disappear together
/// when the lease is revoked or expires.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Returns every key under `prefix` plus the store revision the snapshot
    /// was taken at.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)>;

    /// Returns the revision of the put.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64>;

    /// Returns the number of keys deleted.
    async fn delete(&self, key: &str) -> Result<i64>;

    async fn txn(&self, txn: Txn) -> Result<TxnResult>;

    /// Watch `prefix` for events from `start_revision` on. The stream closing
    /// means the watcher died; callers rebuild their snapshot and re-watch.
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Deletes every key attached to the lease in one revision.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;
}
