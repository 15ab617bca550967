//! etcd v3 backend.
//!
//! A thin mapping of [`KvStore`](crate::KvStore) onto `etcd-client`. No retry
//! policy lives here; watch/dial loops in the consumers own that.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp as EtcdCmpOp, EventType, GetOptions, PutOptions,
    Txn as EtcdTxn, TxnOp as EtcdTxnOp, TxnOpResponse, WatchOptions,
};
use gantry_core::{GantryError, Result};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{
    Cmp, CmpOp, EventKind, KeyValue, LeaseId, Txn, TxnOp, TxnOpResult, TxnResult, WatchEvent,
    WatchStream,
};
use crate::KvStore;

const WATCH_CHANNEL_CAPACITY: usize = 256;

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to an etcd cluster.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(store_err)?;
        Ok(Self { client })
    }
}

fn store_err(err: etcd_client::Error) -> GantryError {
    GantryError::Store(err.to_string())
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

fn convert_cmp(cmp: &Cmp) -> Compare {
    match cmp {
        Cmp::CreateRevision { key, op, revision } => {
            Compare::create_revision(key.as_str(), convert_cmp_op(*op), *revision)
        }
        Cmp::Value { key, op, value } => {
            Compare::value(key.as_str(), convert_cmp_op(*op), value.as_str())
        }
    }
}

fn convert_cmp_op(op: CmpOp) -> EtcdCmpOp {
    match op {
        CmpOp::Equal => EtcdCmpOp::Equal,
        CmpOp::NotEqual => EtcdCmpOp::NotEqual,
    }
}

fn convert_op(op: &TxnOp) -> EtcdTxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            EtcdTxnOp::put(key.as_str(), value.as_str(), options)
        }
        TxnOp::Delete { key } => EtcdTxnOp::delete(key.as_str(), None),
        TxnOp::Get { key } => EtcdTxnOp::get(key.as_str(), None),
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await.map_err(store_err)?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;
        let revision = resp.header().map_or(0, |h| h.revision());
        Ok((resp.kvs().iter().map(convert_kv).collect(), revision))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64> {
        let mut kv = self.client.kv_client();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = kv.put(key, value, options).await.map_err(store_err)?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let mut kv = self.client.kv_client();
        let resp = kv.delete(key, None).await.map_err(store_err)?;
        Ok(resp.deleted())
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut kv = self.client.kv_client();
        let etcd_txn = EtcdTxn::new()
            .when(
                txn.compares
                    .iter()
                    .map(convert_cmp)
                    .collect::<Vec<Compare>>(),
            )
            .and_then(
                txn.success
                    .iter()
                    .map(convert_op)
                    .collect::<Vec<EtcdTxnOp>>(),
            )
            .or_else(
                txn.failure
                    .iter()
                    .map(convert_op)
                    .collect::<Vec<EtcdTxnOp>>(),
            );
        let resp = kv.txn(etcd_txn).await.map_err(store_err)?;
        let succeeded = resp.succeeded();
        let revision = resp.header().map_or(0, |h| h.revision());
        let results = resp
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Put(put) => TxnOpResult::Put {
                    revision: put.header().map_or(revision, |h| h.revision()),
                },
                TxnOpResponse::Delete(del) => TxnOpResult::Delete {
                    deleted: del.deleted(),
                },
                TxnOpResponse::Get(get) => TxnOpResult::Get {
                    kvs: get.kvs().iter().map(convert_kv).collect(),
                },
                TxnOpResponse::Txn(_) => TxnOpResult::Get { kvs: Vec::new() },
            })
            .collect();
        Ok(TxnResult {
            succeeded,
            revision,
            results,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut watch = self.client.watch_client();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision)
            .with_prev_key();
        let (watcher, mut stream) = watch
            .watch(prefix, Some(options))
            .await
            .map_err(store_err)?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!(target: "gantry::store", prefix = %prefix, "watch canceled by server");
                            break;
                        }
                        let events: Vec<WatchEvent> = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = convert_kv(event.kv()?);
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };
                                Some(WatchEvent {
                                    kind,
                                    kv,
                                    prev_kv: event.prev_kv().map(convert_kv),
                                })
                            })
                            .collect();
                        if events.is_empty() {
                            continue;
                        }
                        if tx.send(events).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: "gantry::store", prefix = %prefix, error = %err, "watch stream failed");
                        break;
                    }
                }
            }
        });
        Ok(WatchStream::new(rx))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut lease = self.client.lease_client();
        let resp = lease.grant(ttl_secs, None).await.map_err(store_err)?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.lease_client();
        let (mut keeper, mut stream) = client.keep_alive(lease).await.map_err(store_err)?;
        keeper.keep_alive().await.map_err(store_err)?;
        match stream.message().await.map_err(store_err)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(GantryError::Store(format!("lease {lease} expired"))),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.lease_client();
        client.revoke(lease).await.map_err(store_err)?;
        Ok(())
    }
}
