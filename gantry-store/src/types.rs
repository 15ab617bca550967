use tokio::sync::mpsc;

pub type LeaseId = i64;

/// One stored key with its revision bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was first created. Reset only when the key
    /// is deleted and re-created.
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: LeaseId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    NotEqual,
}

/// A transaction guard.
#[derive(Debug, Clone)]
pub enum Cmp {
    /// Compares the key's create revision; a missing key compares as 0.
    CreateRevision { key: String, op: CmpOp, revision: i64 },
    /// Compares the key's value; always fails for a missing key.
    Value { key: String, op: CmpOp, value: String },
}

impl Cmp {
    #[must_use]
    pub fn create_revision(key: &str, op: CmpOp, revision: i64) -> Self {
        Self::CreateRevision {
            key: key.to_string(),
            op,
            revision,
        }
    }

    #[must_use]
    pub fn value(key: &str, op: CmpOp, value: &str) -> Self {
        Self::Value {
            key: key.to_string(),
            op,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    Get {
        key: String,
    },
}

impl TxnOp {
    #[must_use]
    pub fn put(key: &str, value: &str, lease: Option<LeaseId>) -> Self {
        Self::Put {
            key: key.to_string(),
            value: value.to_string(),
            lease,
        }
    }

    #[must_use]
    pub fn delete(key: &str) -> Self {
        Self::Delete {
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn get(key: &str) -> Self {
        Self::Get {
            key: key.to_string(),
        }
    }
}

/// `If compares Then success Else failure`, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Cmp>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, compares: Vec<Cmp>) -> Self {
        self.compares = compares;
        self
    }

    #[must_use]
    pub fn and_then(mut self, ops: Vec<TxnOp>) -> Self {
        self.success = ops;
        self
    }

    #[must_use]
    pub fn or_else(mut self, ops: Vec<TxnOp>) -> Self {
        self.failure = ops;
        self
    }
}

#[derive(Debug, Clone)]
pub enum TxnOpResult {
    Put { revision: i64 },
    Delete { deleted: i64 },
    Get { kvs: Vec<KeyValue> },
}

#[derive(Debug, Clone)]
pub struct TxnResult {
    pub succeeded: bool,
    /// Revision the transaction committed at.
    pub revision: i64,
    pub results: Vec<TxnOpResult>,
}

impl TxnResult {
    /// First value returned by a `Get` op, if any. Conflict handling reads
    /// the current owner out of the else-branch with this.
    #[must_use]
    pub fn first_get_value(&self) -> Option<&str> {
        self.results.iter().find_map(|r| match r {
            TxnOpResult::Get { kvs } => kvs.first().map(|kv| kv.value.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

/// Batches of events in revision order. `recv` returning `None` means the
/// watcher is gone and the consumer must resynchronize.
pub struct WatchStream {
    rx: mpsc::Receiver<Vec<WatchEvent>>,
}

impl WatchStream {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Vec<WatchEvent>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Vec<WatchEvent>> {
        self.rx.recv().await
    }
}
