//! Coordination store contract
//!
//! The lock protocol only needs point reads, point deletes and an atomic
//! compare-then-branch transaction. Semantics follow etcd v3: an absent key has
//! create/mod revision 0, and a value comparison against an absent key is false.

use async_trait::async_trait;

use crate::error::StoreError;

/// A key-value pair as seen by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: i64,
    /// Revision of the last write to the key
    pub mod_revision: i64,
    /// Number of writes since creation
    pub version: i64,
}

impl KeyValue {
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// What a [`Compare`] checks on the current state of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Vec<u8>),
    CreateRevision(i64),
    ModRevision(i64),
    Version(i64),
}

/// Equality predicate on the current state of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
}

impl Compare {
    pub fn value(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn create_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Version(version),
        }
    }

    /// Key does not exist
    pub fn absent(key: impl Into<String>) -> Self {
        Self::create_revision(key, 0)
    }

    /// Evaluate against the current entry, `None` meaning the key is absent
    pub fn matches(&self, current: Option<&KeyValue>) -> bool {
        match (&self.target, current) {
            (CompareTarget::Value(_), None) => false,
            (CompareTarget::Value(v), Some(kv)) => &kv.value == v,
            (CompareTarget::CreateRevision(r), kv) => kv.map_or(0, |kv| kv.create_revision) == *r,
            (CompareTarget::ModRevision(r), kv) => kv.map_or(0, |kv| kv.mod_revision) == *r,
            (CompareTarget::Version(v), kv) => kv.map_or(0, |kv| kv.version) == *v,
        }
    }
}

/// Operation executed inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Get { key: String },
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

/// Result of one [`TxnOp`], in the same position as the op in its branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Get(Option<KeyValue>),
    /// Revision at which the put committed
    Put { revision: i64 },
    Delete { deleted: u64 },
}

/// Atomic "if all compares hold then `success` else `failure`"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: impl IntoIterator<Item = Compare>) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// `true` when the compares held and the `success` branch ran.
    ///
    /// This is the only reliable win/loss indicator: `revision` is nonzero for
    /// every committed transaction regardless of the branch taken.
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
    pub responses: Vec<TxnOpResponse>,
}

impl TxnResponse {
    /// First `Get` result in the executed branch
    pub fn first_get(&self) -> Option<&KeyValue> {
        self.responses.iter().find_map(|r| match r {
            TxnOpResponse::Get(kv) => kv.as_ref(),
            _ => None,
        })
    }

    /// Revision of the first `Put` in the executed branch
    pub fn put_revision(&self) -> Option<i64> {
        self.responses.iter().find_map(|r| match r {
            TxnOpResponse::Put { revision } => Some(*revision),
            _ => None,
        })
    }
}

/// Linearizable key-value store used as the arbiter of lock ownership
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Point read
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Point delete, returns the number of keys removed
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;

    /// Atomic conditional transaction, exactly one branch executes
    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError>;
}
