//! In-process coordination store
//!
//! A single mutex serializes every operation, which makes the store trivially
//! linearizable. Revisions follow etcd: one global counter, bumped once per
//! mutating transaction, shared by every write inside that transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::{CoordinationStore, KeyValue, Txn, TxnOp, TxnOpResponse, TxnResponse};

#[derive(Debug)]
struct MemoryState {
    entries: HashMap<String, KeyValue>,
    revision: i64,
}

/// In-memory [`CoordinationStore`] for tests and single-process deployments
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    /// Number of upcoming calls that fail with a transport error
    pending_failures: Arc<AtomicU32>,
    /// Artificial latency applied before every call, in milliseconds
    latency_ms: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                entries: HashMap::new(),
                revision: 1,
            })),
            pending_failures: Arc::new(AtomicU32::new(0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with [`StoreError::Transport`]
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Write a raw value outside of any transaction
    pub fn put_raw(&self, key: &str, value: impl Into<Vec<u8>>) -> i64 {
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        Self::apply_put(&mut state.entries, key, value.into(), revision);
        revision
    }

    async fn before_call(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transport("injected failure".to_string()));
        }
        Ok(())
    }

    fn apply_put(entries: &mut HashMap<String, KeyValue>, key: &str, value: Vec<u8>, revision: i64) {
        match entries.get_mut(key) {
            Some(existing) => {
                existing.value = value;
                existing.mod_revision = revision;
                existing.version += 1;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    KeyValue {
                        key: key.to_string(),
                        value,
                        create_revision: revision,
                        mod_revision: revision,
                        version: 1,
                    },
                );
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.before_call().await?;
        Ok(self.state.lock().entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.before_call().await?;
        let mut state = self.state.lock();
        if state.entries.remove(key).is_some() {
            state.revision += 1;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        self.before_call().await?;
        let mut state = self.state.lock();

        // Phase 1: evaluate every compare against the same snapshot
        let succeeded = txn
            .compare
            .iter()
            .all(|c| c.matches(state.entries.get(&c.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        // Phase 2: apply the chosen branch at a single new revision
        let mutates = ops.iter().any(|op| match op {
            TxnOp::Put { .. } => true,
            TxnOp::Delete { key } => state.entries.contains_key(key),
            TxnOp::Get { .. } => false,
        });
        if mutates {
            state.revision += 1;
        }
        let revision = state.revision;

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Get { key } => TxnOpResponse::Get(state.entries.get(&key).cloned()),
                TxnOp::Put { key, value } => {
                    Self::apply_put(&mut state.entries, &key, value, revision);
                    TxnOpResponse::Put { revision }
                }
                TxnOp::Delete { key } => TxnOpResponse::Delete {
                    deleted: u64::from(state.entries.remove(&key).is_some()),
                },
            };
            responses.push(response);
        }

        Ok(TxnResponse {
            succeeded,
            revision,
            responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Compare;

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();

        let claim = || {
            Txn::new()
                .when([Compare::absent("/my-lock")])
                .and_then([TxnOp::put("/my-lock", "a")])
                .or_else([TxnOp::get("/my-lock")])
        };

        let first = store.txn(claim()).await.unwrap();
        assert!(first.succeeded);
        let won_at = first.put_revision().unwrap();
        assert_eq!(won_at, first.revision);

        let second = store.txn(claim()).await.unwrap();
        assert!(!second.succeeded);
        // A losing transaction still reports a nonzero revision
        assert!(second.revision > 0);
        assert_eq!(second.revision, won_at);
        let holder = second.first_get().unwrap();
        assert_eq!(holder.value_str(), Some("a"));
        assert_eq!(holder.create_revision, won_at);
    }

    #[tokio::test]
    async fn test_revisions_increase() {
        let store = MemoryStore::new();
        let r1 = store.put_raw("/a", "1");
        let r2 = store.put_raw("/a", "2");
        assert!(r2 > r1);

        let kv = store.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.create_revision, r1);
        assert_eq!(kv.mod_revision, r2);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.put_raw("/a", "1");
        let before = store.revision();

        assert_eq!(store.delete("/a").await.unwrap(), 1);
        assert_eq!(store.revision(), before + 1);

        // Deleting a missing key does not bump the revision
        assert_eq!(store.delete("/a").await.unwrap(), 0);
        assert_eq!(store.revision(), before + 1);
        assert!(store.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = MemoryStore::new();
        let rev = store.put_raw("/a", "1");

        let stale = Txn::new()
            .when([Compare::mod_revision("/a", rev - 1)])
            .and_then([TxnOp::delete("/a")])
            .or_else([TxnOp::get("/a")]);
        let resp = store.txn(stale).await.unwrap();
        assert!(!resp.succeeded);
        assert!(store.get("/a").await.unwrap().is_some());

        let current = Txn::new()
            .when([Compare::mod_revision("/a", rev)])
            .and_then([TxnOp::delete("/a")]);
        let resp = store.txn(current).await.unwrap();
        assert!(resp.succeeded);
        assert_eq!(resp.responses, vec![TxnOpResponse::Delete { deleted: 1 }]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(matches!(
            store.get("/a").await,
            Err(StoreError::Transport(_))
        ));
        assert!(store.delete("/a").await.is_err());
        assert!(store.get("/a").await.is_ok());
    }
}
