//! Batata Lock - distributed mutual exclusion over a coordination store
//!
//! This crate provides:
//! - A compare-and-put lock protocol keyed off the executed transaction branch
//! - Fencing tokens minted from the store revision of the winning write
//! - Conditional release that never deletes another holder's lock
//! - Optional leases with background renewal and reclaim of expired records
//! - Bounded, jittered retry with cancellation
//! - An in-memory linearizable store for tests and single-process use

pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod model;
pub mod retry;
pub mod store;

pub use crate::config::LockConfig;
pub use error::{
    AcquireError, ContentionError, LeaseError, LockError, ReleaseError, StoreError,
    TryAcquireError,
};
pub use lease::LeaseKeeper;
pub use manager::{LockManager, LockOptions};
pub use memory::MemoryStore;
pub use model::{LockHandle, LockRecord, LockState, LockStats, LockToken};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use store::{
    Compare, CompareTarget, CoordinationStore, KeyValue, Txn, TxnOp, TxnOpResponse, TxnResponse,
};

// Re-exported so callers do not need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
