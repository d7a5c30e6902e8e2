//! Error types for the lock protocol
//!
//! Contention is modelled as an error of `try_acquire` so callers can match on
//! it, but it is an expected outcome that drives backoff, not a fault.

use std::time::Duration;

use crate::model::{LockRecord, LockToken};

/// Failure talking to the coordination store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to coordination store at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store returned error: code={code}, message={message}")]
    Status { code: u16, message: String },

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Another owner currently holds the lock
#[derive(Debug, thiserror::Error)]
#[error("lock {key} is held by {}", holder_name(.holder))]
pub struct ContentionError {
    pub key: String,
    /// Record observed by the losing transaction, if the key still existed
    pub holder: Option<LockRecord>,
}

impl ContentionError {
    pub fn holder_owner(&self) -> Option<&str> {
        self.holder.as_ref().map(|r| r.owner.as_str())
    }
}

fn holder_name(holder: &Option<LockRecord>) -> &str {
    holder.as_ref().map(|r| r.owner.as_str()).unwrap_or("<unknown>")
}

/// Outcome of a single contention round
#[derive(Debug, thiserror::Error)]
pub enum TryAcquireError {
    #[error("invalid lock key: {0:?}")]
    InvalidKey(String),

    #[error(transparent)]
    Contention(#[from] ContentionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("invalid lock key: {0:?}")]
    InvalidKey(String),

    #[error("gave up acquiring {key} after {attempts} attempts (last holder: {})", .holder.as_deref().unwrap_or("<unknown>"))]
    Exhausted {
        key: String,
        attempts: u32,
        holder: Option<String>,
    },

    #[error("acquisition of {key} cancelled after {attempts} attempts")]
    Cancelled { key: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// The live record no longer belongs to the handle; the store was not mutated
    #[error("handle for {key} (token {token}) is stale; current holder: {}", .holder.as_deref().unwrap_or("<unknown>"))]
    NotOwner {
        key: String,
        token: LockToken,
        holder: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease on {key} (token {token}) lost; current holder: {}", .holder.as_deref().unwrap_or("<none>"))]
    Lost {
        key: String,
        token: LockToken,
        holder: Option<String>,
    },

    #[error("lease keeper task failed: {0}")]
    Keeper(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Umbrella error for composite operations such as `run_exclusive`
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}
