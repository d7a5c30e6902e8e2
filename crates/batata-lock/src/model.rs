//! Lock data model

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::KeyValue;

/// Fencing token: the store revision at which an acquisition committed.
///
/// Tokens for the same key strictly increase across acquisitions, so a resource
/// guarded by the lock can reject writes carrying a smaller token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub i64);

impl LockToken {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock state machine, per handle / acquisition attempt.
///
/// `LockManager::acquire_watched` reports the acquisition states and
/// `LockManager::handle_state` reports the states of a held handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    /// Lost a contention round, waiting on the retry policy
    Losing,
    Exhausted,
    Released,
    Expired,
}

impl Default for LockState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Value stored at the lock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockMarker {
    pub owner: String,
    /// Unknown until the first write commits; carried forward on renewal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<i64>,
    pub acquired_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Identifies the acquisition attempt that wrote this marker
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

impl LockMarker {
    pub fn new(owner: &str, ttl: Option<Duration>) -> Self {
        let now = current_timestamp();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64);
        Self {
            owner: owner.to_string(),
            token: None,
            acquired_at: now,
            expires_at: ttl_ms.map(|ms| now + ms as i64),
            ttl_ms,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Marker written on renewal: same owner, acquisition time and token
    pub fn renewed(handle: &LockHandle, ttl: Duration) -> Self {
        let ttl_ms = ttl.as_millis() as u64;
        Self {
            owner: handle.owner.clone(),
            token: Some(handle.token.0),
            acquired_at: handle.acquired_at,
            expires_at: Some(current_timestamp() + ttl_ms as i64),
            ttl_ms: Some(ttl_ms),
            nonce: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings and integers cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Observed state of a held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub owner: String,
    pub token: LockToken,
    /// Mod revision of the key; changes on every renewal
    pub revision: i64,
    pub acquired_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl LockRecord {
    /// Interpret a raw store entry.
    ///
    /// Values that are not lock markers (for example a bare string written by
    /// another client) are treated as an owner name with no expiry.
    pub fn from_key_value(kv: &KeyValue) -> Self {
        match serde_json::from_slice::<LockMarker>(&kv.value) {
            Ok(marker) => Self {
                key: kv.key.clone(),
                owner: marker.owner,
                token: LockToken(marker.token.unwrap_or(kv.mod_revision)),
                revision: kv.mod_revision,
                acquired_at: Some(marker.acquired_at),
                expires_at: marker.expires_at,
            },
            Err(_) => Self {
                key: kv.key.clone(),
                owner: String::from_utf8_lossy(&kv.value).into_owned(),
                token: LockToken(kv.mod_revision),
                revision: kv.mod_revision,
                acquired_at: None,
                expires_at: None,
            },
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now_ms >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }
}

/// Proof of a successful acquisition.
///
/// There is exactly one handle per acquisition; it must be passed to
/// `LockManager::release` once the critical section is done. A handle is only
/// trustworthy while its token matches the live record in the store.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a held lock must be released"]
pub struct LockHandle {
    pub(crate) key: String,
    pub(crate) owner: String,
    pub(crate) token: LockToken,
    pub(crate) revision: i64,
    pub(crate) acquired_at: i64,
    pub(crate) expires_at: Option<i64>,
}

impl LockHandle {
    pub(crate) fn from_marker(key: &str, marker: &LockMarker, revision: i64) -> Self {
        Self {
            key: key.to_string(),
            owner: marker.owner.clone(),
            token: LockToken(marker.token.unwrap_or(revision)),
            revision,
            acquired_at: marker.acquired_at,
            expires_at: marker.expires_at,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Mod revision of the key as last written by this handle
    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn acquired_at(&self) -> i64 {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    /// Remaining lease in milliseconds, `None` when the lock has no lease
    pub fn remaining_ttl_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|expires_at| (expires_at - current_timestamp()).max(0) as u64)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| current_timestamp() >= expires_at)
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful acquisitions (including reclaims)
    pub acquisitions: u64,
    /// Expired records taken over from a previous holder
    pub reclaimed: u64,
    /// Lost contention rounds
    pub contentions: u64,
    pub releases: u64,
    /// Releases rejected because the handle was stale
    pub stale_releases: u64,
    pub renewals: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LockStatsCollector {
    pub acquisitions: AtomicU64,
    pub reclaimed: AtomicU64,
    pub contentions: AtomicU64,
    pub releases: AtomicU64,
    pub stale_releases: AtomicU64,
    pub renewals: AtomicU64,
    pub store_errors: AtomicU64,
}

impl LockStatsCollector {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            stale_releases: self.stale_releases.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
