//! Lock acquire/release protocol
//!
//! Every state change is a single conditional transaction against the
//! coordination store; the store's atomicity is the only thing that provides
//! mutual exclusion. No local mutex is involved, so one `LockManager` can be
//! shared by any number of tasks contending for any number of keys.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{
    AcquireError, ContentionError, LeaseError, LockError, ReleaseError, StoreError,
    TryAcquireError,
};
use crate::lease::LeaseKeeper;
use crate::model::{
    LockHandle, LockMarker, LockRecord, LockState, LockStats, LockStatsCollector,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{Compare, CoordinationStore, Txn, TxnOp, TxnResponse};

/// Default per-call deadline for store operations
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by every lock taken through one manager
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Identity written into the lock record
    pub owner_id: String,
    /// Lease length; `None` keeps the lock until it is released
    pub ttl: Option<Duration>,
    /// Deadline for each individual store call
    pub attempt_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
            ttl: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl LockOptions {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// `<hostname>-<uuid>`, unique per process
pub fn default_owner_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

/// Acquires and releases named locks against a coordination store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    options: LockOptions,
    stats: Arc<LockStatsCollector>,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, options: LockOptions) -> Self {
        Self {
            store,
            options,
            stats: Arc::new(LockStatsCollector::default()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.options.owner_id
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    /// One round of contention.
    ///
    /// Wins only if the store reports that the write branch executed. A lost
    /// round returns [`ContentionError`] with the holder read atomically in the
    /// same transaction. Store failures are returned as-is, never retried here.
    pub async fn try_acquire(&self, key: &str) -> Result<LockHandle, TryAcquireError> {
        if key.is_empty() {
            return Err(TryAcquireError::InvalidKey(key.to_string()));
        }

        self.contend(key, LockMarker::new(&self.options.owner_id, self.options.ttl))
            .await
    }

    async fn contend(&self, key: &str, marker: LockMarker) -> Result<LockHandle, TryAcquireError> {
        let claim = Txn::new()
            .when([Compare::absent(key)])
            .and_then([TxnOp::put(key, marker.to_bytes())])
            .or_else([TxnOp::get(key)]);
        let response = self.submit(claim).await?;

        if response.succeeded {
            let handle = self.won(key, &marker, &response);
            info!(key, owner = %handle.owner, token = %handle.token, "Lock acquired");
            return Ok(handle);
        }

        let holder = response.first_get().map(LockRecord::from_key_value);
        match holder {
            Some(record) if record.is_expired() => self.reclaim(key, marker, record).await,
            holder => Err(self.lost(key, holder).into()),
        }
    }

    /// Take over a record whose lease has run out.
    ///
    /// Conditional on the expired record still being the live one, so of all
    /// contenders that observed the same expired record at most one wins.
    async fn reclaim(
        &self,
        key: &str,
        marker: LockMarker,
        expired: LockRecord,
    ) -> Result<LockHandle, TryAcquireError> {
        debug!(
            key,
            previous_owner = %expired.owner,
            previous_token = %expired.token,
            "Found expired lock record, attempting reclaim"
        );

        let reclaim = Txn::new()
            .when([Compare::mod_revision(key, expired.revision)])
            .and_then([TxnOp::put(key, marker.to_bytes())])
            .or_else([TxnOp::get(key)]);
        let response = self.submit(reclaim).await?;

        if response.succeeded {
            let handle = self.won(key, &marker, &response);
            LockStatsCollector::incr(&self.stats.reclaimed);
            info!(
                key,
                owner = %handle.owner,
                token = %handle.token,
                previous_owner = %expired.owner,
                "Reclaimed expired lock"
            );
            return Ok(handle);
        }

        let holder = response.first_get().map(LockRecord::from_key_value);
        Err(self.lost(key, holder).into())
    }

    fn won(&self, key: &str, marker: &LockMarker, response: &TxnResponse) -> LockHandle {
        let revision = response.put_revision().unwrap_or(response.revision);
        LockStatsCollector::incr(&self.stats.acquisitions);
        LockHandle::from_marker(key, marker, revision)
    }

    fn lost(&self, key: &str, holder: Option<LockRecord>) -> ContentionError {
        LockStatsCollector::incr(&self.stats.contentions);
        debug!(
            key,
            holder = holder.as_ref().map(|h| h.owner.as_str()).unwrap_or("<unknown>"),
            "Lock held by another owner"
        );
        ContentionError {
            key: key.to_string(),
            holder,
        }
    }

    /// Contend until the lock is won, the policy gives up, or `cancel` fires.
    ///
    /// Cancellation interrupts both the wait between attempts and an in-flight
    /// store call. Memory use does not grow with the number of rounds.
    pub async fn acquire(
        &self,
        key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, AcquireError> {
        self.acquire_reporting(key, policy, cancel, None).await
    }

    /// [`acquire`](Self::acquire), publishing each state change to `state`.
    ///
    /// Observers see `Acquiring` at every attempt and `Losing` after a lost
    /// round. The final value is `Held` on success, `Exhausted` once the policy
    /// gives up, and `Idle` after cancellation or an unretried failure.
    pub async fn acquire_watched(
        &self,
        key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        state: &watch::Sender<LockState>,
    ) -> Result<LockHandle, AcquireError> {
        self.acquire_reporting(key, policy, cancel, Some(state)).await
    }

    async fn acquire_reporting(
        &self,
        key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        state: Option<&watch::Sender<LockState>>,
    ) -> Result<LockHandle, AcquireError> {
        let report = |next: LockState| {
            if let Some(state) = state {
                state.send_replace(next);
            }
        };

        let result = self.contend_until_decided(key, policy, cancel, &report).await;
        let gave_up_losing = state.is_some_and(|state| *state.borrow() == LockState::Losing);
        match &result {
            Ok(_) => report(LockState::Held),
            Err(AcquireError::Exhausted { .. }) => report(LockState::Exhausted),
            // Retried store errors until the policy stopped
            Err(AcquireError::Store(_)) if gave_up_losing => report(LockState::Exhausted),
            Err(_) => report(LockState::Idle),
        }
        result
    }

    async fn contend_until_decided(
        &self,
        key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        report: &impl Fn(LockState),
    ) -> Result<LockHandle, AcquireError> {
        if key.is_empty() {
            return Err(AcquireError::InvalidKey(key.to_string()));
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut last_holder: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Self::cancelled(key, attempts));
            }

            attempts += 1;
            report(LockState::Acquiring);
            let marker = LockMarker::new(&self.options.owner_id, self.options.ttl);
            let attempt_id = marker.nonce.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abandon(key, attempt_id);
                    return Err(Self::cancelled(key, attempts));
                }
                outcome = self.contend(key, marker) => outcome,
            };

            let store_error = match outcome {
                Ok(handle) => return Ok(handle),
                Err(TryAcquireError::InvalidKey(key)) => return Err(AcquireError::InvalidKey(key)),
                Err(TryAcquireError::Contention(contention)) => {
                    if let Some(owner) = contention.holder_owner() {
                        last_holder = Some(owner.to_string());
                    }
                    None
                }
                Err(TryAcquireError::Store(e)) if policy.retry_store_errors => {
                    warn!(key, attempt = attempts, error = %e, "Store error while acquiring lock");
                    Some(e)
                }
                Err(TryAcquireError::Store(e)) => return Err(AcquireError::Store(e)),
            };
            report(LockState::Losing);

            match policy.next_delay(attempts, started.elapsed()) {
                RetryDecision::Stop => {
                    if let Some(e) = store_error {
                        return Err(AcquireError::Store(e));
                    }
                    info!(key, attempts, "Retry policy exhausted, giving up on lock");
                    return Err(AcquireError::Exhausted {
                        key: key.to_string(),
                        attempts,
                        holder: last_holder,
                    });
                }
                RetryDecision::Retry(delay) => {
                    debug!(key, attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying lock");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Self::cancelled(key, attempts)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Undo a claim that may have committed after its caller stopped waiting.
    ///
    /// Runs detached so cancellation stays prompt. Only a record carrying the
    /// abandoned attempt's id is deleted, and only at the revision observed.
    fn abandon(&self, key: &str, attempt_id: String) {
        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let timeout = manager.options.attempt_timeout;
            let current = match tokio::time::timeout(timeout, manager.store.get(&key)).await {
                Ok(Ok(Some(kv))) => kv,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    warn!(key, error = %e, "Could not check for a lock won by a cancelled attempt");
                    return;
                }
                Err(_) => {
                    warn!(key, "Timed out checking for a lock won by a cancelled attempt");
                    return;
                }
            };

            let ours = serde_json::from_slice::<LockMarker>(&current.value)
                .is_ok_and(|marker| marker.nonce == attempt_id);
            if !ours {
                return;
            }

            let undo = Txn::new()
                .when([Compare::mod_revision(&key, current.mod_revision)])
                .and_then([TxnOp::delete(&key)]);
            match manager.submit(undo).await {
                Ok(response) if response.succeeded => {
                    info!(key, revision = current.mod_revision, "Released lock won by a cancelled attempt");
                }
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "Failed to release lock won by a cancelled attempt"),
            }
        });
    }

    fn cancelled(key: &str, attempts: u32) -> AcquireError {
        info!(key, attempts, "Lock acquisition cancelled");
        AcquireError::Cancelled {
            key: key.to_string(),
            attempts,
        }
    }

    /// Delete the lock record only if it is still the one written by `handle`.
    ///
    /// An absent key counts as released. A record written by anyone else yields
    /// [`ReleaseError::NotOwner`] and leaves the store untouched.
    pub async fn release(&self, handle: &LockHandle) -> Result<(), ReleaseError> {
        let release = Txn::new()
            .when([Compare::mod_revision(&handle.key, handle.revision)])
            .and_then([TxnOp::delete(&handle.key)])
            .or_else([TxnOp::get(&handle.key)]);
        let response = self.submit(release).await?;

        if response.succeeded {
            LockStatsCollector::incr(&self.stats.releases);
            info!(key = %handle.key, token = %handle.token, "Lock released");
            return Ok(());
        }

        match response.first_get().map(LockRecord::from_key_value) {
            None => {
                debug!(key = %handle.key, token = %handle.token, "Lock already released");
                Ok(())
            }
            Some(current) => {
                LockStatsCollector::incr(&self.stats.stale_releases);
                warn!(
                    key = %handle.key,
                    token = %handle.token,
                    current_owner = %current.owner,
                    current_token = %current.token,
                    "Refusing to release lock held by another owner"
                );
                Err(ReleaseError::NotOwner {
                    key: handle.key.clone(),
                    token: handle.token,
                    holder: Some(current.owner),
                })
            }
        }
    }

    /// Extend the lease of a held lock, keeping its fencing token.
    ///
    /// No-op when the manager has no TTL configured.
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<(), LeaseError> {
        let Some(ttl) = self.options.ttl else {
            return Ok(());
        };

        let marker = LockMarker::renewed(handle, ttl);
        let renew = Txn::new()
            .when([Compare::mod_revision(&handle.key, handle.revision)])
            .and_then([TxnOp::put(&handle.key, marker.to_bytes())])
            .or_else([TxnOp::get(&handle.key)]);
        let response = self.submit(renew).await?;

        if response.succeeded {
            handle.revision = response.put_revision().unwrap_or(response.revision);
            handle.expires_at = marker.expires_at;
            LockStatsCollector::incr(&self.stats.renewals);
            debug!(key = %handle.key, token = %handle.token, revision = handle.revision, "Lease renewed");
            return Ok(());
        }

        let holder = response
            .first_get()
            .map(LockRecord::from_key_value)
            .map(|record| record.owner);
        Err(LeaseError::Lost {
            key: handle.key.clone(),
            token: handle.token,
            holder,
        })
    }

    /// Check that `handle` still matches the live record
    pub async fn validate(&self, handle: &LockHandle) -> Result<LockRecord, LeaseError> {
        let current = self.inspect(&handle.key).await?;
        match current {
            Some(record)
                if record.token == handle.token
                    && record.revision == handle.revision
                    && !record.is_expired() =>
            {
                Ok(record)
            }
            other => Err(LeaseError::Lost {
                key: handle.key.clone(),
                token: handle.token,
                holder: other.map(|record| record.owner),
            }),
        }
    }

    /// Where `handle` stands in the lock lifecycle, judged by the live record
    pub async fn handle_state(&self, handle: &LockHandle) -> Result<LockState, StoreError> {
        let state = match self.inspect(&handle.key).await? {
            None => LockState::Released,
            Some(record) if record.token == handle.token && record.revision == handle.revision => {
                if record.is_expired() {
                    LockState::Expired
                } else {
                    LockState::Held
                }
            }
            // Superseded: the lease ran out and someone else took the key
            Some(_) => LockState::Expired,
        };
        Ok(state)
    }

    /// Current record at `key`, if any
    pub async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let timeout = self.options.attempt_timeout;
        let kv = tokio::time::timeout(timeout, self.store.get(key))
            .await
            .map_err(|_| StoreError::Timeout(timeout))
            .and_then(|r| r)
            .inspect_err(|_| LockStatsCollector::incr(&self.stats.store_errors))?;
        Ok(kv.as_ref().map(LockRecord::from_key_value))
    }

    /// Renew `handle` in the background until the keeper is stopped
    pub fn keep_alive(&self, handle: LockHandle, interval: Option<Duration>) -> LeaseKeeper {
        let interval = interval
            .or_else(|| self.options.ttl.map(|ttl| ttl / 3))
            .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT);
        LeaseKeeper::start(self.clone(), handle, interval)
    }

    /// Acquire `key`, run `f` while holding it, then release.
    ///
    /// With a TTL configured the lease is renewed for as long as `f` runs.
    /// If this future is dropped mid-section, renewal stops and the lock is
    /// left to expire at the end of its lease.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(key, policy, cancel).await?;

        if self.options.ttl.is_none() {
            let output = f().await;
            self.release(&handle).await?;
            return Ok(output);
        }

        let keeper = self.keep_alive(handle, None);
        let output = f().await;
        let handle = keeper.stop().await?;
        self.release(&handle).await?;
        Ok(output)
    }

    async fn submit(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let timeout = self.options.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.store.txn(txn)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        if let Err(e) = &result {
            LockStatsCollector::incr(&self.stats.store_errors);
            debug!(error = %e, "Store transaction failed");
        }
        result
    }
}
