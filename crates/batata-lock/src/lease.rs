//! Background lease renewal

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LeaseError;
use crate::manager::LockManager;
use crate::model::LockHandle;

/// Renews a held lock at a fixed interval until stopped.
///
/// The keeper owns the handle while it runs, since every renewal moves the
/// handle's revision forward. [`LeaseKeeper::stop`] hands it back. Dropping
/// the keeper stops renewal too, leaving the lease to run out.
pub struct LeaseKeeper {
    key: String,
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<Result<LockHandle, LeaseError>>>,
}

impl LeaseKeeper {
    pub(crate) fn start(manager: LockManager, handle: LockHandle, every: Duration) -> Self {
        let key = handle.key().to_string();
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();

        let task = tokio::spawn(Self::run(
            manager,
            handle,
            every,
            stop.clone(),
            lost.clone(),
        ));

        Self {
            key,
            stop,
            lost,
            task: Some(task),
        }
    }

    async fn run(
        manager: LockManager,
        mut handle: LockHandle,
        every: Duration,
        stop: CancellationToken,
        lost: CancellationToken,
    ) -> Result<LockHandle, LeaseError> {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the lock was just written
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(key = %handle.key(), token = %handle.token(), "Lease keeper stopped");
                    return Ok(handle);
                }
                _ = ticker.tick() => match manager.renew(&mut handle).await {
                    Ok(()) => {}
                    // The record is untouched and still ours until the lease runs out
                    Err(LeaseError::Store(e)) if !handle.is_expired() => {
                        warn!(
                            key = %handle.key(),
                            token = %handle.token(),
                            remaining_ms = handle.remaining_ttl_ms().unwrap_or_default(),
                            error = %e,
                            "Lease renewal failed, retrying on next tick"
                        );
                    }
                    Err(e) => {
                        warn!(
                            key = %handle.key(),
                            token = %handle.token(),
                            error = %e,
                            "Lease renewal failed, lock lost"
                        );
                        lost.cancel();
                        return Err(e);
                    }
                },
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the lease was superseded or ran out while renewals failed
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the lease is lost; select on it to abandon the critical section
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Stop renewing and return the handle for release
    pub async fn stop(mut self) -> Result<LockHandle, LeaseError> {
        self.stop.cancel();
        let Some(task) = self.task.take() else {
            return Err(LeaseError::Keeper("keeper already stopped".to_string()));
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(LeaseError::Keeper(e.to_string())),
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
