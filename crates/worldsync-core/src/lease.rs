//! Single-owner leases for the simulation authority.
//!
//! Exactly one process may run the simulation at a time. The
//! [`LeaseManager`] takes a TTL'd lease for a named role in the store,
//! renews it on a fixed period (a third of the TTL by default) and releases
//! it on graceful shutdown so a standby can take over without waiting for
//! expiry.
//!
//! Authority is also bounded locally: if renewals stop succeeding the
//! manager stops reporting itself authoritative once the TTL measured from
//! the last confirmed renewal runs out, even if the store is unreachable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use worldsync_db::StateStore;
use worldsync_types::{OwnerId, SimulationLease};

use crate::error::LeaseError;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Default)]
struct Held {
    lease: Option<SimulationLease>,
    valid_until: Option<Instant>,
}

/// Acquires, renews and releases the lease for one role.
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    role: String,
    owner: OwnerId,
    ttl: Duration,
    renewal: Duration,
    held: Mutex<Held>,
}

impl LeaseManager {
    /// Create a manager for `role` on behalf of `owner`.
    pub fn new(
        store: Arc<dyn StateStore>,
        role: impl Into<String>,
        owner: OwnerId,
        ttl: Duration,
        renewal: Duration,
    ) -> Self {
        Self {
            store,
            role: role.into(),
            owner,
            ttl,
            renewal,
            held: Mutex::new(Held::default()),
        }
    }

    /// The role this manager competes for.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// This process's owner id.
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Lease time-to-live.
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Period between renewals.
    pub const fn renewal_interval(&self) -> Duration {
        self.renewal
    }

    /// The lease as this process last confirmed it.
    pub fn lease(&self) -> Option<SimulationLease> {
        self.held.lock().lease.clone()
    }

    /// Whether this process may perform authority-only writes right now.
    pub fn is_authoritative(&self) -> bool {
        let held = self.held.lock();
        held.lease.is_some() && held.valid_until.is_some_and(|until| Instant::now() < until)
    }

    /// Try to take the lease. Succeeds if the role is free, expired, or
    /// already ours.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if the store call fails; the manager is
    /// then not authoritative.
    pub async fn acquire(&self) -> Result<bool, LeaseError> {
        let sent_at = Instant::now();
        let result = self
            .store
            .acquire_lease(&self.role, &self.owner, self.ttl)
            .await;
        let acquired = match result {
            Ok(acquired) => acquired,
            Err(e) => {
                self.drop_authority();
                return Err(e.into());
            }
        };

        if acquired {
            let now = Utc::now();
            let mut held = self.held.lock();
            let newly = held.lease.is_none();
            let acquired_at = held.lease.as_ref().map_or(now, |l| l.acquired_at);
            held.lease = Some(SimulationLease {
                role: self.role.clone(),
                owner_id: self.owner.clone(),
                acquired_at,
                renewed_at: now,
                ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            });
            held.valid_until = sent_at.checked_add(self.ttl);
            if newly {
                info!(role = %self.role, owner = %self.owner, "Lease acquired");
            }
        } else {
            self.drop_authority();
            debug!(role = %self.role, owner = %self.owner, "Lease held elsewhere");
        }
        Ok(acquired)
    }

    /// Extend the lease. A refusal or a store error drops authority.
    ///
    /// Returns `false` without touching the store if no lease is held.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if the store call fails.
    pub async fn renew(&self) -> Result<bool, LeaseError> {
        if self.held.lock().lease.is_none() {
            return Ok(false);
        }
        let sent_at = Instant::now();
        match self
            .store
            .renew_lease(&self.role, &self.owner, self.ttl)
            .await
        {
            Ok(true) => {
                let mut held = self.held.lock();
                if let Some(lease) = held.lease.as_mut() {
                    lease.renewed_at = Utc::now();
                }
                held.valid_until = sent_at.checked_add(self.ttl);
                debug!(role = %self.role, "Lease renewed");
                Ok(true)
            }
            Ok(false) => {
                warn!(role = %self.role, owner = %self.owner, "Lease renewal refused, authority lost");
                self.drop_authority();
                Ok(false)
            }
            Err(e) => {
                warn!(role = %self.role, error = %e, "Lease renewal failed, authority lost");
                self.drop_authority();
                Err(e.into())
            }
        }
    }

    /// Give the lease up so a standby can take over immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if the store call fails. Local
    /// authority is dropped either way.
    pub async fn release(&self) -> Result<bool, LeaseError> {
        self.drop_authority();
        let released = self.store.release_lease(&self.role, &self.owner).await?;
        if released {
            info!(role = %self.role, owner = %self.owner, "Lease released");
        }
        Ok(released)
    }

    /// Retry [`acquire`](Self::acquire) every renewal period until it
    /// succeeds (`true`) or `shutdown` fires (`false`).
    pub async fn wait_for_lease(&self, shutdown: &ShutdownSignal) -> bool {
        let mut announced = false;
        loop {
            match self.acquire().await {
                Ok(true) => return true,
                Ok(false) => {
                    if !announced {
                        info!(role = %self.role, owner = %self.owner, "Standing by for lease");
                        announced = true;
                    }
                }
                Err(e) => warn!(role = %self.role, error = %e, "Lease acquisition failed"),
            }
            tokio::select! {
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.renewal) => {}
            }
        }
    }

    fn drop_authority(&self) {
        let mut held = self.held.lock();
        held.lease = None;
        held.valid_until = None;
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .field("renewal", &self.renewal)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::future::join_all;
    use worldsync_db::MemoryStore;

    use super::*;

    const TTL: Duration = Duration::from_secs(30);
    const RENEW: Duration = Duration::from_secs(10);

    fn manager(store: &Arc<MemoryStore>, owner: &str) -> LeaseManager {
        let store: Arc<dyn StateStore> = store.clone();
        LeaseManager::new(store, "world-sim", OwnerId::new(owner), TTL, RENEW)
    }

    #[tokio::test]
    async fn default_configs_do_not_share_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let managers: Vec<LeaseManager> = (0..2)
            .map(|_| {
                let config = crate::config::WorldsyncConfig::default();
                let store: Arc<dyn StateStore> = store.clone();
                LeaseManager::new(
                    store,
                    config.world.role,
                    OwnerId::new(config.world.owner_id),
                    TTL,
                    RENEW,
                )
            })
            .collect();

        assert!(managers.first().unwrap().acquire().await.unwrap());
        assert!(!managers.get(1).unwrap().acquire().await.unwrap());
    }

    #[tokio::test]
    async fn racing_acquirers_get_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let managers: Vec<Arc<LeaseManager>> = (0..8)
            .map(|i| Arc::new(manager(&store, &format!("process-{i}"))))
            .collect();

        let attempts = managers.iter().map(|m| {
            let m = Arc::clone(m);
            tokio::spawn(async move { m.acquire().await.unwrap() })
        });
        let winners = join_all(attempts)
            .await
            .into_iter()
            .map(Result::unwrap)
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(managers.iter().filter(|m| m.is_authoritative()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn standby_takes_over_one_ttl_after_the_last_renewal() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());

        tokio::time::advance(RENEW).await;
        assert!(a.renew().await.unwrap());
        tokio::time::advance(RENEW).await;
        assert!(a.renew().await.unwrap());
        assert!(!b.acquire().await.unwrap());

        // `a` stops renewing at t=20s; the lease lapses at t=50s.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(a.is_authoritative());
        assert!(!b.acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!a.is_authoritative());
        assert!(b.acquire().await.unwrap());
        assert!(b.is_authoritative());

        // The old holder's late renewal is refused.
        assert!(!a.renew().await.unwrap());
        assert!(a.lease().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquired_at_survives_renewals() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        assert!(a.acquire().await.unwrap());
        let first = a.lease().unwrap();
        tokio::time::advance(RENEW).await;
        assert!(a.acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        let later = a.lease().unwrap();
        assert_eq!(first.acquired_at, later.acquired_at);
        assert!(later.renewed_at >= first.renewed_at);
    }

    #[tokio::test]
    async fn release_hands_over_immediately() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        assert!(a.acquire().await.unwrap());
        assert!(a.release().await.unwrap());
        assert!(!a.is_authoritative());
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn store_outage_drops_authority() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        assert!(a.acquire().await.unwrap());
        store.set_unavailable(true);
        assert!(a.renew().await.is_err());
        assert!(!a.is_authoritative());
        store.set_unavailable(false);
        assert!(a.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn standby_wait_ends_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = Arc::new(manager(&store, "b"));
        assert!(a.acquire().await.unwrap());

        let shutdown = ShutdownSignal::new();
        let waiter = {
            let b = Arc::clone(&b);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { b.wait_for_lease(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.trigger();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn standby_wait_succeeds_after_expiry() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        assert!(a.acquire().await.unwrap());

        let shutdown = ShutdownSignal::new();
        let started = Instant::now();
        assert!(b.wait_for_lease(&shutdown).await);
        let waited = started.elapsed();
        assert!(waited >= TTL);
        assert!(waited <= Duration::from_secs(40));
    }
}
