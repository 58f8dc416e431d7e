//! In-process [`StateStore`] backed by `parking_lot`-guarded maps.
//!
//! Used by tests and single-process deployments. Lease expiry is measured
//! with [`tokio::time::Instant`], so tests running on a paused clock can
//! advance time deterministically.
//!
//! The store can be switched into an "unavailable" mode where every call
//! fails with [`DbError::Unavailable`], which is how the loop's outage
//! handling is exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use worldsync_types::{LeaseHolder, OwnerId, VersionedBlob};

use crate::error::DbError;
use crate::store::{CounterHit, LedgerCredit, StateStore};

#[derive(Debug)]
struct Lease {
    owner: OwnerId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    blobs: HashMap<String, (Vec<u8>, i64)>,
    counters: HashMap<String, i64>,
    ledgers: HashMap<String, BTreeMap<String, i64>>,
    markers: HashMap<String, Vec<u8>>,
    leases: HashMap<String, Lease>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    blob_writes: AtomicU64,
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful blob writes since creation.
    pub fn blob_writes(&self) -> u64 {
        self.inner.blob_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DbError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory store switched off".to_owned()));
        }
        Ok(())
    }

    fn deadline(ttl: Duration) -> Result<Instant, DbError> {
        Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| DbError::Config(format!("lease ttl {ttl:?} overflows the clock")))
    }

    fn bump(&self, tables: &mut Tables, key: &str, payload: &[u8]) -> i64 {
        let entry = tables
            .blobs
            .entry(key.to_owned())
            .or_insert_with(|| (Vec::new(), 0));
        entry.0 = payload.to_vec();
        entry.1 = entry.1.saturating_add(1);
        self.inner.blob_writes.fetch_add(1, Ordering::SeqCst);
        entry.1
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_version(&self, key: &str) -> Result<i64, DbError> {
        self.check()?;
        let tables = self.inner.tables.lock();
        Ok(tables.blobs.get(key).map_or(0, |(_, version)| *version))
    }

    async fn load(&self, key: &str) -> Result<Option<VersionedBlob>, DbError> {
        self.check()?;
        let tables = self.inner.tables.lock();
        Ok(tables.blobs.get(key).map(|(payload, version)| VersionedBlob {
            key: key.to_owned(),
            payload: payload.clone(),
            version: *version,
        }))
    }

    async fn save(&self, key: &str, payload: &[u8]) -> Result<i64, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        Ok(self.bump(&mut tables, key, payload))
    }

    async fn save_if_version(
        &self,
        key: &str,
        expected_version: i64,
        payload: &[u8],
    ) -> Result<Option<i64>, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        let current = tables.blobs.get(key).map_or(0, |(_, version)| *version);
        if current != expected_version {
            return Ok(None);
        }
        Ok(Some(self.bump(&mut tables, key, payload)))
    }

    async fn atomic_add(&self, counter_id: &str, delta: i64) -> Result<i64, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        let value = tables.counters.entry(counter_id.to_owned()).or_insert(0);
        *value = value.saturating_add(delta);
        Ok(*value)
    }

    async fn read_counter(&self, counter_id: &str) -> Result<Option<i64>, DbError> {
        self.check()?;
        Ok(self.inner.tables.lock().counters.get(counter_id).copied())
    }

    async fn ledger_add(
        &self,
        ledger_id: &str,
        member: &str,
        delta: i64,
    ) -> Result<i64, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        Ok(credit(&mut tables, ledger_id, member, delta))
    }

    async fn ledger_totals(&self, ledger_id: &str) -> Result<BTreeMap<String, i64>, DbError> {
        self.check()?;
        let tables = self.inner.tables.lock();
        Ok(tables.ledgers.get(ledger_id).cloned().unwrap_or_default())
    }

    async fn put_if_absent(&self, key: &str, payload: &[u8]) -> Result<bool, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        if tables.markers.contains_key(key) {
            return Ok(false);
        }
        tables.markers.insert(key.to_owned(), payload.to_vec());
        Ok(true)
    }

    async fn record_hit(
        &self,
        counter_id: &str,
        ledger_id: &str,
        member: &str,
        amount: i64,
    ) -> Result<CounterHit, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        let value = tables.counters.entry(counter_id.to_owned()).or_insert(0);
        let before = *value;
        *value = value.saturating_sub(amount);
        let after = *value;
        if before > 0 {
            credit(&mut tables, ledger_id, member, amount);
        }
        Ok(CounterHit { before, after })
    }

    async fn put_if_absent_with_credits(
        &self,
        key: &str,
        payload: &[u8],
        credits: &[LedgerCredit],
    ) -> Result<bool, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        if tables.markers.contains_key(key) {
            return Ok(false);
        }
        tables.markers.insert(key.to_owned(), payload.to_vec());
        for c in credits {
            credit(&mut tables, &c.ledger_id, &c.member, c.delta);
        }
        Ok(true)
    }

    async fn load_marker(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.check()?;
        Ok(self.inner.tables.lock().markers.get(key).cloned())
    }

    async fn acquire_lease(
        &self,
        role: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, DbError> {
        self.check()?;
        let expires_at = Self::deadline(ttl)?;
        let now = Instant::now();
        let mut tables = self.inner.tables.lock();
        let free = tables
            .leases
            .get(role)
            .is_none_or(|lease| lease.owner == *owner || lease.expires_at <= now);
        if free {
            tables.leases.insert(
                role.to_owned(),
                Lease {
                    owner: owner.clone(),
                    expires_at,
                },
            );
        }
        Ok(free)
    }

    async fn renew_lease(
        &self,
        role: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, DbError> {
        self.check()?;
        let expires_at = Self::deadline(ttl)?;
        let now = Instant::now();
        let mut tables = self.inner.tables.lock();
        match tables.leases.get_mut(role) {
            Some(lease) if lease.owner == *owner && lease.expires_at > now => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, role: &str, owner: &OwnerId) -> Result<bool, DbError> {
        self.check()?;
        let mut tables = self.inner.tables.lock();
        let held = tables
            .leases
            .get(role)
            .is_some_and(|lease| lease.owner == *owner);
        if held {
            tables.leases.remove(role);
        }
        Ok(held)
    }

    async fn lease_holder(&self, role: &str) -> Result<Option<LeaseHolder>, DbError> {
        self.check()?;
        let now = Instant::now();
        let tables = self.inner.tables.lock();
        Ok(tables
            .leases
            .get(role)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| LeaseHolder {
                owner_id: lease.owner.clone(),
                expires_in: lease.expires_at.saturating_duration_since(now),
            }))
    }
}

fn credit(tables: &mut Tables, ledger_id: &str, member: &str, delta: i64) -> i64 {
    let total = tables
        .ledgers
        .entry(ledger_id.to_owned())
        .or_default()
        .entry(member.to_owned())
        .or_insert(0);
    *total = total.saturating_add(delta);
    *total
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_start_at_one_and_bump_on_every_write() {
        let store = MemoryStore::new();
        assert_eq!(store.get_version("world").await.unwrap(), 0);
        assert_eq!(store.save("world", b"a").await.unwrap(), 1);
        assert_eq!(store.save("world", b"a").await.unwrap(), 2);
        let blob = store.load("world").await.unwrap().unwrap();
        assert_eq!(blob.version, 2);
        assert_eq!(blob.payload, b"a");
    }

    #[tokio::test]
    async fn save_if_version_rejects_stale_writers() {
        let store = MemoryStore::new();
        assert_eq!(store.save_if_version("k", 0, b"x").await.unwrap(), Some(1));
        assert_eq!(store.save_if_version("k", 0, b"y").await.unwrap(), None);
        assert_eq!(store.save_if_version("k", 1, b"y").await.unwrap(), Some(2));
        assert_eq!(store.load("k").await.unwrap().unwrap().payload, b"y");
    }

    #[tokio::test]
    async fn ledger_accumulates_per_member() {
        let store = MemoryStore::new();
        store.ledger_add("l", "a", 10).await.unwrap();
        store.ledger_add("l", "b", 5).await.unwrap();
        assert_eq!(store.ledger_add("l", "a", 7).await.unwrap(), 17);
        let totals = store.ledger_totals("l").await.unwrap();
        assert_eq!(totals.get("a"), Some(&17));
        assert_eq!(totals.get("b"), Some(&5));
        assert!(store.ledger_totals("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn markers_are_write_once() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("m", b"first").await.unwrap());
        assert!(!store.put_if_absent("m", b"second").await.unwrap());
        assert_eq!(store.load_marker("m").await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn record_hit_credits_only_while_the_counter_was_positive() {
        let store = MemoryStore::new();
        store.atomic_add("hp", 50).await.unwrap();

        let hit = store.record_hit("hp", "dmg", "a", 30).await.unwrap();
        assert_eq!(hit, CounterHit { before: 50, after: 20 });
        assert!(!hit.crossed_zero());
        let hit = store.record_hit("hp", "dmg", "b", 30).await.unwrap();
        assert!(hit.crossed_zero());
        let hit = store.record_hit("hp", "dmg", "a", 5).await.unwrap();
        assert_eq!(hit, CounterHit { before: -10, after: -15 });

        let totals = store.ledger_totals("dmg").await.unwrap();
        assert_eq!(totals.get("a"), Some(&30));
        assert_eq!(totals.get("b"), Some(&30));
    }

    #[tokio::test]
    async fn credits_apply_only_with_the_first_marker() {
        let store = MemoryStore::new();
        let credits = [LedgerCredit::new("xp", "a", 10), LedgerCredit::new("gold", "a", 3)];

        assert!(store.put_if_absent_with_credits("done", b"1", &credits).await.unwrap());
        assert!(!store.put_if_absent_with_credits("done", b"2", &credits).await.unwrap());

        assert_eq!(store.load_marker("done").await.unwrap().unwrap(), b"1");
        assert_eq!(store.ledger_totals("xp").await.unwrap().get("a"), Some(&10));
        assert_eq!(store.ledger_totals("gold").await.unwrap().get("a"), Some(&3));
    }

    #[tokio::test]
    async fn failed_marker_write_applies_no_credits() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let credits = [LedgerCredit::new("xp", "a", 10)];
        assert!(
            store
                .put_if_absent_with_credits("done", b"1", &credits)
                .await
                .is_err()
        );
        store.set_unavailable(false);
        assert!(store.load_marker("done").await.unwrap().is_none());
        assert!(store.ledger_totals("xp").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_and_can_be_taken_over() {
        let store = MemoryStore::new();
        let a = OwnerId::new("a");
        let b = OwnerId::new("b");
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lease("sim", &a, ttl).await.unwrap());
        assert!(!store.acquire_lease("sim", &b, ttl).await.unwrap());
        assert!(!store.renew_lease("sim", &b, ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.lease_holder("sim").await.unwrap().is_none());
        assert!(!store.renew_lease("sim", &a, ttl).await.unwrap());
        assert!(store.acquire_lease("sim", &b, ttl).await.unwrap());
        assert_eq!(
            store.lease_holder("sim").await.unwrap().unwrap().owner_id,
            b
        );
        assert!(!store.release_lease("sim", &a).await.unwrap());
        assert!(store.release_lease("sim", &b).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.save("k", b"x").await,
            Err(DbError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.save("k", b"x").await.unwrap(), 1);
    }
}
