//! The [`StateStore`] contract shared by every backend.
//!
//! The store holds four independent namespaces:
//!
//! | Namespace | Operations | Semantics |
//! |-----------|------------|-----------|
//! | versioned blobs | `get_version`, `load`, `save`, `save_if_version` | payload plus a version bumped on every write |
//! | counters | `atomic_add`, `read_counter` | signed integer, created at 0 on first add |
//! | ledgers | `ledger_add`, `ledger_totals` | one signed total per member |
//! | markers | `put_if_absent`, `load_marker` | write-once payloads |
//!
//! plus the lease table (`acquire_lease`, `renew_lease`, `release_lease`,
//! `lease_holder`). A key used in one namespace says nothing about the same
//! key in another.
//!
//! Two operations span namespaces and are atomic as a whole:
//! `record_hit` (counter plus ledger) and `put_if_absent_with_credits`
//! (marker plus ledgers).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use worldsync_types::{LeaseHolder, OwnerId, VersionedBlob};

use crate::error::DbError;

/// Counter values around a [`StateStore::record_hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Value before the hit.
    pub before: i64,
    /// Value after the hit.
    pub after: i64,
}

impl CounterHit {
    /// Whether this hit took the counter from positive to zero or below.
    pub const fn crossed_zero(&self) -> bool {
        self.before > 0 && self.after <= 0
    }
}

/// One ledger increment applied by
/// [`StateStore::put_if_absent_with_credits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCredit {
    /// Ledger to credit.
    pub ledger_id: String,
    /// Member whose total moves.
    pub member: String,
    /// Amount added to the member's total.
    pub delta: i64,
}

impl LedgerCredit {
    /// Credit `delta` to `member` in `ledger_id`.
    pub fn new(ledger_id: impl Into<String>, member: impl Into<String>, delta: i64) -> Self {
        Self {
            ledger_id: ledger_id.into(),
            member: member.into(),
            delta,
        }
    }
}

/// Durable shared state used by the simulation authority, interactive
/// sessions and the arena.
///
/// Implementations must make every method atomic with respect to every
/// other caller, including callers in other processes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current version of the blob at `key`, or `0` if it was never written.
    async fn get_version(&self, key: &str) -> Result<i64, DbError>;

    /// Load the blob at `key`.
    async fn load(&self, key: &str) -> Result<Option<VersionedBlob>, DbError>;

    /// Unconditionally write `payload` at `key`. Returns the new version.
    async fn save(&self, key: &str, payload: &[u8]) -> Result<i64, DbError>;

    /// Write `payload` only if the stored version still equals
    /// `expected_version` (`0` meaning "never written").
    ///
    /// Returns `Some(new_version)` on success and `None` when another writer
    /// got there first.
    async fn save_if_version(
        &self,
        key: &str,
        expected_version: i64,
        payload: &[u8],
    ) -> Result<Option<i64>, DbError>;

    /// Atomically add `delta` to a counter and return the new value.
    async fn atomic_add(&self, counter_id: &str, delta: i64) -> Result<i64, DbError>;

    /// Read a counter without modifying it. `None` if it was never created.
    async fn read_counter(&self, counter_id: &str) -> Result<Option<i64>, DbError>;

    /// Atomically add `delta` to `member`'s total in a ledger. Returns the
    /// member's new total.
    async fn ledger_add(&self, ledger_id: &str, member: &str, delta: i64)
    -> Result<i64, DbError>;

    /// Every member's total in a ledger.
    async fn ledger_totals(&self, ledger_id: &str) -> Result<BTreeMap<String, i64>, DbError>;

    /// Write a marker if none exists yet. Returns `true` if this call wrote it.
    async fn put_if_absent(&self, key: &str, payload: &[u8]) -> Result<bool, DbError>;

    /// Subtract `amount` from a counter and, only if the counter was
    /// positive before, add `amount` to `member` in `ledger_id`. Both
    /// happen in one atomic step, so anyone who sees the counter at or
    /// below zero also sees every credit that got it there.
    async fn record_hit(
        &self,
        counter_id: &str,
        ledger_id: &str,
        member: &str,
        amount: i64,
    ) -> Result<CounterHit, DbError>;

    /// Write a marker if none exists yet and, in the same atomic step,
    /// apply `credits`. Returns `true` if this call wrote the marker; when
    /// it returns `false` no credit was applied.
    async fn put_if_absent_with_credits(
        &self,
        key: &str,
        payload: &[u8],
        credits: &[LedgerCredit],
    ) -> Result<bool, DbError>;

    /// Read a marker written by [`put_if_absent`](Self::put_if_absent).
    async fn load_marker(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;

    /// Take the lease for `role` if it is free, expired, or already held by
    /// `owner`. Returns whether `owner` holds it afterwards.
    async fn acquire_lease(
        &self,
        role: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, DbError>;

    /// Extend the lease for `role` if `owner` still holds it unexpired.
    async fn renew_lease(&self, role: &str, owner: &OwnerId, ttl: Duration)
    -> Result<bool, DbError>;

    /// Drop the lease for `role` if `owner` holds it.
    async fn release_lease(&self, role: &str, owner: &OwnerId) -> Result<bool, DbError>;

    /// The current unexpired holder of `role`, if any.
    async fn lease_holder(&self, role: &str) -> Result<Option<LeaseHolder>, DbError>;
}

/// Decode a JSON blob at `key`, returning the value with its version.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if the payload is not valid JSON for
/// `T`, or any error from the backend.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(T, i64)>, DbError> {
    match store.load(key).await? {
        Some(blob) => {
            let value = serde_json::from_slice(&blob.payload)?;
            Ok(Some((value, blob.version)))
        }
        None => Ok(None),
    }
}

/// Encode `value` as JSON and save it unconditionally.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if encoding fails, or any error from
/// the backend.
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<i64, DbError> {
    let payload = serde_json::to_vec(value)?;
    store.save(key, &payload).await
}

/// Decode a JSON marker at `key`.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if the marker is not valid JSON for
/// `T`, or any error from the backend.
pub async fn load_marker_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, DbError> {
    match store.load_marker(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
