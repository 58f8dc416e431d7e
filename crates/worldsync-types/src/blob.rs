//! Persistence-level records: versioned payloads and simulation leases.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OwnerId;

/// A payload stored under a key together with its write version.
///
/// The version starts at 1 on the first write and increases by exactly one
/// on every successful write, whoever the writer is. A reader that observes
/// a version higher than the one it last saw must assume the payload changed
/// underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBlob {
    /// Store key.
    pub key: String,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
    /// Write version of this payload.
    pub version: i64,
}

/// The current holder of a lease as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    /// The process holding the lease.
    pub owner_id: OwnerId,
    /// Time left before the lease expires on its own.
    pub expires_in: Duration,
}

/// The authority's own view of the lease it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationLease {
    /// Role the lease grants (e.g. `world-sim`).
    pub role: String,
    /// The process holding the lease.
    pub owner_id: OwnerId,
    /// When this process first acquired it.
    pub acquired_at: DateTime<Utc>,
    /// Last confirmed renewal.
    pub renewed_at: DateTime<Utc>,
    /// Lease time-to-live in milliseconds.
    pub ttl_ms: u64,
}

impl SimulationLease {
    /// Whether the lease is still valid at `now` by this process's clock.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        now.signed_duration_since(self.renewed_at).num_milliseconds() < ttl
    }
}
