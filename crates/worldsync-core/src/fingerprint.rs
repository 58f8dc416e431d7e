//! Dirty-state tracking by payload fingerprint.
//!
//! The population blob can be several megabytes. Re-persisting it every
//! flush when nothing changed wastes store bandwidth and bumps the version,
//! which in turn forces every other writer to reconcile. [`DirtyTracker`]
//! keeps the SHA-256 digest of the last payload the store confirmed per key
//! and answers "would this write change anything?".

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `payload`.
pub fn fingerprint(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Remembers the fingerprint of the last confirmed write per key.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    persisted: Mutex<HashMap<String, String>>,
}

impl DirtyTracker {
    /// Create a tracker with no recorded writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `payload` differs from the last confirmed write of `key`.
    ///
    /// Always `true` for a key with no recorded write.
    pub fn should_write(&self, key: &str, payload: &[u8]) -> bool {
        let current = fingerprint(payload);
        self.persisted
            .lock()
            .get(key)
            .is_none_or(|last| *last != current)
    }

    /// Record that the store confirmed a write of `payload` at `key`.
    ///
    /// Call only after the store acknowledged the write; recording first
    /// would suppress the retry of a failed write.
    pub fn record_write(&self, key: &str, payload: &[u8]) {
        self.persisted
            .lock()
            .insert(key.to_owned(), fingerprint(payload));
    }

    /// Forget the fingerprint of `key`, forcing the next check to report
    /// dirty.
    pub fn invalidate(&self, key: &str) {
        self.persisted.lock().remove(key);
    }

    /// The recorded fingerprint of `key`, if any.
    pub fn last_fingerprint(&self, key: &str) -> Option<String> {
        self.persisted.lock().get(key).cloned()
    }
}
