//! Who is around to fight.
//!
//! Spawning needs the current concurrent participant count, and encounter
//! level follows the average participant level when one is known.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use worldsync_db::StateStore;

use crate::error::ArenaError;

/// A point-in-time participant count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    /// Concurrent participants.
    pub participants: u32,
    /// Their average level, if known.
    pub average_level: Option<u32>,
}

/// Source of the current [`Presence`].
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Read the current presence.
    async fn presence(&self) -> Result<Presence, ArenaError>;
}

/// A presence value set directly. Used by tests and fixed deployments.
#[derive(Debug, Default)]
pub struct FixedPresence {
    participants: AtomicU32,
    average_level: AtomicU32,
}

impl FixedPresence {
    /// Report `participants` with no level information.
    pub fn new(participants: u32) -> Self {
        Self {
            participants: AtomicU32::new(participants),
            average_level: AtomicU32::new(0),
        }
    }

    /// Change the participant count.
    pub fn set_participants(&self, participants: u32) {
        self.participants.store(participants, Ordering::Relaxed);
    }

    /// Change the average level. `0` means unknown.
    pub fn set_average_level(&self, level: u32) {
        self.average_level.store(level, Ordering::Relaxed);
    }
}

#[async_trait]
impl PresenceSource for FixedPresence {
    async fn presence(&self) -> Result<Presence, ArenaError> {
        let level = self.average_level.load(Ordering::Relaxed);
        Ok(Presence {
            participants: self.participants.load(Ordering::Relaxed),
            average_level: (level > 0).then_some(level),
        })
    }
}

/// Presence kept in a store counter that sessions bump on connect and
/// disconnect.
#[derive(Clone)]
pub struct StorePresence {
    store: Arc<dyn StateStore>,
    counter: String,
}

impl StorePresence {
    /// Default counter id.
    pub const DEFAULT_COUNTER: &'static str = "presence:online";

    /// Track presence in `counter`.
    pub fn new(store: Arc<dyn StateStore>, counter: impl Into<String>) -> Self {
        Self {
            store,
            counter: counter.into(),
        }
    }

    /// A session connected.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Store`] if the counter cannot be updated.
    pub async fn join(&self) -> Result<i64, ArenaError> {
        Ok(self.store.atomic_add(&self.counter, 1).await?)
    }

    /// A session disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Store`] if the counter cannot be updated.
    pub async fn leave(&self) -> Result<i64, ArenaError> {
        Ok(self.store.atomic_add(&self.counter, -1).await?)
    }
}

#[async_trait]
impl PresenceSource for StorePresence {
    async fn presence(&self) -> Result<Presence, ArenaError> {
        let online = self.store.read_counter(&self.counter).await?.unwrap_or(0);
        Ok(Presence {
            participants: u32::try_from(online.max(0)).unwrap_or(u32::MAX),
            average_level: None,
        })
    }
}

impl std::fmt::Debug for StorePresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePresence")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use worldsync_db::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn store_presence_counts_sessions() {
        let presence = StorePresence::new(Arc::new(MemoryStore::new()), "online");
        assert_eq!(presence.presence().await.unwrap().participants, 0);
        presence.join().await.unwrap();
        presence.join().await.unwrap();
        presence.leave().await.unwrap();
        assert_eq!(presence.presence().await.unwrap().participants, 1);
    }

    #[tokio::test]
    async fn fixed_presence_reports_unknown_level_as_none() {
        let presence = FixedPresence::new(4);
        assert_eq!(presence.presence().await.unwrap().average_level, None);
        presence.set_average_level(22);
        assert_eq!(presence.presence().await.unwrap().average_level, Some(22));
    }
}
