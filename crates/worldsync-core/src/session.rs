//! The interactive-session side of the population blob.
//!
//! Sessions are short-lived and never hold the lease. They read the stored
//! population and write it back through one of two paths:
//!
//! - [`InteractiveSession::save`] writes unconditionally. This is the
//!   historical path and may be based on a stale copy; the authority's
//!   reconciler is what keeps its guarded fields safe from it.
//! - [`InteractiveSession::update`] reads, applies a closure and writes
//!   with a version check, retrying on conflict, so no concurrent write is
//!   lost.

use std::sync::Arc;

use tracing::{debug, warn};
use worldsync_db::StateStore;
use worldsync_types::Agent;

use crate::error::SessionError;
use crate::simulation::POPULATION_KEY;

/// Default optimistic attempts for [`InteractiveSession::update`].
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A decoded population with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulationView {
    /// The agents.
    pub agents: Vec<Agent>,
    /// Stored version; `0` if nothing was stored.
    pub version: i64,
}

/// Store access for one interactive session.
#[derive(Clone)]
pub struct InteractiveSession {
    store: Arc<dyn StateStore>,
    key: String,
    max_attempts: u32,
}

impl InteractiveSession {
    /// Open a session on the default population key.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            key: POPULATION_KEY.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Use a different population key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Change how many optimistic attempts [`update`](Self::update) makes.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Read the current population.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] on store failure or
    /// [`SessionError::Payload`] if the stored payload does not decode.
    pub async fn load(&self) -> Result<PopulationView, SessionError> {
        match self.store.load(&self.key).await? {
            Some(blob) => Ok(PopulationView {
                agents: serde_json::from_slice(&blob.payload)?,
                version: blob.version,
            }),
            None => Ok(PopulationView {
                agents: Vec::new(),
                version: 0,
            }),
        }
    }

    /// Write `agents` unconditionally. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on encode or store failure.
    pub async fn save(&self, agents: &[Agent]) -> Result<i64, SessionError> {
        let payload = serde_json::to_vec(agents)?;
        let version = self.store.save(&self.key, &payload).await?;
        debug!(key = %self.key, version, "Session saved population");
        Ok(version)
    }

    /// Apply `mutate` to the latest population and write it back only if
    /// nobody wrote in between, retrying on conflict.
    ///
    /// Returns the closure's result from the attempt that landed and the
    /// new version.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Contended`] if every attempt lost a race, or
    /// any load, encode or store error.
    pub async fn update<R>(
        &self,
        mut mutate: impl FnMut(&mut Vec<Agent>) -> R + Send,
    ) -> Result<(R, i64), SessionError> {
        for attempt in 1..=self.max_attempts {
            let PopulationView {
                mut agents,
                version,
            } = self.load().await?;
            let out = mutate(&mut agents);
            let payload = serde_json::to_vec(&agents)?;
            if let Some(new_version) = self
                .store
                .save_if_version(&self.key, version, &payload)
                .await?
            {
                return Ok((out, new_version));
            }
            debug!(key = %self.key, attempt, "Session update lost a race, retrying");
        }
        warn!(key = %self.key, attempts = self.max_attempts, "Session update gave up");
        Err(SessionError::Contended {
            key: self.key.clone(),
            attempts: self.max_attempts,
        })
    }
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
