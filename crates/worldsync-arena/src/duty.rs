//! The periodic spawn check, run by the simulation authority.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use worldsync_core::{Duty, DutyError};

use crate::arena::{Arena, SpawnOutcome};

/// Runs [`Arena::check_spawn_eligibility`] on the configured cadence.
#[derive(Debug, Clone)]
pub struct ArenaSpawnDuty {
    arena: Arc<Arena>,
}

impl ArenaSpawnDuty {
    /// Drive spawn checks for `arena`.
    pub const fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }
}

#[async_trait]
impl Duty for ArenaSpawnDuty {
    fn name(&self) -> &str {
        "arena-spawn"
    }

    fn interval(&self) -> Duration {
        self.arena.config().spawn_check_interval()
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<(), DutyError> {
        match self.arena.check_spawn_eligibility(now).await? {
            SpawnOutcome::Spawned(resource) => {
                tracing::debug!(resource = %resource.id, "Spawn check started an encounter");
            }
            outcome => tracing::trace!(?outcome, "Spawn check made no change"),
        }
        Ok(())
    }
}
