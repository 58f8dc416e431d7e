//! Explicit wiring of the shared collaborators.

use std::sync::Arc;

use worldsync_db::StateStore;
use worldsync_types::OwnerId;

use crate::broadcast::Broadcaster;

/// Everything a component needs to reach shared state, built once at
/// startup and passed down.
#[derive(Clone)]
pub struct SimulationContext {
    /// Durable shared store.
    pub store: Arc<dyn StateStore>,
    /// Announcement sink.
    pub broadcaster: Arc<dyn Broadcaster>,
    /// This process's identity.
    pub owner_id: OwnerId,
}

impl SimulationContext {
    /// Bundle the collaborators.
    pub fn new(
        store: Arc<dyn StateStore>,
        broadcaster: Arc<dyn Broadcaster>,
        owner_id: OwnerId,
    ) -> Self {
        Self {
            store,
            broadcaster,
            owner_id,
        }
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}
