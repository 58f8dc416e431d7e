//! Error types for the arena.

use worldsync_core::DutyError;
use worldsync_db::DbError;
use worldsync_types::{ResourceId, ResourceStatus};

/// Errors from arena operations.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    /// The store could not complete the request.
    #[error("arena store error: {0}")]
    Store(#[from] DbError),

    /// A record could not be encoded or decoded.
    #[error("arena payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// No resource with this id was ever spawned.
    #[error("contested resource {resource_id} not found")]
    NotFound {
        /// The unknown id.
        resource_id: ResourceId,
    },

    /// The resource exists but its HP counter is not armed yet.
    #[error("contested resource {resource_id} is not active yet")]
    NotActive {
        /// The pending resource.
        resource_id: ResourceId,
    },

    /// Damage must be positive.
    #[error("invalid damage amount {amount}")]
    InvalidDamage {
        /// The rejected amount.
        amount: i64,
    },

    /// The encounter ran out of time.
    #[error("contested resource {resource_id} has expired")]
    Expired {
        /// The expired resource.
        resource_id: ResourceId,
    },

    /// Settlement was requested before the resource reached zero.
    #[error("contested resource {resource_id} is {status:?}, not depleted")]
    NotDepleted {
        /// The resource.
        resource_id: ResourceId,
        /// Its current status.
        status: ResourceStatus,
    },

    /// A record kept changing under every optimistic attempt.
    #[error("update of {key} kept losing to concurrent writers")]
    Contended {
        /// The contended key.
        key: String,
    },
}

impl From<ArenaError> for DutyError {
    fn from(e: ArenaError) -> Self {
        Self(e.to_string())
    }
}
