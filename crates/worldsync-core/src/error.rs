//! Error types for the coordination core.
//!
//! Each component has its own enum; [`SimulationError`] wraps them for the
//! loop. Store failures stay wrapped as [`DbError`] so callers can ask
//! [`DbError::is_transient`] before deciding to retry.

use worldsync_db::DbError;

/// Errors from the lease manager.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The store could not complete a lease operation.
    #[error("lease store error: {0}")]
    Store(#[from] DbError),
}

/// Errors from the state reconciler.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The store could not be read.
    #[error("reconcile store error: {0}")]
    Store(#[from] DbError),

    /// The local state could not be encoded.
    #[error("failed to encode local state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from an interactive session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The store could not complete the request.
    #[error("session store error: {0}")]
    Store(#[from] DbError),

    /// The population payload could not be encoded or decoded.
    #[error("population payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Every optimistic attempt lost to a concurrent writer.
    #[error("update of {key} lost {attempts} races in a row")]
    Contended {
        /// Blob key being updated.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// A periodic duty failed. The loop logs it and runs the duty again on its
/// next cadence.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DutyError(pub String);

/// Errors that stop or degrade the simulation loop.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Lease operation failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// A direct store call failed.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Payload encoding or decoding failed.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A subsystem snapshot could not be restored.
    #[error("subsystem {key} rejected its snapshot: {reason}")]
    Subsystem {
        /// Snapshot key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The flush lost the optimistic race on every retry.
    #[error("flush of {key} lost {attempts} races in a row")]
    FlushContended {
        /// Blob key being flushed.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
}
