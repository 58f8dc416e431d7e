//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure that can stop startup or the
//! simulation loop, so `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: worldsync_core::ConfigError,
    },

    /// The store could not be reached or prepared.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: worldsync_db::DbError,
    },

    /// The simulation loop stopped with an error.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying simulation error.
        #[from]
        source: worldsync_core::SimulationError,
    },

    /// NATS connection or publishing failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// A config section the engine extracts itself was malformed.
    #[error("bootstrap error: {message}")]
    Bootstrap {
        /// Description of the failure.
        message: String,
    },
}
