//! Error types for the state store.
//!
//! All backends report failures through [`DbError`], which wraps the
//! underlying [`sqlx`] and [`fred`] errors with context about which
//! operation failed. Callers above this crate treat every variant except
//! [`DbError::Serialization`] as transient: log it and retry next cycle.

/// Errors that can occur in the state store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store returned something that violates its own contract.
    #[error("corrupt store data at {key}: {reason}")]
    Corrupt {
        /// Key holding the bad data.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Serialization(_) | Self::Corrupt { .. } | Self::Config(_)
        )
    }
}
