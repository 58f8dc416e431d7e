//! The state store for worldsync.
//!
//! Everything the simulation authority, interactive sessions and the arena
//! share goes through a [`StateStore`]: versioned blobs with optimistic
//! compare-and-set, atomic counters, per-member ledgers, write-once markers
//! and single-owner leases.
//!
//! # Backends
//!
//! ```text
//! StateStore (trait, async, object safe)
//!     |
//!     +-- MemoryStore     (parking_lot maps, tokio clock for leases)
//!     +-- DragonflyStore  (fred; hashes + Lua scripts)
//!     +-- PostgresStore   (sqlx; single-statement upserts)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- The [`StateStore`] trait and JSON helpers
//! - [`memory`] -- In-process backend
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) backend
//! - [`postgres`] -- `PostgreSQL` backend and pool configuration
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyStore;
pub use error::DbError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    CounterHit, LedgerCredit, StateStore, load_json, load_marker_json, save_json,
};
