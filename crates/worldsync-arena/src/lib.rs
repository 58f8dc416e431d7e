//! The contested resource arena for worldsync.
//!
//! A single time-boxed encounter with a shared HP pool that any number of
//! sessions damage concurrently. Damage is an atomic decrement of a store
//! counter, contributions accumulate in a store ledger, and settlement pays
//! tiered rewards exactly once behind a write-once marker.
//!
//! # Modules
//!
//! - [`arena`] -- Spawn, damage, status, leaderboard and settlement
//! - [`config`] -- The `arena` section of the config file
//! - [`duty`] -- Periodic spawn check for the simulation loop
//! - [`error`] -- Arena error type
//! - [`keys`] -- Store key layout
//! - [`presence`] -- Participant counts used for spawning and scaling
//! - [`rewards`] -- Tier cutoffs and payout arithmetic

pub mod arena;
pub mod config;
pub mod duty;
pub mod error;
pub mod keys;
pub mod presence;
pub mod rewards;

pub use arena::{Arena, SpawnOutcome};
pub use config::{ArenaConfig, ResourceTemplate, RewardConfig};
pub use duty::ArenaSpawnDuty;
pub use error::ArenaError;
pub use presence::{FixedPresence, Presence, PresenceSource, StorePresence};
pub use rewards::{TierCutoffs, compute_payouts};
