//! Shared type definitions for the worldsync state synchronization core.
//!
//! Every crate in the workspace speaks in these types: the simulation
//! authority, interactive sessions, the store backends and the arena.
//!
//! # Modules
//!
//! - [`ids`] -- Typed identifiers (UUID v7 wrappers and opaque name ids)
//! - [`agent`] -- The agent record, lifecycle block and capability set
//! - [`blob`] -- Versioned payloads and simulation leases
//! - [`arena`] -- Contested resources, damage ledger, settlement payouts
//! - [`announcement`] -- Broadcast messages

pub mod agent;
pub mod announcement;
pub mod arena;
pub mod blob;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use agent::{Agent, Capability, Lifecycle, PendingEvent, PendingEventKind, Vitals};
pub use announcement::Announcement;
pub use arena::{
    ContestedResource, ContributorTotal, DamageLedgerEntry, Payout, ResourceStatus, RewardTier,
    SettlementRecord,
};
pub use blob::{LeaseHolder, SimulationLease, VersionedBlob};
pub use ids::{AgentId, ContributorId, OwnerId, ResourceId};
