//! Coordination core for a shared, mutable world.
//!
//! One process at a time is the simulation authority. It holds a lease,
//! steps the agent population on a fixed tick, and flushes the result to a
//! shared store. Interactive sessions write the same population blob
//! without a lease; before every flush the authority reconciles with
//! whatever they wrote so its own fields are never erased.
//!
//! # Modules
//!
//! - [`lease`] -- Single-owner lease acquisition, renewal and release.
//! - [`reconcile`] -- Version check and reload-and-merge with a
//!   [`MergePolicy`](reconcile::MergePolicy).
//! - [`fingerprint`] -- [`DirtyTracker`] skipping writes of unchanged
//!   payloads.
//! - [`registry`] -- Copy-on-write agent registry for concurrent readers.
//! - [`simulation`] -- The tick loop tying the above together.
//! - [`stepper`] -- [`AgentStepper`] trait and the built-in lifecycle
//!   stepper.
//! - [`subsystem`] -- Authority-owned state persisted next to the
//!   population.
//! - [`session`] -- Lease-free access for interactive sessions.
//! - [`duty`] -- Periodic authority-only work such as arena spawns.
//! - [`catalog`] -- Templates for bootstrapping an empty world.
//! - [`broadcast`] -- Fire-and-forget announcements.
//! - [`config`] -- `worldsync-config.yaml` loading.
//! - [`context`] -- Explicit wiring of the store and broadcaster.
//! - [`shutdown`] -- Cooperative cancellation.
//! - [`error`] -- Error types.

pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod context;
pub mod duty;
pub mod error;
pub mod fingerprint;
pub mod lease;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod simulation;
pub mod stepper;
pub mod subsystem;

pub use broadcast::{Broadcaster, ChannelBroadcaster};
pub use catalog::{AgentTemplate, TemplateCatalog};
pub use config::{ConfigError, WorldsyncConfig};
pub use context::SimulationContext;
pub use duty::Duty;
pub use error::{DutyError, LeaseError, ReconcileError, SessionError, SimulationError};
pub use fingerprint::DirtyTracker;
pub use lease::LeaseManager;
pub use reconcile::{LifecycleMergePolicy, MergePolicy, Reconciler};
pub use registry::AgentRegistry;
pub use session::InteractiveSession;
pub use shutdown::ShutdownSignal;
pub use simulation::{FlushOutcome, LoopPhase, POPULATION_KEY, Simulation, SimulationReport};
pub use stepper::{AgentStepper, LifecycleEvent, LifecycleStepper};
pub use subsystem::{LifecycleLog, Subsystem};
