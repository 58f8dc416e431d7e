//! Copy-on-write agent registry.
//!
//! The simulation loop mutates the population every tick while other tasks
//! (status reporting, in-process readers, the flush encoder) read it.
//! Writers serialize on a mutex, clone the published list, mutate the clone
//! and publish it as a new [`Arc`] together with a bumped version. Readers
//! hold the read lock only long enough to clone that `Arc`, so a reader
//! never observes a half-applied mutation and never blocks a writer for
//! longer than a pointer copy.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use worldsync_types::{Agent, AgentId};

#[derive(Debug, Default)]
struct Published {
    agents: Arc<Vec<Agent>>,
    version: u64,
}

/// Versioned snapshot registry of the agent population.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    published: RwLock<Published>,
    writer: Mutex<()>,
}

impl AgentRegistry {
    /// Create an empty registry at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `agents`.
    pub fn with_agents(agents: Vec<Agent>) -> Self {
        let registry = Self::new();
        registry.replace_all(agents);
        registry
    }

    /// The current published list. Cheap; never blocks on writers' work.
    pub fn snapshot(&self) -> Arc<Vec<Agent>> {
        Arc::clone(&self.published.read().agents)
    }

    /// Snapshot and version read together.
    pub fn versioned_snapshot(&self) -> (Arc<Vec<Agent>>, u64) {
        let published = self.published.read();
        (Arc::clone(&published.agents), published.version)
    }

    /// Number of mutations published so far.
    pub fn version(&self) -> u64 {
        self.published.read().version
    }

    /// Clone of the agent with `id`, if present.
    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.snapshot().iter().find(|a| a.id == id).cloned()
    }

    /// Number of agents, dead ones included.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the registry holds no agents.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// `(alive, dead)` head counts.
    pub fn counts(&self) -> (usize, usize) {
        let agents = self.snapshot();
        let alive = agents.iter().filter(|a| a.is_alive()).count();
        (alive, agents.len().saturating_sub(alive))
    }

    /// Append an agent.
    pub fn add(&self, agent: Agent) {
        self.write(|agents| agents.push(agent));
    }

    /// Remove the agent with `id`, returning it.
    pub fn remove(&self, id: AgentId) -> Option<Agent> {
        self.write(|agents| {
            let index = agents.iter().position(|a| a.id == id)?;
            Some(agents.remove(index))
        })
    }

    /// Remove every agent.
    pub fn clear(&self) {
        self.write(Vec::clear);
    }

    /// Publish `agents` as the whole population.
    pub fn replace_all(&self, agents: Vec<Agent>) {
        let _writer = self.writer.lock();
        let mut published = self.published.write();
        published.agents = Arc::new(agents);
        published.version = published.version.saturating_add(1);
    }

    /// Mutate one agent in place. Returns `None` if `id` is unknown.
    pub fn update<R>(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        self.write(|agents| agents.iter_mut().find(|a| a.id == id).map(f))
    }

    /// Mutate the whole population as one atomic step.
    pub fn mutate_all<R>(&self, f: impl FnOnce(&mut Vec<Agent>) -> R) -> R {
        self.write(f)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Vec<Agent>) -> R) -> R {
        let _writer = self.writer.lock();
        let mut next = Vec::clone(&self.published.read().agents);
        let out = f(&mut next);
        let mut published = self.published.write();
        published.agents = Arc::new(next);
        published.version = published.version.saturating_add(1);
        out
    }
}
