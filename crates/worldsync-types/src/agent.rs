//! The agent record owned by the simulation authority.
//!
//! An [`Agent`] is plain data plus an explicit [`Capability`] set. There is
//! no behaviour hierarchy: what an agent *can* do (age, reproduce, respawn,
//! be imprisoned) is a set membership test, which keeps every field that the
//! reconciler protects addressable by name.
//!
//! Agents are never removed from the persisted population. Terminal
//! lifecycle events soft-delete them by setting [`Lifecycle::is_dead`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Something an agent is able to take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Grows older and may die of old age.
    Ages,
    /// May carry a pending birth.
    Reproduces,
    /// Returns to life after a non-permanent death.
    Respawns,
    /// May be held in prison for a while.
    Imprisonable,
}

/// Numeric state that changes every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    /// Current hit points.
    pub hp: i64,
    /// Maximum hit points.
    pub max_hp: i64,
    /// Character level.
    pub level: u32,
    /// Accumulated experience.
    pub experience: i64,
    /// Gold carried.
    pub gold: i64,
}

impl Default for Vitals {
    fn default() -> Self {
        Self {
            hp: 100,
            max_hp: 100,
            level: 1,
            experience: 0,
            gold: 0,
        }
    }
}

/// Kind of a scheduled lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingEventKind {
    /// A child is due; the agent is the carrying parent.
    Birth,
    /// The agent leaves prison.
    Release,
}

/// A lifecycle event the authority has scheduled but not yet fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// What will happen.
    pub kind: PendingEventKind,
    /// When it becomes due.
    pub due_at: DateTime<Utc>,
    /// The other agent involved, if any (e.g. the second parent).
    pub counterpart: Option<AgentId>,
}

/// Lifecycle timestamps and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Wall-clock birth time.
    pub born_at: DateTime<Utc>,
    /// Soft-delete flag. A dead agent stays in the population.
    #[serde(default)]
    pub is_dead: bool,
    /// When the agent last died.
    #[serde(default)]
    pub died_at: Option<DateTime<Utc>>,
    /// Died of old age; never respawns.
    #[serde(default)]
    pub aged_death: bool,
    /// Killed permanently; never respawns.
    #[serde(default)]
    pub perma_dead: bool,
    /// Scheduled authority-only event, if any.
    #[serde(default)]
    pub pending_event: Option<PendingEvent>,
}

impl Lifecycle {
    /// A fresh lifecycle starting at `born_at`.
    pub const fn born(born_at: DateTime<Utc>) -> Self {
        Self {
            born_at,
            is_dead: false,
            died_at: None,
            aged_death: false,
            perma_dead: false,
            pending_event: None,
        }
    }

    /// Whether the death is permanent.
    pub const fn is_terminal(&self) -> bool {
        self.aged_death || self.perma_dead
    }
}

/// One member of the simulated population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identifier.
    pub id: AgentId,
    /// Display name.
    pub name: String,
    /// Catalog template this agent originated from.
    pub template_id: String,
    /// Current location name.
    pub location: String,
    /// Numeric vitals.
    #[serde(default)]
    pub vitals: Vitals,
    /// Affinity towards other agents.
    #[serde(default)]
    pub relationships: BTreeMap<AgentId, i32>,
    /// Lifecycle timestamps and flags.
    pub lifecycle: Lifecycle,
    /// End of a prison sentence, if imprisoned.
    #[serde(default)]
    pub imprisoned_until: Option<DateTime<Utc>>,
    /// What this agent can take part in.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl Agent {
    /// Create a living agent with default vitals.
    pub fn new(
        name: impl Into<String>,
        template_id: impl Into<String>,
        location: impl Into<String>,
        born_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            template_id: template_id.into(),
            location: location.into(),
            vitals: Vitals::default(),
            relationships: BTreeMap::new(),
            lifecycle: Lifecycle::born(born_at),
            imprisoned_until: None,
            capabilities: BTreeSet::new(),
        }
    }

    /// Builder-style capability grant.
    #[must_use]
    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    /// Whether the agent has `cap`.
    pub fn can(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Whether the agent is alive (not soft-deleted).
    pub const fn is_alive(&self) -> bool {
        !self.lifecycle.is_dead
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn legacy_payload_without_optional_fields_decodes() {
        let id = AgentId::new();
        let json = format!(
            r#"{{"id":"{id}","name":"Ragnar","template_id":"warrior","location":"Inn",
                "lifecycle":{{"born_at":"2026-01-01T00:00:00Z"}}}}"#
        );
        let agent: Agent = serde_json::from_str(&json).unwrap();
        assert!(agent.is_alive());
        assert!(agent.lifecycle.pending_event.is_none());
        assert!(agent.capabilities.is_empty());
        assert_eq!(agent.vitals, Vitals::default());
    }

    #[test]
    fn capabilities_are_set_membership() {
        let agent = Agent::new("Ilse", "healer", "Temple", Utc::now())
            .with_capabilities([Capability::Ages, Capability::Respawns]);
        assert!(agent.can(Capability::Ages));
        assert!(!agent.can(Capability::Reproduces));
    }
}
