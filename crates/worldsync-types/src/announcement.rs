//! Messages the core broadcasts to every connected session.
//!
//! Delivery is fire-and-forget; nothing in the core waits for or depends on
//! an announcement arriving.

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ContributorId, ResourceId};

/// A world-wide announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Announcement {
    /// A contested resource appeared.
    ResourceSpawned {
        /// The new encounter.
        resource_id: ResourceId,
        /// Display name.
        name: String,
        /// Starting HP.
        max_amount: i64,
        /// Participants counted at spawn.
        participants: u32,
    },
    /// A contested resource crossed into a harder phase.
    PhaseEntered {
        /// The encounter.
        resource_id: ResourceId,
        /// Display name.
        name: String,
        /// The phase just entered.
        phase: u8,
    },
    /// A contested resource was brought to zero.
    ResourceDepleted {
        /// The encounter.
        resource_id: ResourceId,
        /// Display name.
        name: String,
        /// Who landed the final hit.
        final_blow: ContributorId,
    },
    /// A contested resource timed out.
    ResourceExpired {
        /// The encounter.
        resource_id: ResourceId,
        /// Display name.
        name: String,
    },
    /// Rewards were paid out.
    RewardsSettled {
        /// The encounter.
        resource_id: ResourceId,
        /// Top contributor, if anyone dealt damage.
        mvp: Option<ContributorId>,
        /// Number of contributors paid.
        contributors: u32,
    },
    /// An agent was born.
    AgentBorn {
        /// The newborn.
        agent_id: AgentId,
        /// Newborn's name.
        name: String,
    },
    /// An agent died.
    AgentDied {
        /// The deceased.
        agent_id: AgentId,
        /// Agent's name.
        name: String,
        /// Whether the death is permanent.
        permanent: bool,
    },
}
