//! Contested resource records: the shared HP pool, the damage ledger, and
//! settlement payouts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{ContributorId, ResourceId};

/// Lifecycle status of a contested resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Record written, HP counter not yet armed.
    Pending,
    /// Accepting damage.
    Active,
    /// Ran out of time before being depleted.
    Expired,
    /// HP reached zero.
    Depleted,
}

impl ResourceStatus {
    /// Whether no further damage or status change is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Depleted)
    }
}

/// A time-boxed shared HP pool.
///
/// `current_amount` and `phase` are a cached view; the store-level counter
/// is authoritative and both are recomputed from it on every status read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestedResource {
    /// Encounter identifier.
    pub id: ResourceId,
    /// Catalog template the encounter was spawned from.
    pub template_id: String,
    /// Display name.
    pub name: String,
    /// Encounter level, drives reward size.
    pub level: u32,
    /// Remaining amount, clamped at zero.
    pub current_amount: i64,
    /// Amount at spawn.
    pub max_amount: i64,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Spawn time.
    pub spawned_at: DateTime<Utc>,
    /// Deadline after which the encounter expires.
    pub expires_at: DateTime<Utc>,
    /// Difficulty phase, starting at 1.
    pub phase: u8,
}

impl ContestedResource {
    /// Fraction of HP remaining in `[0, 1]`.
    pub fn fraction_remaining(&self) -> Decimal {
        if self.max_amount <= 0 {
            return Decimal::ZERO;
        }
        let current = Decimal::from(self.current_amount.max(0));
        let max = Decimal::from(self.max_amount);
        (current / max).min(Decimal::ONE)
    }
}

/// One accepted hit against a contested resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageLedgerEntry {
    /// Resource that was hit.
    pub resource_id: ResourceId,
    /// Who dealt the damage.
    pub contributor_id: ContributorId,
    /// Amount credited to the contributor (0 if the resource was already down).
    pub amount_dealt: i64,
    /// When the hit was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A contributor's accumulated damage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorTotal {
    /// The contributor.
    pub contributor_id: ContributorId,
    /// Sum of credited damage.
    pub total_damage: i64,
}

/// Reward tier derived from leaderboard rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RewardTier {
    /// Rank 1.
    Mvp,
    /// Ranks 2 and 3.
    Top3,
    /// Within the top quarter.
    Top25,
    /// Within the top half.
    Top50,
    /// Everyone else who dealt damage.
    Contributor,
}

/// What one contributor receives from a settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Recipient.
    pub contributor_id: ContributorId,
    /// 1-based leaderboard rank.
    pub rank: u32,
    /// Tier the rank falls into.
    pub tier: RewardTier,
    /// Raw damage total.
    pub total_damage: i64,
    /// Share of the capped pool, in `[0, 1]`.
    pub contribution: Decimal,
    /// Experience awarded.
    pub xp: i64,
    /// Gold awarded.
    pub gold: i64,
}

/// The immutable outcome of settling one depleted resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Settled resource.
    pub resource_id: ResourceId,
    /// When settlement ran.
    pub settled_at: DateTime<Utc>,
    /// One entry per contributor, in rank order.
    pub payouts: Vec<Payout>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(current: i64, max: i64) -> ContestedResource {
        let now = Utc::now();
        ContestedResource {
            id: ResourceId::new(),
            template_id: "hydra".to_owned(),
            name: "Hydra".to_owned(),
            level: 10,
            current_amount: current,
            max_amount: max,
            status: ResourceStatus::Active,
            spawned_at: now,
            expires_at: now,
            phase: 1,
        }
    }

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(resource(-20, 1000).fraction_remaining(), Decimal::ZERO);
        assert_eq!(resource(500, 1000).fraction_remaining(), Decimal::new(5, 1));
        assert_eq!(resource(10, 0).fraction_remaining(), Decimal::ZERO);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ResourceStatus::Depleted.is_terminal());
        assert!(ResourceStatus::Expired.is_terminal());
        assert!(!ResourceStatus::Active.is_terminal());
        assert!(!ResourceStatus::Pending.is_terminal());
    }
}
