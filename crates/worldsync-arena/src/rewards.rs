//! Reward tiering and payout arithmetic.
//!
//! Tiers are assigned by leaderboard rank. With `n` contributors:
//!
//! ```text
//! rank 1                       -> Mvp
//! rank <= min(3, n)            -> Top3
//! rank <= max(top3, n / 4)     -> Top25
//! rank <= max(top25, n / 2)    -> Top50
//! everyone else                -> Contributor
//! ```
//!
//! XP and gold are `base_per_level * level * tier multiplier`, truncated.
//! Each payout also records the contributor's share of the pool: damage
//! divided by the larger of the ledger total and `max_amount`, so the
//! killing blow's overshoot never pushes shares past 1.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use worldsync_types::{ContributorTotal, Payout, RewardTier};

use crate::config::RewardConfig;

/// Decimal places kept in contribution shares.
const SHARE_DP: u32 = 4;

/// Rank cutoffs (exclusive, zero-based) for a leaderboard of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCutoffs {
    /// Indices below this are Top 3 (after the MVP).
    pub top3: usize,
    /// Indices below this are Top 25%.
    pub top25: usize,
    /// Indices below this are Top 50%.
    pub top50: usize,
}

impl TierCutoffs {
    /// Cutoffs for `contributors` entries.
    pub fn for_contributors(contributors: usize) -> Self {
        let top3 = contributors.min(3);
        let top25 = top3.max(contributors.checked_div(4).unwrap_or(0));
        let top50 = top25.max(contributors.checked_div(2).unwrap_or(0));
        Self { top3, top25, top50 }
    }

    /// Tier of the zero-based leaderboard `index`.
    pub const fn tier(&self, index: usize) -> RewardTier {
        if index == 0 {
            RewardTier::Mvp
        } else if index < self.top3 {
            RewardTier::Top3
        } else if index < self.top25 {
            RewardTier::Top25
        } else if index < self.top50 {
            RewardTier::Top50
        } else {
            RewardTier::Contributor
        }
    }
}

/// Compute one payout per leaderboard entry, in rank order.
///
/// `leaderboard` must already be sorted by descending damage.
pub fn compute_payouts(
    leaderboard: &[ContributorTotal],
    level: u32,
    max_amount: i64,
    config: &RewardConfig,
) -> Vec<Payout> {
    let total = leaderboard
        .iter()
        .map(|entry| entry.total_damage.max(0))
        .fold(0_i64, i64::saturating_add);
    let pool = Decimal::from(total.max(max_amount).max(1));
    let cutoffs = TierCutoffs::for_contributors(leaderboard.len());
    let level = Decimal::from(level);

    leaderboard
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let tier = cutoffs.tier(index);
            let multiplier = config.multiplier(tier);
            let contribution = Decimal::from(entry.total_damage.max(0))
                .checked_div(pool)
                .unwrap_or(Decimal::ZERO)
                .round_dp(SHARE_DP);
            Payout {
                contributor_id: entry.contributor_id.clone(),
                rank: u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1),
                tier,
                total_damage: entry.total_damage,
                contribution,
                xp: scaled(config.base_xp_per_level, level, multiplier),
                gold: scaled(config.base_gold_per_level, level, multiplier),
            }
        })
        .collect()
}

fn scaled(base_per_level: i64, level: Decimal, multiplier: Decimal) -> i64 {
    Decimal::from(base_per_level)
        .checked_mul(level)
        .and_then(|v| v.checked_mul(multiplier))
        .and_then(|v| v.trunc().to_i64())
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use worldsync_types::ContributorId;

    use super::*;

    fn board(damage: &[i64]) -> Vec<ContributorTotal> {
        damage
            .iter()
            .enumerate()
            .map(|(i, d)| ContributorTotal {
                contributor_id: ContributorId::new(format!("p{i:02}")),
                total_damage: *d,
            })
            .collect()
    }

    #[test]
    fn cutoffs_follow_rank_rules() {
        assert_eq!(
            TierCutoffs::for_contributors(1),
            TierCutoffs { top3: 1, top25: 1, top50: 1 }
        );
        assert_eq!(
            TierCutoffs::for_contributors(10),
            TierCutoffs { top3: 3, top25: 3, top50: 5 }
        );
        assert_eq!(
            TierCutoffs::for_contributors(20),
            TierCutoffs { top3: 3, top25: 5, top50: 10 }
        );

        let cut = TierCutoffs::for_contributors(20);
        let tiers: Vec<RewardTier> = (0..20).map(|i| cut.tier(i)).collect();
        assert_eq!(tiers.first(), Some(&RewardTier::Mvp));
        assert_eq!(tiers.get(2), Some(&RewardTier::Top3));
        assert_eq!(tiers.get(4), Some(&RewardTier::Top25));
        assert_eq!(tiers.get(9), Some(&RewardTier::Top50));
        assert_eq!(tiers.get(10), Some(&RewardTier::Contributor));
    }

    #[test]
    fn overshooting_pool_is_shared_by_ledger_total() {
        let payouts = compute_payouts(&board(&[400, 350, 260]), 10, 1000, &RewardConfig::default());
        let shares: Vec<Decimal> = payouts.iter().map(|p| p.contribution).collect();
        assert_eq!(
            shares,
            vec![Decimal::new(3960, 4), Decimal::new(3465, 4), Decimal::new(2574, 4)]
        );

        let tiers: Vec<RewardTier> = payouts.iter().map(|p| p.tier).collect();
        assert_eq!(tiers, vec![RewardTier::Mvp, RewardTier::Top3, RewardTier::Top3]);

        let mvp = payouts.first().map(|p| (p.xp, p.gold));
        assert_eq!(mvp, Some((500 * 10 * 3, 200 * 10 * 3)));
    }

    #[test]
    fn fractional_multipliers_truncate() {
        let damage: Vec<i64> = (1..=8).rev().map(|d| d * 10).collect();
        let payouts = compute_payouts(&board(&damage), 3, 1000, &RewardConfig::default());
        // 8 contributors: top3 = 3, top25 = 3, top50 = 4.
        let top50 = payouts.get(3).map(|p| (p.tier, p.xp));
        assert_eq!(top50, Some((RewardTier::Top50, 1875)));
        let last = payouts.last().map(|p| (p.tier, p.rank, p.gold));
        assert_eq!(last, Some((RewardTier::Contributor, 8, 600)));
        // Under-filled pool: shares are of max_amount.
        assert_eq!(payouts.first().map(|p| p.contribution), Some(Decimal::new(8, 2)));
    }

    #[test]
    fn empty_leaderboard_pays_nobody() {
        assert!(compute_payouts(&[], 10, 1000, &RewardConfig::default()).is_empty());
    }
}
