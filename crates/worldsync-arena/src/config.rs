//! The `arena` section of `worldsync-config.yaml`.
//!
//! Every field has a default, so an absent section yields a working arena
//! with the built-in encounter templates.

use std::time::Duration;

use chrono::TimeDelta;
use rust_decimal::Decimal;
use serde::Deserialize;
use worldsync_types::RewardTier;

/// Arena tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArenaConfig {
    /// Concurrent participants required before anything spawns.
    #[serde(default = "default_min_participants")]
    pub min_participants: u32,

    /// Extra HP per participant, as a fraction of the template's base.
    #[serde(default = "default_hp_scale_per_participant")]
    pub hp_scale_per_participant: Decimal,

    /// Minutes an encounter stays open.
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u64,

    /// Seconds between spawn checks.
    #[serde(default = "default_spawn_check_secs")]
    pub spawn_check_secs: u64,

    /// Minutes a depleted template waits before it can spawn again.
    #[serde(default = "default_respawn_cooldown_minutes")]
    pub respawn_cooldown_minutes: u64,

    /// Fractions of HP remaining at which phases 2, 3, ... begin,
    /// descending.
    #[serde(default = "default_phase_thresholds")]
    pub phase_thresholds: Vec<Decimal>,

    /// Reward sizes.
    #[serde(default)]
    pub rewards: RewardConfig,

    /// Encounters to pick from.
    #[serde(default = "default_templates")]
    pub templates: Vec<ResourceTemplate>,
}

impl ArenaConfig {
    /// How long an encounter stays open.
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::try_minutes(i64::try_from(self.duration_minutes).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX)
    }

    /// Template cooldown after depletion.
    pub fn respawn_cooldown(&self) -> TimeDelta {
        TimeDelta::try_minutes(i64::try_from(self.respawn_cooldown_minutes).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX)
    }

    /// Spawn check cadence.
    pub const fn spawn_check_interval(&self) -> Duration {
        Duration::from_secs(self.spawn_check_secs)
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            min_participants: default_min_participants(),
            hp_scale_per_participant: default_hp_scale_per_participant(),
            duration_minutes: default_duration_minutes(),
            spawn_check_secs: default_spawn_check_secs(),
            respawn_cooldown_minutes: default_respawn_cooldown_minutes(),
            phase_thresholds: default_phase_thresholds(),
            rewards: RewardConfig::default(),
            templates: default_templates(),
        }
    }
}

/// Base reward amounts and per-tier multipliers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewardConfig {
    /// Experience per encounter level before the tier multiplier.
    #[serde(default = "default_base_xp_per_level")]
    pub base_xp_per_level: i64,

    /// Gold per encounter level before the tier multiplier.
    #[serde(default = "default_base_gold_per_level")]
    pub base_gold_per_level: i64,

    /// Multiplier for rank 1.
    #[serde(default = "default_mvp_multiplier")]
    pub mvp_multiplier: Decimal,

    /// Multiplier for ranks 2 and 3.
    #[serde(default = "default_top3_multiplier")]
    pub top3_multiplier: Decimal,

    /// Multiplier for the top quarter.
    #[serde(default = "default_top25_multiplier")]
    pub top25_multiplier: Decimal,

    /// Multiplier for the top half.
    #[serde(default = "default_top50_multiplier")]
    pub top50_multiplier: Decimal,

    /// Multiplier for everyone else.
    #[serde(default = "default_contributor_multiplier")]
    pub contributor_multiplier: Decimal,
}

impl RewardConfig {
    /// The multiplier for `tier`.
    pub const fn multiplier(&self, tier: RewardTier) -> Decimal {
        match tier {
            RewardTier::Mvp => self.mvp_multiplier,
            RewardTier::Top3 => self.top3_multiplier,
            RewardTier::Top25 => self.top25_multiplier,
            RewardTier::Top50 => self.top50_multiplier,
            RewardTier::Contributor => self.contributor_multiplier,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            base_xp_per_level: default_base_xp_per_level(),
            base_gold_per_level: default_base_gold_per_level(),
            mvp_multiplier: default_mvp_multiplier(),
            top3_multiplier: default_top3_multiplier(),
            top25_multiplier: default_top25_multiplier(),
            top50_multiplier: default_top50_multiplier(),
            contributor_multiplier: default_contributor_multiplier(),
        }
    }
}

/// An encounter the arena can spawn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceTemplate {
    /// Stable template id, used for cooldowns.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Minimum encounter level.
    pub base_level: u32,
    /// HP before participant scaling.
    pub base_amount: i64,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_min_participants() -> u32 {
    3
}

fn default_hp_scale_per_participant() -> Decimal {
    Decimal::new(15, 2)
}

const fn default_duration_minutes() -> u64 {
    60
}

const fn default_spawn_check_secs() -> u64 {
    30
}

const fn default_respawn_cooldown_minutes() -> u64 {
    360
}

fn default_phase_thresholds() -> Vec<Decimal> {
    vec![Decimal::new(65, 2), Decimal::new(30, 2)]
}

const fn default_base_xp_per_level() -> i64 {
    500
}

const fn default_base_gold_per_level() -> i64 {
    200
}

fn default_mvp_multiplier() -> Decimal {
    Decimal::new(3, 0)
}

fn default_top3_multiplier() -> Decimal {
    Decimal::new(2, 0)
}

fn default_top25_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

fn default_top50_multiplier() -> Decimal {
    Decimal::new(125, 2)
}

fn default_contributor_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_templates() -> Vec<ResourceTemplate> {
    [
        ("abyssal_leviathan", "The Abyssal Leviathan", 40, 200_000),
        ("void_colossus", "Void Colossus", 50, 280_000),
        ("shadowlord_malachar", "Shadowlord Malachar", 35, 180_000),
        ("crimson_wyrm", "The Crimson Wyrm", 45, 250_000),
    ]
    .into_iter()
    .map(|(id, name, base_level, base_amount)| ResourceTemplate {
        id: id.to_owned(),
        name: name.to_owned(),
        base_level,
        base_amount,
    })
    .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config: ArenaConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config, ArenaConfig::default());
        assert_eq!(config.templates.len(), 4);
        assert_eq!(config.rewards.multiplier(RewardTier::Top50), Decimal::new(125, 2));
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let yaml = r"
min_participants: 5
hp_scale_per_participant: 0.2
rewards:
  mvp_multiplier: 4
templates:
  - id: golem
    name: Stone Golem
    base_level: 12
    base_amount: 5000
";
        let config: ArenaConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.min_participants, 5);
        assert_eq!(config.hp_scale_per_participant, Decimal::new(2, 1));
        assert_eq!(config.rewards.mvp_multiplier, Decimal::new(4, 0));
        assert_eq!(config.rewards.base_xp_per_level, 500);
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.duration(), TimeDelta::minutes(60));
    }
}
