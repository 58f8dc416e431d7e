//! The contested resource arena.
//!
//! At most one encounter is active at a time. Its HP lives in a store
//! counter that every session decrements together with its damage credit in
//! a single atomic step, so hits from any number of concurrent callers are
//! never lost and their order does not matter. The resource record next to
//! it caches status and phase and is only rewritten on transitions.
//!
//! The hit that depletes a resource settles its rewards right away. If that
//! fails, the next spawn check settles it before reusing the slot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use worldsync_core::{Broadcaster, SimulationContext};
use worldsync_db::{LedgerCredit, StateStore, load_json, load_marker_json, save_json};
use worldsync_types::{
    Announcement, ContestedResource, ContributorId, ContributorTotal, ResourceId, ResourceStatus,
    SettlementRecord,
};

use crate::config::{ArenaConfig, ResourceTemplate};
use crate::error::ArenaError;
use crate::keys;
use crate::presence::PresenceSource;
use crate::rewards::compute_payouts;

/// Optimistic attempts for record updates.
const MAX_UPDATE_ATTEMPTS: u32 = 8;

/// What a spawn check decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A new encounter is live.
    Spawned(ContestedResource),
    /// An encounter is already running.
    AlreadyActive(ResourceId),
    /// Not enough participants online.
    TooFewParticipants {
        /// Participants present.
        participants: u32,
        /// Participants required.
        required: u32,
    },
    /// Every template is on cooldown.
    AllOnCooldown,
    /// A concurrent spawner claimed the slot first.
    LostRace,
}

/// Spawn, damage, status and settlement of contested resources.
pub struct Arena {
    store: Arc<dyn StateStore>,
    broadcaster: Arc<dyn Broadcaster>,
    presence: Arc<dyn PresenceSource>,
    config: ArenaConfig,
    /// Immutable parts of resources this process has seen.
    known: Mutex<HashMap<ResourceId, ContestedResource>>,
    /// Highest phase this process announced, per resource.
    announced: Mutex<HashMap<ResourceId, u8>>,
}

impl Arena {
    /// Create an arena over explicit collaborators.
    pub fn new(
        store: Arc<dyn StateStore>,
        broadcaster: Arc<dyn Broadcaster>,
        presence: Arc<dyn PresenceSource>,
        config: ArenaConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            presence,
            config,
            known: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashMap::new()),
        }
    }

    /// Create an arena sharing the simulation's store and broadcaster.
    pub fn from_context(
        ctx: &SimulationContext,
        presence: Arc<dyn PresenceSource>,
        config: ArenaConfig,
    ) -> Self {
        Self::new(ctx.store.clone(), ctx.broadcaster.clone(), presence, config)
    }

    /// The arena configuration.
    pub const fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Expire a stale encounter, then spawn a new one if the slot is free,
    /// enough participants are present and a template is off cooldown.
    ///
    /// The slot is claimed with a compare-and-set, so of several concurrent
    /// callers at most one spawns.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError`] on store or payload failure.
    pub async fn check_spawn_eligibility(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SpawnOutcome, ArenaError> {
        let slot = self.store.load(keys::ACTIVE).await?;
        let slot_version = slot.as_ref().map_or(0, |blob| blob.version);
        let current = slot.and_then(|blob| {
            serde_json::from_slice::<Option<ResourceId>>(&blob.payload)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Active arena slot undecodable, treating as free");
                    None
                })
        });

        if let Some(id) = current {
            match self.status(id, now).await {
                Ok(resource) if !resource.status.is_terminal() => {
                    return Ok(SpawnOutcome::AlreadyActive(id));
                }
                Ok(resource) if resource.status == ResourceStatus::Depleted => {
                    // No-op when the depleting hit already settled.
                    self.settle_rewards(id, now).await?;
                }
                Ok(_) => {}
                Err(ArenaError::NotFound { .. }) => {
                    warn!(resource = %id, "Active slot points at a missing resource, reclaiming");
                }
                Err(e) => return Err(e),
            }
        }

        let presence = self.presence.presence().await?;
        if presence.participants < self.config.min_participants {
            debug!(
                participants = presence.participants,
                required = self.config.min_participants,
                "Too few participants to spawn"
            );
            return Ok(SpawnOutcome::TooFewParticipants {
                participants: presence.participants,
                required: self.config.min_participants,
            });
        }

        let cooldowns = self.cooldowns().await?;
        let Some(template) = self.pick_template(&cooldowns, now) else {
            debug!("Every arena template is on cooldown");
            return Ok(SpawnOutcome::AllOnCooldown);
        };

        let id = ResourceId::new();
        let max_amount = self.scaled_amount(template.base_amount, presence.participants);
        let level = presence
            .average_level
            .map_or(template.base_level, |avg| avg.max(template.base_level));
        let mut resource = ContestedResource {
            id,
            template_id: template.id.clone(),
            name: template.name.clone(),
            level,
            current_amount: max_amount,
            max_amount,
            status: ResourceStatus::Pending,
            spawned_at: now,
            expires_at: now
                .checked_add_signed(self.config.duration())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            phase: 1,
        };

        // Record and counter first: losing the claim below leaves only an
        // unreferenced pending record behind.
        save_json(self.store.as_ref(), &keys::resource(id), &resource).await?;
        self.store.atomic_add(&keys::hp(id), max_amount).await?;

        let claim = serde_json::to_vec(&Some(id))?;
        if self
            .store
            .save_if_version(keys::ACTIVE, slot_version, &claim)
            .await?
            .is_none()
        {
            info!(resource = %id, "Another spawner claimed the arena first");
            return Ok(SpawnOutcome::LostRace);
        }

        resource.status = ResourceStatus::Active;
        save_json(self.store.as_ref(), &keys::resource(id), &resource).await?;
        self.known.lock().insert(id, resource.clone());

        info!(
            resource = %id,
            name = %resource.name,
            level,
            max_amount,
            participants = presence.participants,
            "Contested resource spawned"
        );
        self.broadcaster.notify_all(&Announcement::ResourceSpawned {
            resource_id: id,
            name: resource.name.clone(),
            max_amount,
            participants: presence.participants,
        });
        Ok(SpawnOutcome::Spawned(resource))
    }

    /// Apply `amount` damage from `contributor` and return the remaining
    /// amount, clamped at zero.
    ///
    /// The hit is credited to the ledger only if the resource still had HP
    /// before it landed. The call that takes the counter from positive to
    /// zero or below marks the resource depleted, announces it and settles
    /// rewards. A failed settlement is logged and retried by the next spawn
    /// check; it does not fail the hit.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidDamage`] for non-positive amounts,
    /// [`ArenaError::Expired`] past the deadline,
    /// [`ArenaError::NotFound`] / [`ArenaError::NotActive`] for unknown or
    /// unarmed resources, or a store error.
    pub async fn record_damage(
        &self,
        id: ResourceId,
        contributor: &ContributorId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, ArenaError> {
        if amount <= 0 {
            return Err(ArenaError::InvalidDamage { amount });
        }
        let resource = self.resource(id).await?;
        if now > resource.expires_at {
            return Err(ArenaError::Expired { resource_id: id });
        }

        let hit = self
            .store
            .record_hit(&keys::hp(id), &keys::damage(id), contributor.as_str(), amount)
            .await?;

        if hit.before <= 0 {
            debug!(resource = %id, contributor = %contributor, "Hit landed after depletion, not credited");
        } else if hit.crossed_zero() {
            self.mark_depleted(&resource, contributor, now).await?;
            if let Err(e) = self.settle_rewards(id, now).await {
                warn!(resource = %id, error = %e, "Settlement after depletion failed, retrying at next spawn check");
            }
        }
        Ok(hit.after.max(0))
    }

    /// Current state of a resource, recomputed from the HP counter.
    ///
    /// Status is `Depleted` once the counter is at or below zero and
    /// `Expired` past the deadline. Phase follows the fraction remaining;
    /// each phase is announced at most once across all processes.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotFound`] for unknown ids, or a store error.
    pub async fn status(
        &self,
        id: ResourceId,
        now: DateTime<Utc>,
    ) -> Result<ContestedResource, ArenaError> {
        let Some((mut resource, _)) =
            load_json::<ContestedResource>(self.store.as_ref(), &keys::resource(id)).await?
        else {
            return Err(ArenaError::NotFound { resource_id: id });
        };
        let Some(counter) = self.store.read_counter(&keys::hp(id)).await? else {
            return Ok(resource);
        };

        let stored_status = resource.status;
        let stored_phase = resource.phase;
        resource.current_amount = counter.max(0);
        resource.phase = self.phase_for(resource.fraction_remaining());
        // Pending records lost their slot claim and never go live.
        if !resource.status.is_terminal() && resource.status != ResourceStatus::Pending {
            resource.status = if counter <= 0 {
                ResourceStatus::Depleted
            } else if now > resource.expires_at {
                ResourceStatus::Expired
            } else {
                ResourceStatus::Active
            };
        }

        self.announce_phases(&resource).await?;

        if resource.status != stored_status || resource.phase != stored_phase {
            let target = resource.clone();
            let (_, changed) = self
                .update_blob::<Option<ContestedResource>, _>(&keys::resource(id), |stored| {
                    let Some(stored) = stored.as_mut() else {
                        return false;
                    };
                    let mut changed = false;
                    if !stored.status.is_terminal() && stored.status != target.status {
                        stored.status = target.status;
                        changed = true;
                    }
                    if target.phase > stored.phase {
                        stored.phase = target.phase;
                        changed = true;
                    }
                    if changed {
                        stored.current_amount = target.current_amount;
                    }
                    changed
                })
                .await?;
            if changed
                && stored_status != ResourceStatus::Expired
                && resource.status == ResourceStatus::Expired
            {
                info!(
                    resource = %id,
                    name = %resource.name,
                    remaining = resource.current_amount,
                    "Contested resource expired"
                );
                self.broadcaster.notify_all(&Announcement::ResourceExpired {
                    resource_id: id,
                    name: resource.name.clone(),
                });
            }
        }
        Ok(resource)
    }

    /// The encounter in the active slot, if any, with fresh status.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError`] on store or payload failure.
    pub async fn active(&self, now: DateTime<Utc>) -> Result<Option<ContestedResource>, ArenaError> {
        let Some((Some(id), _)) =
            load_json::<Option<ResourceId>>(self.store.as_ref(), keys::ACTIVE).await?
        else {
            return Ok(None);
        };
        match self.status(id, now).await {
            Ok(resource) => Ok(Some(resource)),
            Err(ArenaError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Contributor totals, highest damage first, ties by contributor id.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Store`] if the ledger cannot be read.
    pub async fn leaderboard(&self, id: ResourceId) -> Result<Vec<ContributorTotal>, ArenaError> {
        let totals = self.store.ledger_totals(&keys::damage(id)).await?;
        let mut board: Vec<ContributorTotal> = totals
            .into_iter()
            .map(|(member, total_damage)| ContributorTotal {
                contributor_id: ContributorId::new(member),
                total_damage,
            })
            .collect();
        board.sort_by(|a, b| {
            b.total_damage
                .cmp(&a.total_damage)
                .then_with(|| a.contributor_id.cmp(&b.contributor_id))
        });
        Ok(board)
    }

    /// Pay tiered rewards for a depleted resource, exactly once.
    ///
    /// The first successful call writes the settlement record as a
    /// write-once marker and credits the `rewards:xp` / `rewards:gold`
    /// ledgers in the same atomic store call, so a failure leaves neither
    /// behind and the call can simply be repeated. Every later call returns
    /// the recorded settlement and pays nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NotDepleted`] if the resource still has HP or
    /// expired, or a store error.
    pub async fn settle_rewards(
        &self,
        id: ResourceId,
        now: DateTime<Utc>,
    ) -> Result<SettlementRecord, ArenaError> {
        let marker = keys::settled(id);
        if let Some(record) =
            load_marker_json::<SettlementRecord>(self.store.as_ref(), &marker).await?
        {
            debug!(resource = %id, "Already settled");
            return Ok(record);
        }

        let resource = self.status(id, now).await?;
        if resource.status != ResourceStatus::Depleted {
            return Err(ArenaError::NotDepleted {
                resource_id: id,
                status: resource.status,
            });
        }

        let board = self.leaderboard(id).await?;
        let record = SettlementRecord {
            resource_id: id,
            settled_at: now,
            payouts: compute_payouts(
                &board,
                resource.level,
                resource.max_amount,
                &self.config.rewards,
            ),
        };
        let payload = serde_json::to_vec(&record)?;
        let credits: Vec<LedgerCredit> = record
            .payouts
            .iter()
            .flat_map(|p| {
                let member = p.contributor_id.as_str();
                [
                    LedgerCredit::new(keys::XP_LEDGER, member, p.xp),
                    LedgerCredit::new(keys::GOLD_LEDGER, member, p.gold),
                ]
            })
            .collect();
        if !self
            .store
            .put_if_absent_with_credits(&marker, &payload, &credits)
            .await?
        {
            debug!(resource = %id, "Settled concurrently elsewhere");
            return load_marker_json::<SettlementRecord>(self.store.as_ref(), &marker)
                .await?
                .ok_or(ArenaError::Contended { key: marker });
        }

        let mvp = record.payouts.first().map(|p| p.contributor_id.clone());
        let contributors = u32::try_from(record.payouts.len()).unwrap_or(u32::MAX);
        info!(resource = %id, name = %resource.name, contributors, mvp = ?mvp, "Rewards settled");
        self.broadcaster.notify_all(&Announcement::RewardsSettled {
            resource_id: id,
            mvp,
            contributors,
        });
        Ok(record)
    }

    /// `base * (1 + scale * participants)`, truncated.
    fn scaled_amount(&self, base: i64, participants: u32) -> i64 {
        self.config
            .hp_scale_per_participant
            .checked_mul(Decimal::from(participants))
            .and_then(|extra| Decimal::ONE.checked_add(extra))
            .and_then(|factor| Decimal::from(base).checked_mul(factor))
            .and_then(|amount| amount.trunc().to_i64())
            .unwrap_or(base)
            .max(1)
    }

    /// Phase 1 plus one per threshold the fraction is at or below.
    fn phase_for(&self, fraction: Decimal) -> u8 {
        let crossed = self
            .config
            .phase_thresholds
            .iter()
            .filter(|threshold| fraction <= **threshold)
            .count();
        u8::try_from(crossed).unwrap_or(u8::MAX).saturating_add(1)
    }

    fn pick_template(
        &self,
        cooldowns: &BTreeMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<ResourceTemplate> {
        let eligible: Vec<&ResourceTemplate> = self
            .config
            .templates
            .iter()
            .filter(|t| cooldowns.get(&t.id).is_none_or(|until| *until <= now))
            .collect();
        eligible.choose(&mut rand::rng()).map(|t| (*t).clone())
    }

    async fn cooldowns(&self) -> Result<BTreeMap<String, DateTime<Utc>>, ArenaError> {
        Ok(load_json(self.store.as_ref(), keys::COOLDOWNS)
            .await?
            .map(|(cooldowns, _)| cooldowns)
            .unwrap_or_default())
    }

    /// Load and cache a resource for damage. Only armed resources are
    /// cached; their id, deadline and size never change.
    async fn resource(&self, id: ResourceId) -> Result<ContestedResource, ArenaError> {
        let cached = self.known.lock().get(&id).cloned();
        if let Some(resource) = cached {
            return Ok(resource);
        }
        let Some((resource, _)) =
            load_json::<ContestedResource>(self.store.as_ref(), &keys::resource(id)).await?
        else {
            return Err(ArenaError::NotFound { resource_id: id });
        };
        if resource.status == ResourceStatus::Pending {
            return Err(ArenaError::NotActive { resource_id: id });
        }
        self.known.lock().insert(id, resource.clone());
        Ok(resource)
    }

    async fn mark_depleted(
        &self,
        resource: &ContestedResource,
        final_blow: &ContributorId,
        now: DateTime<Utc>,
    ) -> Result<(), ArenaError> {
        self.update_blob::<Option<ContestedResource>, _>(&keys::resource(resource.id), |stored| {
            match stored.as_mut() {
                Some(stored) if stored.status != ResourceStatus::Depleted => {
                    stored.status = ResourceStatus::Depleted;
                    stored.current_amount = 0;
                    true
                }
                _ => false,
            }
        })
        .await?;

        let until = now
            .checked_add_signed(self.config.respawn_cooldown())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let template = resource.template_id.clone();
        self.update_blob::<BTreeMap<String, DateTime<Utc>>, _>(keys::COOLDOWNS, |cooldowns| {
            cooldowns.retain(|_, at| *at > now);
            cooldowns.insert(template.clone(), until);
            true
        })
        .await?;

        info!(
            resource = %resource.id,
            name = %resource.name,
            final_blow = %final_blow,
            "Contested resource depleted"
        );
        self.broadcaster.notify_all(&Announcement::ResourceDepleted {
            resource_id: resource.id,
            name: resource.name.clone(),
            final_blow: final_blow.clone(),
        });
        Ok(())
    }

    async fn announce_phases(&self, resource: &ContestedResource) -> Result<(), ArenaError> {
        let last = self
            .announced
            .lock()
            .get(&resource.id)
            .copied()
            .unwrap_or(1);
        if resource.phase <= last {
            return Ok(());
        }
        for phase in last.saturating_add(1)..=resource.phase {
            if self
                .store
                .put_if_absent(&keys::phase(resource.id, phase), b"1")
                .await?
            {
                info!(resource = %resource.id, phase, "Contested resource entered a new phase");
                self.broadcaster.notify_all(&Announcement::PhaseEntered {
                    resource_id: resource.id,
                    name: resource.name.clone(),
                    phase,
                });
            }
        }
        let mut announced = self.announced.lock();
        let entry = announced.entry(resource.id).or_insert(1);
        *entry = (*entry).max(resource.phase);
        Ok(())
    }

    /// Read-modify-write a JSON blob with a version check, retrying on
    /// conflict. `mutate` returns whether it changed anything; nothing is
    /// written if it did not.
    async fn update_blob<T, F>(&self, key: &str, mut mutate: F) -> Result<(T, bool), ArenaError>
    where
        T: Serialize + DeserializeOwned + Default + Send + Sync,
        F: FnMut(&mut T) -> bool + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let (mut value, version) = load_json::<T>(self.store.as_ref(), key)
                .await?
                .unwrap_or_default();
            if !mutate(&mut value) {
                return Ok((value, false));
            }
            let payload = serde_json::to_vec(&value)?;
            if self
                .store
                .save_if_version(key, version, &payload)
                .await?
                .is_some()
            {
                return Ok((value, true));
            }
            debug!(key, attempt, "Arena record changed underneath, retrying");
        }
        Err(ArenaError::Contended {
            key: key.to_owned(),
        })
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use futures::future::join_all;
    use worldsync_core::ChannelBroadcaster;
    use worldsync_core::broadcast::drain;
    use worldsync_db::{CounterHit, DbError, MemoryStore};
    use worldsync_types::{LeaseHolder, OwnerId, RewardTier, VersionedBlob};

    use super::*;
    use crate::presence::FixedPresence;

    struct Harness {
        store: Arc<MemoryStore>,
        broadcaster: Arc<ChannelBroadcaster>,
        presence: Arc<FixedPresence>,
        arena: Arc<Arena>,
    }

    fn one_template(base_amount: i64) -> ArenaConfig {
        ArenaConfig {
            hp_scale_per_participant: Decimal::ZERO,
            templates: vec![ResourceTemplate {
                id: "hydra".to_owned(),
                name: "The Hydra".to_owned(),
                base_level: 10,
                base_amount,
            }],
            ..ArenaConfig::default()
        }
    }

    fn harness(config: ArenaConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let presence = Arc::new(FixedPresence::new(3));
        let arena = Arc::new(Arena::new(
            store.clone(),
            broadcaster.clone(),
            presence.clone(),
            config,
        ));
        Harness {
            store,
            broadcaster,
            presence,
            arena,
        }
    }

    async fn spawn(h: &Harness) -> ContestedResource {
        match h.arena.check_spawn_eligibility(Utc::now()).await.unwrap() {
            SpawnOutcome::Spawned(resource) => resource,
            other => panic!("expected a spawn, got {other:?}"),
        }
    }

    fn who(name: &str) -> ContributorId {
        ContributorId::new(name)
    }

    #[tokio::test]
    async fn spawn_requires_participants_and_a_free_slot() {
        let h = harness(one_template(1000));
        h.presence.set_participants(2);
        assert_eq!(
            h.arena.check_spawn_eligibility(Utc::now()).await.unwrap(),
            SpawnOutcome::TooFewParticipants {
                participants: 2,
                required: 3
            }
        );

        h.presence.set_participants(3);
        let resource = spawn(&h).await;
        assert_eq!(resource.status, ResourceStatus::Active);
        assert_eq!(resource.max_amount, 1000);
        assert_eq!(
            h.arena.check_spawn_eligibility(Utc::now()).await.unwrap(),
            SpawnOutcome::AlreadyActive(resource.id)
        );
    }

    #[tokio::test]
    async fn hp_scales_with_participants_and_level_with_presence() {
        let h = harness(ArenaConfig {
            hp_scale_per_participant: Decimal::new(15, 2),
            ..one_template(1000)
        });
        h.presence.set_participants(10);
        h.presence.set_average_level(25);
        let resource = spawn(&h).await;
        assert_eq!(resource.max_amount, 2500);
        assert_eq!(resource.level, 25);
        assert_eq!(h.store.read_counter(&keys::hp(resource.id)).await.unwrap(), Some(2500));
    }

    #[tokio::test]
    async fn concurrent_spawners_produce_one_encounter() {
        let h = harness(one_template(1000));
        let others: Vec<Arena> = (0..4)
            .map(|_| {
                Arena::new(
                    h.store.clone(),
                    h.broadcaster.clone(),
                    h.presence.clone(),
                    one_template(1000),
                )
            })
            .collect();
        let now = Utc::now();
        let outcomes = join_all(others.iter().map(|a| a.check_spawn_eligibility(now))).await;
        let spawned = outcomes
            .into_iter()
            .filter(|o| matches!(o, Ok(SpawnOutcome::Spawned(_))))
            .count();
        assert_eq!(spawned, 1);
    }

    #[tokio::test]
    async fn concurrent_hits_are_all_counted() {
        let h = harness(one_template(1000));
        let id = spawn(&h).await.id;
        let now = Utc::now();

        let hits = (0..50).map(|i| {
            let arena = h.arena.clone();
            tokio::spawn(async move {
                arena
                    .record_damage(id, &who(&format!("p{}", i % 5)), 10, now)
                    .await
                    .unwrap()
            })
        });
        for joined in join_all(hits).await {
            joined.unwrap();
        }

        let status = h.arena.status(id, now).await.unwrap();
        assert_eq!(status.current_amount, 500);
        let board = h.arena.leaderboard(id).await.unwrap();
        assert_eq!(board.len(), 5);
        assert!(board.iter().all(|c| c.total_damage == 100));
        // Ties ordered by contributor id.
        assert_eq!(board.first().unwrap().contributor_id, who("p0"));
    }

    #[tokio::test]
    async fn overkill_clamps_and_settles_on_capped_shares() {
        let h = harness(one_template(1000));
        let mut rx = h.broadcaster.subscribe();
        let resource = spawn(&h).await;
        let id = resource.id;
        let now = Utc::now();

        let hits = [("ana", 400), ("bo", 350), ("cy", 260)].map(|(name, amount)| {
            let arena = h.arena.clone();
            tokio::spawn(async move {
                arena
                    .record_damage(id, &who(name), amount, now)
                    .await
                    .unwrap()
            })
        });
        let remaining: Vec<i64> = join_all(hits)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(remaining.iter().all(|r| *r >= 0));
        assert!(remaining.contains(&0));

        let status = h.arena.status(resource.id, now).await.unwrap();
        assert_eq!(status.status, ResourceStatus::Depleted);
        assert_eq!(status.current_amount, 0);

        let board = h.arena.leaderboard(resource.id).await.unwrap();
        let damage: Vec<i64> = board.iter().map(|c| c.total_damage).collect();
        assert_eq!(damage, vec![400, 350, 260]);

        let record = h.arena.settle_rewards(resource.id, now).await.unwrap();
        let tiers: Vec<RewardTier> = record.payouts.iter().map(|p| p.tier).collect();
        assert_eq!(tiers, vec![RewardTier::Mvp, RewardTier::Top3, RewardTier::Top3]);
        let share_sum: Decimal = record.payouts.iter().map(|p| p.contribution).sum();
        assert!(share_sum <= Decimal::ONE);

        let depleted = drain(&mut rx)
            .into_iter()
            .filter(|a| matches!(a, Announcement::ResourceDepleted { .. }))
            .count();
        assert_eq!(depleted, 1);
    }

    #[tokio::test]
    async fn settlement_pays_exactly_once() {
        let h = harness(one_template(100));
        let resource = spawn(&h).await;
        let now = Utc::now();
        h.arena.record_damage(resource.id, &who("ana"), 60, now).await.unwrap();

        assert!(matches!(
            h.arena.settle_rewards(resource.id, now).await,
            Err(ArenaError::NotDepleted {
                status: ResourceStatus::Active,
                ..
            })
        ));

        h.arena.record_damage(resource.id, &who("bo"), 60, now).await.unwrap();
        let first = h.arena.settle_rewards(resource.id, now).await.unwrap();
        let xp_after_first = h.store.ledger_totals(keys::XP_LEDGER).await.unwrap();

        // A second arena instance has no local state to lean on.
        let other = Arena::new(
            h.store.clone(),
            h.broadcaster.clone(),
            h.presence.clone(),
            one_template(100),
        );
        let second = other.settle_rewards(resource.id, now).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.ledger_totals(keys::XP_LEDGER).await.unwrap(), xp_after_first);
        assert_eq!(xp_after_first.get("ana"), Some(&(500 * 10 * 3)));
        assert_eq!(xp_after_first.get("bo"), Some(&(500 * 10 * 2)));
    }

    #[tokio::test]
    async fn hits_after_depletion_are_not_credited() {
        let h = harness(one_template(100));
        let resource = spawn(&h).await;
        let now = Utc::now();
        assert_eq!(
            h.arena.record_damage(resource.id, &who("ana"), 150, now).await.unwrap(),
            0
        );
        assert_eq!(
            h.arena.record_damage(resource.id, &who("bo"), 30, now).await.unwrap(),
            0
        );
        let board = h.arena.leaderboard(resource.id).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board.first().unwrap().total_damage, 150);
    }

    #[tokio::test]
    async fn each_phase_is_announced_once() {
        let h = harness(one_template(1000));
        let mut rx = h.broadcaster.subscribe();
        let resource = spawn(&h).await;
        let now = Utc::now();

        h.arena.record_damage(resource.id, &who("ana"), 400, now).await.unwrap();
        for _ in 0..3 {
            assert_eq!(h.arena.status(resource.id, now).await.unwrap().phase, 2);
        }
        h.arena.record_damage(resource.id, &who("ana"), 350, now).await.unwrap();
        assert_eq!(h.arena.status(resource.id, now).await.unwrap().phase, 3);

        // A fresh process has no local cache; the store claim still holds.
        let other = Arena::new(
            h.store.clone(),
            h.broadcaster.clone(),
            h.presence.clone(),
            one_template(1000),
        );
        other.status(resource.id, now).await.unwrap();
        h.arena.status(resource.id, now).await.unwrap();

        let phases: Vec<u8> = drain(&mut rx)
            .into_iter()
            .filter_map(|a| match a {
                Announcement::PhaseEntered { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![2, 3]);
    }

    #[tokio::test]
    async fn expired_resource_frees_the_slot() {
        let h = harness(one_template(1000));
        let mut rx = h.broadcaster.subscribe();
        let resource = spawn(&h).await;
        let later = resource.expires_at + TimeDelta::seconds(1);

        assert!(matches!(
            h.arena.record_damage(resource.id, &who("ana"), 10, later).await,
            Err(ArenaError::Expired { .. })
        ));
        assert_eq!(
            h.arena.status(resource.id, later).await.unwrap().status,
            ResourceStatus::Expired
        );
        h.arena.status(resource.id, later).await.unwrap();

        let next = h.arena.check_spawn_eligibility(later).await.unwrap();
        assert!(matches!(next, SpawnOutcome::Spawned(ref r) if r.id != resource.id));

        let expired = drain(&mut rx)
            .into_iter()
            .filter(|a| matches!(a, Announcement::ResourceExpired { .. }))
            .count();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn depleted_template_waits_out_its_cooldown() {
        let h = harness(one_template(100));
        let resource = spawn(&h).await;
        let now = Utc::now();
        h.arena.record_damage(resource.id, &who("ana"), 100, now).await.unwrap();

        assert_eq!(
            h.arena.check_spawn_eligibility(now).await.unwrap(),
            SpawnOutcome::AllOnCooldown
        );
        let after = now + h.arena.config().respawn_cooldown() + TimeDelta::seconds(1);
        assert!(matches!(
            h.arena.check_spawn_eligibility(after).await.unwrap(),
            SpawnOutcome::Spawned(_)
        ));
    }

    #[tokio::test]
    async fn bad_hits_are_rejected() {
        let h = harness(one_template(100));
        let resource = spawn(&h).await;
        assert!(matches!(
            h.arena.record_damage(resource.id, &who("ana"), 0, Utc::now()).await,
            Err(ArenaError::InvalidDamage { amount: 0 })
        ));
        assert!(matches!(
            h.arena.record_damage(ResourceId::new(), &who("ana"), 5, Utc::now()).await,
            Err(ArenaError::NotFound { .. })
        ));
    }

    /// Delegates to a [`MemoryStore`]. Hits from `held` are applied, then
    /// parked until `gate` hands out a permit; settlement writes fail while
    /// `fail_settlement` is set.
    struct GatedStore {
        inner: MemoryStore,
        held: Option<String>,
        gate: tokio::sync::Semaphore,
        fail_settlement: std::sync::atomic::AtomicBool,
    }

    impl GatedStore {
        fn new(inner: &MemoryStore, held: Option<&str>) -> Self {
            Self {
                inner: inner.clone(),
                held: held.map(str::to_owned),
                gate: tokio::sync::Semaphore::new(0),
                fail_settlement: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl StateStore for GatedStore {
        async fn get_version(&self, key: &str) -> Result<i64, DbError> {
            self.inner.get_version(key).await
        }
        async fn load(&self, key: &str) -> Result<Option<VersionedBlob>, DbError> {
            self.inner.load(key).await
        }
        async fn save(&self, key: &str, payload: &[u8]) -> Result<i64, DbError> {
            self.inner.save(key, payload).await
        }
        async fn save_if_version(
            &self,
            key: &str,
            expected: i64,
            payload: &[u8],
        ) -> Result<Option<i64>, DbError> {
            self.inner.save_if_version(key, expected, payload).await
        }
        async fn atomic_add(&self, counter_id: &str, delta: i64) -> Result<i64, DbError> {
            self.inner.atomic_add(counter_id, delta).await
        }
        async fn read_counter(&self, counter_id: &str) -> Result<Option<i64>, DbError> {
            self.inner.read_counter(counter_id).await
        }
        async fn ledger_add(&self, ledger_id: &str, member: &str, delta: i64) -> Result<i64, DbError> {
            self.inner.ledger_add(ledger_id, member, delta).await
        }
        async fn ledger_totals(&self, ledger_id: &str) -> Result<BTreeMap<String, i64>, DbError> {
            self.inner.ledger_totals(ledger_id).await
        }
        async fn record_hit(
            &self,
            counter_id: &str,
            ledger_id: &str,
            member: &str,
            amount: i64,
        ) -> Result<CounterHit, DbError> {
            let hit = self.inner.record_hit(counter_id, ledger_id, member, amount).await?;
            if self.held.as_deref() == Some(member) {
                self.gate.acquire().await.unwrap().forget();
            }
            Ok(hit)
        }
        async fn put_if_absent(&self, key: &str, payload: &[u8]) -> Result<bool, DbError> {
            self.inner.put_if_absent(key, payload).await
        }
        async fn put_if_absent_with_credits(
            &self,
            key: &str,
            payload: &[u8],
            credits: &[LedgerCredit],
        ) -> Result<bool, DbError> {
            if self.fail_settlement.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DbError::Unavailable("settlement write dropped".to_owned()));
            }
            self.inner.put_if_absent_with_credits(key, payload, credits).await
        }
        async fn load_marker(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
            self.inner.load_marker(key).await
        }
        async fn acquire_lease(&self, role: &str, owner: &OwnerId, ttl: Duration) -> Result<bool, DbError> {
            self.inner.acquire_lease(role, owner, ttl).await
        }
        async fn renew_lease(&self, role: &str, owner: &OwnerId, ttl: Duration) -> Result<bool, DbError> {
            self.inner.renew_lease(role, owner, ttl).await
        }
        async fn release_lease(&self, role: &str, owner: &OwnerId) -> Result<bool, DbError> {
            self.inner.release_lease(role, owner).await
        }
        async fn lease_holder(&self, role: &str) -> Result<Option<LeaseHolder>, DbError> {
            self.inner.lease_holder(role).await
        }
    }

    fn gated_arena(h: &Harness, store: Arc<GatedStore>) -> Arc<Arena> {
        Arc::new(Arena::new(
            store,
            h.broadcaster.clone(),
            h.presence.clone(),
            h.arena.config().clone(),
        ))
    }

    #[tokio::test]
    async fn depletion_settles_without_a_separate_call() {
        let h = harness(one_template(100));
        let mut rx = h.broadcaster.subscribe();
        let id = spawn(&h).await.id;
        let now = Utc::now();

        h.arena.record_damage(id, &who("ana"), 60, now).await.unwrap();
        assert!(h.store.load_marker(&keys::settled(id)).await.unwrap().is_none());
        h.arena.record_damage(id, &who("bo"), 60, now).await.unwrap();

        assert!(h.store.load_marker(&keys::settled(id)).await.unwrap().is_some());
        let xp = h.store.ledger_totals(keys::XP_LEDGER).await.unwrap();
        assert_eq!(xp.get("ana"), Some(&(500 * 10 * 3)));
        assert_eq!(xp.get("bo"), Some(&(500 * 10 * 2)));
        let settled = drain(&mut rx)
            .into_iter()
            .filter(|a| matches!(a, Announcement::RewardsSettled { .. }))
            .count();
        assert_eq!(settled, 1);
    }

    #[tokio::test]
    async fn settlement_includes_hits_still_in_flight() {
        let h = harness(one_template(100));
        let gated = Arc::new(GatedStore::new(&h.store, Some("slow")));
        let arena = gated_arena(&h, gated.clone());
        let id = spawn(&h).await.id;
        let now = Utc::now();

        let slow = {
            let arena = arena.clone();
            tokio::spawn(async move { arena.record_damage(id, &who("slow"), 60, now).await })
        };
        while h.store.read_counter(&keys::hp(id)).await.unwrap() != Some(40) {
            tokio::task::yield_now().await;
        }

        // The slow hit has landed but its caller has not returned yet.
        assert_eq!(arena.record_damage(id, &who("fast"), 60, now).await.unwrap(), 0);
        let record = h.arena.settle_rewards(id, now).await.unwrap();
        let paid: Vec<&str> = record
            .payouts
            .iter()
            .map(|p| p.contributor_id.as_str())
            .collect();
        assert_eq!(paid, vec!["fast", "slow"]);

        gated.gate.add_permits(1);
        assert_eq!(slow.await.unwrap().unwrap(), 40);
    }

    #[tokio::test]
    async fn failed_settlement_is_retried_by_the_next_spawn_check() {
        let h = harness(one_template(100));
        let gated = Arc::new(GatedStore::new(&h.store, None));
        let arena = gated_arena(&h, gated.clone());
        let id = spawn(&h).await.id;
        let now = Utc::now();

        gated.fail_settlement.store(true, std::sync::atomic::Ordering::SeqCst);
        arena.record_damage(id, &who("ana"), 60, now).await.unwrap();
        // The hit itself succeeds even though settling it does not.
        assert_eq!(arena.record_damage(id, &who("bo"), 60, now).await.unwrap(), 0);
        assert!(h.store.load_marker(&keys::settled(id)).await.unwrap().is_none());
        assert!(h.store.ledger_totals(keys::XP_LEDGER).await.unwrap().is_empty());
        assert!(h.store.ledger_totals(keys::GOLD_LEDGER).await.unwrap().is_empty());
        assert!(arena.check_spawn_eligibility(now).await.is_err());

        gated.fail_settlement.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(
            arena.check_spawn_eligibility(now).await.unwrap(),
            SpawnOutcome::AllOnCooldown
        );
        let xp = h.store.ledger_totals(keys::XP_LEDGER).await.unwrap();
        assert_eq!(xp.get("ana"), Some(&(500 * 10 * 3)));

        arena.check_spawn_eligibility(now).await.unwrap();
        arena.settle_rewards(id, now).await.unwrap();
        assert_eq!(h.store.ledger_totals(keys::XP_LEDGER).await.unwrap(), xp);
    }
}
