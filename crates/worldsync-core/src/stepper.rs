//! Per-tick evolution of the agent population.
//!
//! The loop hands the whole population to an [`AgentStepper`] once per tick
//! while it holds the lease. [`LifecycleStepper`] is the built-in one: it
//! fires due pending events, retires agents that reach the end of their
//! lifespan, and respawns agents whose death was not permanent.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use worldsync_types::{Agent, AgentId, Capability, PendingEventKind};

use crate::config::TimingConfig;

/// Something that happened to an agent during a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A child was born.
    Born {
        /// The newborn.
        agent_id: AgentId,
        /// Newborn's name.
        name: String,
        /// The carrying parent.
        parent: AgentId,
    },
    /// An agent died.
    Died {
        /// The deceased.
        agent_id: AgentId,
        /// Agent's name.
        name: String,
        /// Whether the death is permanent.
        permanent: bool,
    },
    /// A dead agent came back.
    Respawned {
        /// The agent.
        agent_id: AgentId,
        /// Agent's name.
        name: String,
    },
    /// An agent left prison.
    Released {
        /// The agent.
        agent_id: AgentId,
        /// Agent's name.
        name: String,
    },
}

/// Advances the population by one tick.
pub trait AgentStepper: Send + Sync {
    /// Mutate `agents` for the tick at `now` and report what happened.
    fn step(&self, agents: &mut Vec<Agent>, now: DateTime<Utc>) -> Vec<LifecycleEvent>;

    /// Post-load fixups run once after the population is loaded.
    fn on_load(&self, _agents: &mut Vec<Agent>, _now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        Vec::new()
    }
}

/// Built-in stepper for births, releases, old age and respawns.
#[derive(Debug)]
pub struct LifecycleStepper {
    respawn_delay: TimeDelta,
    load_respawn_delay: TimeDelta,
    lifespan: Option<TimeDelta>,
    /// Agents found dead at load time respawn on a shorter clock.
    fast_respawn: Mutex<HashMap<AgentId, DateTime<Utc>>>,
}

impl LifecycleStepper {
    /// Create a stepper with explicit delays. `lifespan: None` disables
    /// death by old age.
    pub fn new(
        respawn_delay: TimeDelta,
        load_respawn_delay: TimeDelta,
        lifespan: Option<TimeDelta>,
    ) -> Self {
        Self {
            respawn_delay,
            load_respawn_delay,
            lifespan,
            fast_respawn: Mutex::new(HashMap::new()),
        }
    }

    /// Create a stepper from the `timing` config section.
    pub fn from_config(timing: &TimingConfig) -> Self {
        let lifespan = (timing.lifespan_days > 0).then(|| days(timing.lifespan_days));
        Self::new(
            minutes(timing.respawn_delay_minutes),
            minutes(timing.load_respawn_delay_minutes),
            lifespan,
        )
    }

    fn respawn_due(&self, agent: &Agent, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(due) = self.fast_respawn.lock().get(&agent.id) {
            return *due;
        }
        let died_at = agent.lifecycle.died_at.unwrap_or(now);
        died_at.checked_add_signed(self.respawn_delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn may_respawn(agent: &Agent) -> bool {
        agent.lifecycle.is_dead && !agent.lifecycle.is_terminal() && agent.can(Capability::Respawns)
    }
}

impl AgentStepper for LifecycleStepper {
    fn step(&self, agents: &mut Vec<Agent>, now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let mut newborns = Vec::new();

        for agent in agents.iter_mut() {
            let due = agent
                .lifecycle
                .pending_event
                .as_ref()
                .is_some_and(|e| e.due_at <= now);
            if let Some(event) = due.then(|| agent.lifecycle.pending_event.take()).flatten() {
                if agent.is_alive() {
                    fire(agent, event.kind, now, &mut events, &mut newborns);
                } else {
                    debug!(agent = %agent.id, kind = ?event.kind, "Dropping event of dead agent");
                }
            }

            let past_lifespan = self
                .lifespan
                .is_some_and(|l| now.signed_duration_since(agent.lifecycle.born_at) >= l);
            if agent.is_alive() && agent.can(Capability::Ages) && past_lifespan {
                agent.lifecycle.is_dead = true;
                agent.lifecycle.aged_death = true;
                agent.lifecycle.died_at = Some(now);
                agent.lifecycle.pending_event = None;
                events.push(LifecycleEvent::Died {
                    agent_id: agent.id,
                    name: agent.name.clone(),
                    permanent: true,
                });
            }

            if Self::may_respawn(agent) && self.respawn_due(agent, now) <= now {
                self.fast_respawn.lock().remove(&agent.id);
                respawn(agent);
                events.push(LifecycleEvent::Respawned {
                    agent_id: agent.id,
                    name: agent.name.clone(),
                });
            }
        }

        // Entries for agents that left the population or can no longer
        // respawn would otherwise sit in the queue forever.
        self.fast_respawn.lock().retain(|id, _| {
            agents
                .iter()
                .find(|a| a.id == *id)
                .is_some_and(Self::may_respawn)
        });

        agents.extend(newborns);
        events
    }

    fn on_load(&self, agents: &mut Vec<Agent>, now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let due = now
            .checked_add_signed(self.load_respawn_delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut queue = self.fast_respawn.lock();
        queue.clear();
        for agent in agents.iter().filter(|a| Self::may_respawn(a)) {
            queue.insert(agent.id, due);
        }
        let dead = agents.iter().filter(|a| !a.is_alive()).count();
        info!(
            dead,
            total = agents.len(),
            queued = queue.len(),
            "Queued dead agents for fast respawn"
        );
        Vec::new()
    }
}

fn fire(
    agent: &mut Agent,
    kind: PendingEventKind,
    now: DateTime<Utc>,
    events: &mut Vec<LifecycleEvent>,
    newborns: &mut Vec<Agent>,
) {
    match kind {
        PendingEventKind::Birth => {
            if !agent.can(Capability::Reproduces) {
                return;
            }
            let mut child = Agent::new(
                format!("{}'s child", agent.name),
                agent.template_id.clone(),
                agent.location.clone(),
                now,
            )
            .with_capabilities(agent.capabilities.iter().copied());
            child.relationships.insert(agent.id, 100);
            agent.relationships.insert(child.id, 100);
            events.push(LifecycleEvent::Born {
                agent_id: child.id,
                name: child.name.clone(),
                parent: agent.id,
            });
            newborns.push(child);
        }
        PendingEventKind::Release => {
            agent.imprisoned_until = None;
            events.push(LifecycleEvent::Released {
                agent_id: agent.id,
                name: agent.name.clone(),
            });
        }
    }
}

fn respawn(agent: &mut Agent) {
    agent.lifecycle.is_dead = false;
    agent.lifecycle.died_at = None;
    // Old records can carry a zeroed max HP; floor it by level.
    let floor = i64::from(agent.vitals.level)
        .saturating_mul(10)
        .saturating_add(20);
    agent.vitals.max_hp = agent.vitals.max_hp.max(floor);
    agent.vitals.hp = agent.vitals.max_hp;
}

fn minutes(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .unwrap_or(TimeDelta::MAX)
}

fn days(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_days)
        .unwrap_or(TimeDelta::MAX)
}
