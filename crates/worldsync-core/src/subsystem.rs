//! Authority-owned state persisted alongside the population.
//!
//! A [`Subsystem`] is a piece of state only the simulation authority
//! writes. The loop restores every registered subsystem at startup and
//! flushes it with the same dirty check as the population. There is no
//! merge: on a version conflict the authority's copy wins.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::stepper::LifecycleEvent;

/// State persisted under its own key by the authority.
pub trait Subsystem: Send + Sync {
    /// Store key of the snapshot.
    fn key(&self) -> &str;

    /// Encode the current state.
    ///
    /// # Errors
    ///
    /// Returns the encoder's error.
    fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error>;

    /// Replace the current state with a stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns the decoder's error; the current state is left untouched.
    fn restore(&self, payload: &[u8]) -> Result<(), serde_json::Error>;
}

/// A lifecycle event with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// When the step that produced it ran.
    pub at: DateTime<Utc>,
    /// What happened.
    pub event: LifecycleEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LogState {
    births: u64,
    deaths: u64,
    respawns: u64,
    releases: u64,
    recent: VecDeque<LifecycleRecord>,
}

/// Running totals and a bounded tail of lifecycle events.
#[derive(Debug)]
pub struct LifecycleLog {
    key: String,
    capacity: usize,
    state: Mutex<LogState>,
}

/// Totals kept by a [`LifecycleLog`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleTotals {
    /// Children born.
    pub births: u64,
    /// Deaths, permanent or not.
    pub deaths: u64,
    /// Respawns.
    pub respawns: u64,
    /// Prison releases.
    pub releases: u64,
}

impl LifecycleLog {
    /// Store key used by default.
    pub const DEFAULT_KEY: &'static str = "world:lifecycle_log";

    /// Create an empty log keeping the last `capacity` events.
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            capacity,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Append events produced at `at`.
    pub fn record(&self, events: &[LifecycleEvent], at: DateTime<Utc>) {
        let mut state = self.state.lock();
        for event in events {
            match event {
                LifecycleEvent::Born { .. } => state.births = state.births.saturating_add(1),
                LifecycleEvent::Died { .. } => state.deaths = state.deaths.saturating_add(1),
                LifecycleEvent::Respawned { .. } => {
                    state.respawns = state.respawns.saturating_add(1);
                }
                LifecycleEvent::Released { .. } => {
                    state.releases = state.releases.saturating_add(1);
                }
            }
            state.recent.push_back(LifecycleRecord {
                at,
                event: event.clone(),
            });
            while state.recent.len() > self.capacity {
                state.recent.pop_front();
            }
        }
    }

    /// Running totals.
    pub fn totals(&self) -> LifecycleTotals {
        let state = self.state.lock();
        LifecycleTotals {
            births: state.births,
            deaths: state.deaths,
            respawns: state.respawns,
            releases: state.releases,
        }
    }

    /// The retained tail, oldest first.
    pub fn recent(&self) -> Vec<LifecycleRecord> {
        self.state.lock().recent.iter().cloned().collect()
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEY, 500)
    }
}

impl Subsystem for LifecycleLog {
    fn key(&self) -> &str {
        &self.key
    }

    fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&*self.state.lock())
    }

    fn restore(&self, payload: &[u8]) -> Result<(), serde_json::Error> {
        let restored: LogState = serde_json::from_slice(payload)?;
        *self.state.lock() = restored;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use worldsync_types::AgentId;

    use super::*;

    fn died() -> LifecycleEvent {
        LifecycleEvent::Died {
            agent_id: AgentId::new(),
            name: "Ragnar".to_owned(),
            permanent: false,
        }
    }

    #[test]
    fn log_is_bounded_but_totals_are_not() {
        let log = LifecycleLog::new("log", 2);
        log.record(&[died(), died(), died()], Utc::now());
        assert_eq!(log.totals().deaths, 3);
        assert_eq!(log.recent().len(), 2);
    }

    #[test]
    fn snapshot_restores_into_a_fresh_log() {
        let log = LifecycleLog::default();
        log.record(&[died()], Utc::now());
        let payload = log.snapshot().unwrap();

        let fresh = LifecycleLog::default();
        fresh.restore(&payload).unwrap();
        assert_eq!(fresh.totals(), log.totals());
        assert!(fresh.restore(b"garbage").is_err());
        assert_eq!(fresh.totals().deaths, 1);
    }
}
