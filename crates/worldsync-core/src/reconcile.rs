//! Reload-and-merge of shared state an external writer advanced.
//!
//! Interactive sessions write the population blob too, and they may write
//! from a copy loaded long ago. Before the authority persists, it asks the
//! [`Reconciler`] whether the stored version moved past the one it last
//! saw. If so it reloads the stored payload and re-applies the fields only
//! the authority may change, through a [`MergePolicy`]. Everything else is
//! last-writer-wins: the reloaded value is kept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use worldsync_db::StateStore;
use worldsync_types::{Agent, AgentId};

use crate::error::ReconcileError;

/// What a merge changed in the reloaded state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Agents whose pending event was put back.
    pub restored_events: Vec<AgentId>,
    /// Restored events whose due time already passed; the next step fires
    /// them once.
    pub overdue_events: Vec<AgentId>,
    /// Agents whose stale pending event was cleared because the authority
    /// already fired it.
    pub consumed_events: Vec<AgentId>,
    /// Agents whose pending event was dropped because the reloaded record
    /// shows them dead.
    pub dropped_on_dead: Vec<AgentId>,
    /// Agents whose permanent-death flags were put back.
    pub restored_deaths: Vec<AgentId>,
    /// Agents that existed only locally and were appended.
    pub appended: Vec<AgentId>,
    /// The stored payload could not be decoded and was ignored.
    pub undecodable: bool,
}

impl MergeReport {
    /// Whether the merge changed nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The result of a reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    /// Merged state to adopt.
    pub state: T,
    /// Stored version the merged state is based on; the next optimistic
    /// write must expect it.
    pub version: i64,
    /// What the merge did.
    pub report: MergeReport,
}

/// How authority-only fields survive a reload.
///
/// `capture` runs on the local state before the reload; `apply` receives
/// the captured value and the freshly decoded stored state.
pub trait MergePolicy<T>: Send + Sync {
    /// Whatever the policy needs to remember from the local state.
    type Captured: Send;

    /// Remember the guarded fields of `local`.
    fn capture(&self, local: &T) -> Self::Captured;

    /// Re-apply captured fields onto `reloaded`.
    fn apply(
        &self,
        captured: Self::Captured,
        reloaded: &mut T,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    );
}

/// Guards the authority-only fields of the agent population.
///
/// Guarded, in order of application:
///
/// 1. `lifecycle.pending_event` is authority-owned. The local value wins in
///    both directions: a lost event is restored, an event the authority
///    already fired is cleared so it cannot fire twice. An event is not
///    restored onto an agent the reloaded record shows dead.
/// 2. Permanent-death flags (`aged_death`, `perma_dead`) only ever turn on.
///    If the authority set them they are restored together with `is_dead`
///    and `died_at`.
/// 3. Agents present locally but missing from the reloaded list (births
///    since the last flush) are appended.
///
/// Every other field keeps its reloaded value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleMergePolicy;

impl MergePolicy<Vec<Agent>> for LifecycleMergePolicy {
    // Births need the whole record, so the whole population is captured.
    type Captured = Vec<Agent>;

    fn capture(&self, local: &Vec<Agent>) -> Self::Captured {
        local.clone()
    }

    fn apply(
        &self,
        captured: Self::Captured,
        reloaded: &mut Vec<Agent>,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) {
        let index: HashMap<AgentId, usize> = reloaded
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id, i))
            .collect();
        let mut seen = HashSet::with_capacity(captured.len());

        for local in captured {
            if !seen.insert(local.id) {
                continue;
            }
            let Some(remote) = index.get(&local.id).and_then(|&i| reloaded.get_mut(i)) else {
                report.appended.push(local.id);
                reloaded.push(local);
                continue;
            };

            if local.lifecycle.is_terminal() && !remote.lifecycle.is_terminal() {
                remote.lifecycle.aged_death |= local.lifecycle.aged_death;
                remote.lifecycle.perma_dead |= local.lifecycle.perma_dead;
                remote.lifecycle.is_dead = true;
                remote.lifecycle.died_at = local.lifecycle.died_at.or(remote.lifecycle.died_at);
                report.restored_deaths.push(local.id);
            }

            let remote_event = remote.lifecycle.pending_event.clone();
            match (local.lifecycle.pending_event, remote_event) {
                (Some(event), remote_event) if remote_event.as_ref() != Some(&event) => {
                    if remote.lifecycle.is_dead {
                        remote.lifecycle.pending_event = None;
                        report.dropped_on_dead.push(local.id);
                    } else {
                        if event.due_at <= now {
                            report.overdue_events.push(local.id);
                        }
                        remote.lifecycle.pending_event = Some(event);
                        report.restored_events.push(local.id);
                    }
                }
                (None, Some(_)) => {
                    remote.lifecycle.pending_event = None;
                    report.consumed_events.push(local.id);
                }
                _ => {}
            }
        }
    }
}

/// Guards nothing: the reloaded state is adopted as-is.
///
/// Used when this process lost authority for a while and its own copy of
/// the authority-only fields can no longer be trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl<T> MergePolicy<T> for LastWriterWins {
    type Captured = ();

    fn capture(&self, _local: &T) -> Self::Captured {}

    fn apply(&self, (): (), _reloaded: &mut T, _now: DateTime<Utc>, _report: &mut MergeReport) {}
}

/// Compares stored versions and performs reload-and-merge.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StateStore>,
}

impl Reconciler {
    /// Create a reconciler over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Whether the stored version of `key` differs from `last_seen`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if the version cannot be read.
    pub async fn needs_reconciliation(
        &self,
        key: &str,
        last_seen: i64,
    ) -> Result<bool, ReconcileError> {
        let current = self.store.get_version(key).await?;
        Ok(current != last_seen)
    }

    /// Capture guarded fields from `local`, reload `key`, and re-apply them.
    ///
    /// A missing blob keeps `local` at version 0. An undecodable blob keeps
    /// `local` and adopts the stored version so the next optimistic write
    /// replaces the bad payload.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if the reload fails.
    pub async fn reconcile_and_merge<T, P>(
        &self,
        key: &str,
        local: T,
        policy: &P,
        now: DateTime<Utc>,
    ) -> Result<Reconciled<T>, ReconcileError>
    where
        T: Serialize + DeserializeOwned + Send,
        P: MergePolicy<T>,
    {
        let captured = policy.capture(&local);
        let mut report = MergeReport::default();

        let Some(blob) = self.store.load(key).await? else {
            return Ok(Reconciled {
                state: local,
                version: 0,
                report,
            });
        };

        let mut reloaded: T = match serde_json::from_slice(&blob.payload) {
            Ok(state) => state,
            Err(e) => {
                warn!(key, version = blob.version, error = %e, "Stored payload undecodable, keeping local state");
                report.undecodable = true;
                return Ok(Reconciled {
                    state: local,
                    version: blob.version,
                    report,
                });
            }
        };

        policy.apply(captured, &mut reloaded, now, &mut report);
        if !report.is_empty() {
            info!(
                key,
                version = blob.version,
                restored_events = report.restored_events.len(),
                overdue_events = report.overdue_events.len(),
                consumed_events = report.consumed_events.len(),
                dropped_on_dead = report.dropped_on_dead.len(),
                restored_deaths = report.restored_deaths.len(),
                appended = report.appended.len(),
                "Merged external write"
            );
        }
        Ok(Reconciled {
            state: reloaded,
            version: blob.version,
            report,
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}
