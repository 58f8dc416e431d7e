//! The simulation loop.
//!
//! One [`Simulation`] runs per process. It waits for the lease, loads (or
//! bootstraps) the population, then alternates between lease renewal and
//! ticks until shutdown:
//!
//! ```text
//! wait_for_lease --> initialize --> loop {
//!                                     renew timer  -> maintain_lease
//!                                     tick timer   -> step, duties, flush?
//!                                     shutdown     -> final flush, release
//!                                   }
//! ```
//!
//! Every tick and flush is a no-op unless this process currently holds the
//! lease. A flush always asks the [`Reconciler`] first: if an interactive
//! session wrote the population since the last flush, the stored copy is
//! reloaded and the authority's guarded fields are re-applied before the
//! optimistic write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use worldsync_types::{Agent, Announcement};

use crate::catalog::TemplateCatalog;
use crate::config::{TimingConfig, WorldsyncConfig};
use crate::context::SimulationContext;
use crate::duty::Duty;
use crate::error::SimulationError;
use crate::fingerprint::DirtyTracker;
use crate::lease::LeaseManager;
use crate::reconcile::{LastWriterWins, LifecycleMergePolicy, MergePolicy, Reconciler};
use crate::registry::AgentRegistry;
use crate::shutdown::ShutdownSignal;
use crate::stepper::{AgentStepper, LifecycleEvent, LifecycleStepper};
use crate::subsystem::{LifecycleLog, Subsystem};

/// Store key of the agent population blob.
pub const POPULATION_KEY: &str = "world:population";

/// Shortest timer period the loop accepts.
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Where the loop is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Waiting for the lease or loading state.
    Initializing,
    /// Ticking.
    Running,
    /// Final flush and lease release in progress.
    ShuttingDown,
    /// Done.
    Stopped,
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The population was written at `version`.
    Written {
        /// New stored version.
        version: i64,
    },
    /// Nothing changed since the last write.
    Unchanged,
    /// This process does not hold the lease.
    NotAuthoritative,
}

/// Counters collected over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationReport {
    /// Tick timer firings.
    pub ticks: u64,
    /// Ticks skipped because the lease was not held.
    pub idle_ticks: u64,
    /// Population writes.
    pub flushes: u64,
    /// Flushes skipped because nothing changed.
    pub unchanged_flushes: u64,
    /// Reload-and-merge passes.
    pub reconciliations: u64,
    /// Optimistic writes that lost to a concurrent writer.
    pub lost_races: u64,
    /// Times the lease was lost while held.
    pub authority_losses: u64,
    /// Lifecycle events produced by steps.
    pub lifecycle_events: u64,
}

struct ScheduledDuty {
    duty: Arc<dyn Duty>,
    last_run: Option<Instant>,
}

/// The single-authority simulation loop.
pub struct Simulation {
    ctx: SimulationContext,
    timing: TimingConfig,
    population_key: String,
    lease: LeaseManager,
    reconciler: Reconciler,
    tracker: DirtyTracker,
    registry: Arc<AgentRegistry>,
    stepper: Box<dyn AgentStepper>,
    policy: LifecycleMergePolicy,
    catalog: TemplateCatalog,
    lifecycle_log: Arc<LifecycleLog>,
    subsystems: Vec<Arc<dyn Subsystem>>,
    duties: Vec<ScheduledDuty>,
    baselines: HashMap<String, i64>,
    phase: watch::Sender<LoopPhase>,
    tick: u64,
    last_flush: Instant,
    needs_resync: bool,
    report: SimulationReport,
}

impl Simulation {
    /// Build a loop with the built-in stepper, catalog and lifecycle log.
    pub fn new(ctx: SimulationContext, config: &WorldsyncConfig) -> Self {
        let timing = config.timing.clone();
        let lease = LeaseManager::new(
            ctx.store.clone(),
            config.world.role.clone(),
            ctx.owner_id.clone(),
            timing.lease_ttl(),
            timing.lease_renewal(),
        );
        let lifecycle_log = Arc::new(LifecycleLog::default());
        let (phase, _) = watch::channel(LoopPhase::Initializing);
        Self {
            reconciler: Reconciler::new(ctx.store.clone()),
            stepper: Box::new(LifecycleStepper::from_config(&timing)),
            subsystems: vec![lifecycle_log.clone()],
            ctx,
            timing,
            population_key: POPULATION_KEY.to_owned(),
            lease,
            tracker: DirtyTracker::new(),
            registry: Arc::new(AgentRegistry::new()),
            policy: LifecycleMergePolicy,
            catalog: TemplateCatalog::builtin(),
            lifecycle_log,
            duties: Vec::new(),
            baselines: HashMap::new(),
            phase,
            tick: 0,
            last_flush: Instant::now(),
            needs_resync: false,
            report: SimulationReport::default(),
        }
    }

    /// Replace the stepper.
    #[must_use]
    pub fn with_stepper(mut self, stepper: Box<dyn AgentStepper>) -> Self {
        self.stepper = stepper;
        self
    }

    /// Replace the bootstrap catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Persist another authority-owned subsystem.
    #[must_use]
    pub fn with_subsystem(mut self, subsystem: Arc<dyn Subsystem>) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    /// Run `duty` on its own cadence while authoritative.
    #[must_use]
    pub fn with_duty(mut self, duty: Arc<dyn Duty>) -> Self {
        self.duties.push(ScheduledDuty {
            duty,
            last_run: None,
        });
        self
    }

    /// The live population. Readers get consistent snapshots.
    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    /// The lifecycle log subsystem.
    pub fn lifecycle_log(&self) -> Arc<LifecycleLog> {
        self.lifecycle_log.clone()
    }

    /// The lease manager.
    pub const fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    /// Watch the loop phase.
    pub fn subscribe_phase(&self) -> watch::Receiver<LoopPhase> {
        self.phase.subscribe()
    }

    /// Counters so far.
    pub const fn report(&self) -> SimulationReport {
        self.report
    }

    /// Run until `shutdown` fires. Consumes the loop and returns its
    /// counters.
    ///
    /// # Errors
    ///
    /// Returns an error only if loading state after acquiring the lease
    /// fails. The lease is released before returning it.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> Result<SimulationReport, SimulationError> {
        self.set_phase(LoopPhase::Initializing);
        if !self.lease.wait_for_lease(&shutdown).await {
            self.set_phase(LoopPhase::Stopped);
            return Ok(self.report);
        }

        if let Err(e) = self.initialize().await {
            error!(error = %e, "Failed to load world state");
            if let Err(release) = self.lease.release().await {
                warn!(error = %release, "Failed to release lease after load failure");
            }
            self.set_phase(LoopPhase::Stopped);
            return Err(e);
        }

        self.set_phase(LoopPhase::Running);
        info!(
            owner = %self.ctx.owner_id,
            tick_interval = ?self.timing.tick_interval(),
            flush_interval = ?self.timing.flush_interval(),
            "Simulation running"
        );

        let mut ticker = tokio::time::interval(self.timing.tick_interval().max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut renewer = tokio::time::interval(self.lease.renewal_interval().max(MIN_PERIOD));
        renewer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately; the lease was just taken.
        renewer.tick().await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = renewer.tick() => self.maintain_lease().await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shut_down().await;
        Ok(self.report)
    }

    /// Load the population (bootstrapping if there is none), restore
    /// subsystems and run the stepper's load fixups.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::Store`] if the store cannot be read.
    pub async fn initialize(&mut self) -> Result<(), SimulationError> {
        let now = Utc::now();
        let key = self.population_key.clone();

        let (mut agents, bootstrapped) = match self.ctx.store.load(&key).await? {
            Some(blob) => {
                self.baselines.insert(key.clone(), blob.version);
                match serde_json::from_slice::<Vec<Agent>>(&blob.payload) {
                    Ok(agents) if !agents.is_empty() => {
                        self.tracker.record_write(&key, &blob.payload);
                        info!(agents = agents.len(), version = blob.version, "Loaded population");
                        (agents, false)
                    }
                    Ok(_) => {
                        info!(version = blob.version, "Stored population is empty, bootstrapping");
                        (self.catalog.bootstrap(now), true)
                    }
                    Err(e) => {
                        warn!(version = blob.version, error = %e, "Stored population undecodable, bootstrapping");
                        (self.catalog.bootstrap(now), true)
                    }
                }
            }
            None => {
                self.baselines.insert(key.clone(), 0);
                info!("No stored population, bootstrapping");
                (self.catalog.bootstrap(now), true)
            }
        };

        for subsystem in self.subsystems.clone() {
            self.restore_subsystem(subsystem.as_ref()).await?;
        }

        let events = self.stepper.on_load(&mut agents, now);
        self.registry.replace_all(agents);
        self.record_events(&events, now);
        self.last_flush = Instant::now();

        if bootstrapped {
            match self.flush(false).await {
                Ok(outcome) => debug!(?outcome, "Bootstrap population persisted"),
                Err(e) => warn!(error = %e, "Failed to persist bootstrap population, will retry"),
            }
        }
        Ok(())
    }

    /// Advance the world by one tick if this process is authoritative.
    pub async fn tick(&mut self) {
        self.tick = self.tick.saturating_add(1);
        self.report.ticks = self.report.ticks.saturating_add(1);

        if !self.lease.is_authoritative() {
            self.report.idle_ticks = self.report.idle_ticks.saturating_add(1);
            debug!(tick = self.tick, "Not authoritative, tick skipped");
            return;
        }

        if let Err(e) = self.resync_if_needed().await {
            warn!(error = %e, "Resync after regaining the lease failed, tick skipped");
            return;
        }

        let now = Utc::now();
        let stepper = &self.stepper;
        let events = self.registry.mutate_all(|agents| stepper.step(agents, now));
        self.record_events(&events, now);

        self.run_due_duties(now).await;

        if self.last_flush.elapsed() >= self.timing.flush_interval() {
            match self.flush(false).await {
                Ok(_) => self.last_flush = Instant::now(),
                Err(e) => warn!(error = %e, "Flush failed, retrying next tick"),
            }
        }

        let every = self.timing.status_every_ticks;
        if every > 0 && self.tick.checked_rem(every) == Some(0) {
            let (alive, dead) = self.registry.counts();
            let totals = self.lifecycle_log.totals();
            info!(
                tick = self.tick,
                alive,
                dead,
                births = totals.births,
                deaths = totals.deaths,
                flushes = self.report.flushes,
                "World status"
            );
        }
    }

    /// Persist the population and subsystems.
    ///
    /// Reconciles first if the stored version moved. Unless `force` is set
    /// the write is skipped when the payload fingerprint is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::FlushContended`] if every optimistic
    /// attempt lost a race, or any store, reconcile or encode error.
    pub async fn flush(&mut self, force: bool) -> Result<FlushOutcome, SimulationError> {
        if !self.lease.is_authoritative() {
            return Ok(FlushOutcome::NotAuthoritative);
        }

        let key = self.population_key.clone();
        let attempts = self.timing.flush_retries.saturating_add(1);
        let mut outcome = None;

        for attempt in 1..=attempts {
            if self
                .reconciler
                .needs_reconciliation(&key, self.baseline(&key))
                .await?
            {
                let policy = self.policy;
                self.reconcile_population(&policy).await?;
            }

            let payload = serde_json::to_vec(&*self.registry.snapshot())?;
            if !force && !self.tracker.should_write(&key, &payload) {
                self.report.unchanged_flushes = self.report.unchanged_flushes.saturating_add(1);
                debug!(key, "Population unchanged, flush skipped");
                outcome = Some(FlushOutcome::Unchanged);
                break;
            }

            match self
                .ctx
                .store
                .save_if_version(&key, self.baseline(&key), &payload)
                .await?
            {
                Some(version) => {
                    self.tracker.record_write(&key, &payload);
                    self.baselines.insert(key.clone(), version);
                    self.report.flushes = self.report.flushes.saturating_add(1);
                    info!(key, version, bytes = payload.len(), "Population flushed");
                    outcome = Some(FlushOutcome::Written { version });
                    break;
                }
                None => {
                    self.report.lost_races = self.report.lost_races.saturating_add(1);
                    warn!(key, attempt, "Population changed during flush, reconciling again");
                }
            }
        }

        let Some(outcome) = outcome else {
            return Err(SimulationError::FlushContended { key, attempts });
        };

        for subsystem in self.subsystems.clone() {
            if let Err(e) = self.flush_subsystem(subsystem.as_ref(), force).await {
                warn!(key = subsystem.key(), error = %e, "Subsystem flush failed");
            }
        }
        Ok(outcome)
    }

    fn baseline(&self, key: &str) -> i64 {
        self.baselines.get(key).copied().unwrap_or(0)
    }

    fn set_phase(&self, phase: LoopPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!(?phase, "Loop phase changed");
        }
    }

    async fn reconcile_population<P>(&mut self, policy: &P) -> Result<(), SimulationError>
    where
        P: MergePolicy<Vec<Agent>>,
    {
        let key = self.population_key.clone();
        self.report.reconciliations = self.report.reconciliations.saturating_add(1);
        let local = Vec::clone(&self.registry.snapshot());
        let merged = self
            .reconciler
            .reconcile_and_merge(&key, local, policy, Utc::now())
            .await?;
        self.tracker.invalidate(&key);
        self.registry.replace_all(merged.state);
        self.baselines.insert(key, merged.version);
        Ok(())
    }

    /// Resync once after the lease came back. Runs before the first step
    /// and before the final flush, whichever comes first.
    async fn resync_if_needed(&mut self) -> Result<(), SimulationError> {
        if self.needs_resync {
            self.resync().await?;
            self.needs_resync = false;
        }
        Ok(())
    }

    /// Catch up after a period without the lease. Whoever held it in the
    /// meantime owned the guarded fields, so the stored copy wins outright.
    async fn resync(&mut self) -> Result<(), SimulationError> {
        let key = self.population_key.clone();
        if self
            .reconciler
            .needs_reconciliation(&key, self.baseline(&key))
            .await?
        {
            info!(key, "Population moved while the lease was away, adopting stored copy");
            self.reconcile_population(&LastWriterWins).await?;
        }
        for subsystem in self.subsystems.clone() {
            let key = subsystem.key().to_owned();
            let current = self.ctx.store.get_version(&key).await?;
            if current != self.baseline(&key) {
                self.restore_subsystem(subsystem.as_ref()).await?;
            }
        }
        Ok(())
    }

    async fn maintain_lease(&mut self) {
        if self.lease.lease().is_some() {
            if !matches!(self.lease.renew().await, Ok(true)) {
                self.report.authority_losses = self.report.authority_losses.saturating_add(1);
                self.needs_resync = true;
                warn!(role = self.lease.role(), "Authority lost, ticks idle until the lease is back");
            }
            return;
        }

        match self.lease.acquire().await {
            Ok(true) => {
                info!(role = self.lease.role(), "Authority regained, resyncing before the next step");
                self.needs_resync = true;
            }
            Ok(false) => debug!(role = self.lease.role(), "Lease still held elsewhere"),
            Err(e) => debug!(error = %e, "Lease acquire failed"),
        }
    }

    async fn run_due_duties(&mut self, now: DateTime<Utc>) {
        for slot in &mut self.duties {
            let due = slot
                .last_run
                .is_none_or(|at| at.elapsed() >= slot.duty.interval());
            if !due {
                continue;
            }
            slot.last_run = Some(Instant::now());
            if let Err(e) = slot.duty.run(now).await {
                warn!(duty = slot.duty.name(), error = %e, "Duty failed");
            }
        }
    }

    fn record_events(&mut self, events: &[LifecycleEvent], now: DateTime<Utc>) {
        if events.is_empty() {
            return;
        }
        self.lifecycle_log.record(events, now);
        let count = u64::try_from(events.len()).unwrap_or(u64::MAX);
        self.report.lifecycle_events = self.report.lifecycle_events.saturating_add(count);

        for event in events {
            let announcement = match event {
                LifecycleEvent::Born { agent_id, name, .. } => Announcement::AgentBorn {
                    agent_id: *agent_id,
                    name: name.clone(),
                },
                LifecycleEvent::Died {
                    agent_id,
                    name,
                    permanent,
                } => Announcement::AgentDied {
                    agent_id: *agent_id,
                    name: name.clone(),
                    permanent: *permanent,
                },
                LifecycleEvent::Respawned { .. } | LifecycleEvent::Released { .. } => continue,
            };
            self.ctx.broadcaster.notify_all(&announcement);
        }
    }

    async fn restore_subsystem(&mut self, subsystem: &dyn Subsystem) -> Result<(), SimulationError> {
        let key = subsystem.key().to_owned();
        let Some(blob) = self.ctx.store.load(&key).await? else {
            self.baselines.insert(key, 0);
            return Ok(());
        };
        self.baselines.insert(key.clone(), blob.version);
        match subsystem.restore(&blob.payload) {
            Ok(()) => {
                self.tracker.record_write(&key, &blob.payload);
                debug!(key, version = blob.version, "Subsystem restored");
            }
            Err(e) => {
                // Next flush overwrites the bad snapshot.
                warn!(key, version = blob.version, error = %e, "Subsystem snapshot undecodable, starting empty");
                self.tracker.invalidate(&key);
            }
        }
        Ok(())
    }

    async fn flush_subsystem(
        &mut self,
        subsystem: &dyn Subsystem,
        force: bool,
    ) -> Result<(), SimulationError> {
        let key = subsystem.key().to_owned();
        let payload = subsystem.snapshot()?;
        if !force && !self.tracker.should_write(&key, &payload) {
            return Ok(());
        }

        let store = &self.ctx.store;
        let version = match store.save_if_version(&key, self.baseline(&key), &payload).await? {
            Some(version) => version,
            None => {
                warn!(key, "Subsystem snapshot written elsewhere, overwriting");
                let current = store.get_version(&key).await?;
                match store.save_if_version(&key, current, &payload).await? {
                    Some(version) => version,
                    None => {
                        return Err(SimulationError::FlushContended { key, attempts: 2 });
                    }
                }
            }
        };
        self.tracker.record_write(&key, &payload);
        self.baselines.insert(key, version);
        Ok(())
    }

    async fn shut_down(&mut self) {
        self.set_phase(LoopPhase::ShuttingDown);
        if !self.lease.is_authoritative() {
            warn!("Lease not held at shutdown, skipping final flush");
        } else if let Err(e) = self.resync_if_needed().await {
            // Local state predates the other writer; the stored copy stays.
            warn!(error = %e, "Resync at shutdown failed, skipping final flush");
        } else {
            match self.flush(true).await {
                Ok(outcome) => info!(?outcome, "Final flush complete"),
                Err(e) => error!(error = %e, "Final flush failed"),
            }
        }
        match self.lease.release().await {
            Ok(true) => info!(role = self.lease.role(), "Lease released"),
            Ok(false) => debug!(role = self.lease.role(), "Lease was not ours to release"),
            Err(e) => warn!(error = %e, "Failed to release lease, it will expire"),
        }
        self.set_phase(LoopPhase::Stopped);
        info!(
            ticks = self.report.ticks,
            flushes = self.report.flushes,
            reconciliations = self.report.reconciliations,
            "Simulation stopped"
        );
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("owner", &self.ctx.owner_id)
            .field("tick", &self.tick)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}
