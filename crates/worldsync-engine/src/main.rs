//! Simulation authority binary for worldsync.
//!
//! Wires the store backend, the announcement broadcaster, the arena and the
//! simulation loop together, then runs until Ctrl-C. Any number of engines
//! may run against the same store; the one holding the lease simulates and
//! the rest stand by.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `worldsync-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Read the `templates` and `arena` sections
//! 4. Connect the state store
//! 5. Connect NATS for announcements (in-process channel if unset)
//! 6. Build the simulation context and arena
//! 7. Install the Ctrl-C handler
//! 8. Run the simulation loop
//! 9. Log the result

mod bootstrap;
mod error;
mod nats_broadcast;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worldsync_arena::{Arena, ArenaSpawnDuty, StorePresence};
use worldsync_core::config::{LogFormat, LoggingConfig, StoreBackend};
use worldsync_core::{
    Broadcaster, ChannelBroadcaster, ShutdownSignal, Simulation, SimulationContext,
    WorldsyncConfig,
};
use worldsync_db::{DragonflyStore, MemoryStore, PostgresStore, StateStore};
use worldsync_types::OwnerId;

use crate::error::EngineError;
use crate::nats_broadcast::{DEFAULT_SUBJECT, NatsBroadcaster};

/// Path of the configuration file, relative to the working directory.
const CONFIG_PATH: &str = "worldsync-config.yaml";

/// Application entry point for the simulation authority.
///
/// # Errors
///
/// Returns an error if any startup step or the simulation loop fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let contents = read_config_file()?;
    let config = match contents.as_deref() {
        Some(yaml) => WorldsyncConfig::parse(yaml)?,
        None => WorldsyncConfig::default(),
    };

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("worldsync-engine starting");
    if contents.is_none() {
        info!("Config file not found, using defaults");
    }
    info!(
        role = %config.world.role,
        owner_id = %config.world.owner_id,
        store = ?config.infrastructure.store,
        tick_interval_secs = config.timing.tick_interval_secs,
        flush_interval_minutes = config.timing.flush_interval_minutes,
        lease_ttl_secs = config.timing.lease_ttl_secs,
        "Configuration loaded"
    );

    // 3. Engine-owned sections.
    let raw = match contents.as_deref() {
        Some(yaml) => bootstrap::parse_raw(yaml)?,
        None => serde_yml::Value::Null,
    };
    let catalog = bootstrap::template_catalog(&raw)?;
    let arena_config = bootstrap::arena_config(&raw)?;
    info!(
        templates = catalog.templates().len(),
        arena_templates = arena_config.templates.len(),
        min_participants = arena_config.min_participants,
        "Bootstrap sections loaded"
    );

    // 4. Connect the state store.
    let store = connect_store(&config).await?;

    // 5. Announcements.
    let broadcaster = connect_broadcaster(&config.infrastructure.nats_url).await?;

    // 6. Context and arena.
    let ctx = SimulationContext::new(
        Arc::clone(&store),
        broadcaster,
        OwnerId::new(config.world.owner_id.clone()),
    );
    let presence = Arc::new(StorePresence::new(
        Arc::clone(&store),
        StorePresence::DEFAULT_COUNTER,
    ));
    let arena = Arc::new(Arena::from_context(&ctx, presence, arena_config));
    let simulation = Simulation::new(ctx, &config)
        .with_catalog(catalog)
        .with_duty(Arc::new(ArenaSpawnDuty::new(arena)));

    // 7. Ctrl-C handler.
    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.trigger();
        });
    }

    // 8. Run the simulation.
    let report = simulation
        .run(shutdown)
        .await
        .map_err(EngineError::from)?;

    // 9. Log results.
    info!(
        ticks = report.ticks,
        idle_ticks = report.idle_ticks,
        flushes = report.flushes,
        unchanged_flushes = report.unchanged_flushes,
        reconciliations = report.reconciliations,
        lost_races = report.lost_races,
        authority_losses = report.authority_losses,
        lifecycle_events = report.lifecycle_events,
        "worldsync-engine shutdown complete"
    );

    Ok(())
}

/// Initialize the global subscriber. `RUST_LOG` wins over the configured
/// level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

/// Read `worldsync-config.yaml` if it exists.
fn read_config_file() -> Result<Option<String>, EngineError> {
    let path = Path::new(CONFIG_PATH);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
        source: e.into(),
    })?;
    Ok(Some(contents))
}

/// Connect the configured backend, running migrations for `PostgreSQL`.
async fn connect_store(config: &WorldsyncConfig) -> Result<Arc<dyn StateStore>, EngineError> {
    let infra = &config.infrastructure;
    let store: Arc<dyn StateStore> = match infra.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Dragonfly => {
            info!(url = %infra.dragonfly_url, "Connecting to Dragonfly");
            Arc::new(DragonflyStore::connect(&infra.dragonfly_url).await?)
        }
        StoreBackend::Postgres => {
            info!("Connecting to PostgreSQL");
            let pg = PostgresStore::connect(&infra.postgres_url).await?;
            pg.run_migrations().await?;
            info!("PostgreSQL migrations applied");
            Arc::new(pg)
        }
    };
    info!(backend = ?infra.store, "State store connected");
    Ok(store)
}

/// NATS when a URL is configured, otherwise an in-process channel with no
/// external subscribers.
async fn connect_broadcaster(nats_url: &str) -> Result<Arc<dyn Broadcaster>, EngineError> {
    if nats_url.is_empty() {
        info!("NATS URL empty, announcements stay in process");
        return Ok(Arc::new(ChannelBroadcaster::new()));
    }
    info!(nats_url, subject = DEFAULT_SUBJECT, "Connecting to NATS");
    let broadcaster = NatsBroadcaster::connect(nats_url, DEFAULT_SUBJECT).await?;
    Ok(Arc::new(broadcaster))
}
