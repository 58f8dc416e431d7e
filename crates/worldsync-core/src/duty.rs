//! Periodic authority-only work scheduled by the loop.
//!
//! A [`Duty`] runs on its own cadence inside the tick, and only while this
//! process holds the lease. The arena's spawn check is one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DutyError;

/// Work the simulation authority performs every `interval`.
#[async_trait]
pub trait Duty: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Minimum time between runs.
    fn interval(&self) -> Duration;

    /// Do the work.
    async fn run(&self, now: DateTime<Utc>) -> Result<(), DutyError>;
}
