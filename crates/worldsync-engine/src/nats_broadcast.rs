//! NATS-backed announcement delivery.
//!
//! [`NatsBroadcaster`] implements [`Broadcaster`] by queueing announcements
//! onto a bounded channel drained by a publisher task. `notify_all` never
//! blocks the simulation loop: when the queue is full or the publisher has
//! stopped, the announcement is dropped with a warning.
//!
//! # Subject Convention
//!
//! Every announcement is published as JSON to a single subject, by default
//! `worldsync.announcements`. The `type` field carries the variant.

use async_nats::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use worldsync_core::Broadcaster;
use worldsync_types::Announcement;

use crate::error::EngineError;

/// Default subject announcements are published on.
pub const DEFAULT_SUBJECT: &str = "worldsync.announcements";

/// Announcements queued for the publisher before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

/// Fire-and-forget broadcaster over NATS.
#[derive(Debug, Clone)]
pub struct NatsBroadcaster {
    tx: mpsc::Sender<Announcement>,
}

impl NatsBroadcaster {
    /// Connect to `url` and start publishing to `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the connection fails.
    pub async fn connect(url: &str, subject: &str) -> Result<Self, EngineError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EngineError::Nats {
                message: format!("failed to connect to NATS at {url}: {e}"),
            })?;
        let (broadcaster, rx) = Self::queue();
        tokio::spawn(publish(client, subject.to_owned(), rx));
        info!(url, subject, "NATS announcement publisher started");
        Ok(broadcaster)
    }

    fn queue() -> (Self, mpsc::Receiver<Announcement>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }
}

impl Broadcaster for NatsBroadcaster {
    fn notify_all(&self, announcement: &Announcement) {
        if let Err(e) = self.tx.try_send(announcement.clone()) {
            warn!(error = %e, "Announcement dropped before publishing");
        }
    }
}

/// Drain `rx` onto `subject` until every sender is gone.
async fn publish(client: Client, subject: String, mut rx: mpsc::Receiver<Announcement>) {
    while let Some(announcement) = rx.recv().await {
        let payload = match serde_json::to_vec(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode announcement");
                continue;
            }
        };
        match client.publish(subject.clone(), payload.into()).await {
            Ok(()) => debug!(subject = %subject, "Announcement published"),
            Err(e) => warn!(error = %e, subject = %subject, "Failed to publish announcement"),
        }
    }
    if let Err(e) = client.flush().await {
        warn!(error = %e, "Failed to flush NATS client on shutdown");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use worldsync_types::AgentId;

    use super::*;

    fn born() -> Announcement {
        Announcement::AgentBorn {
            agent_id: AgentId::new(),
            name: "Wren".to_owned(),
        }
    }

    #[tokio::test]
    async fn announcements_queue_in_order() {
        let (broadcaster, mut rx) = NatsBroadcaster::queue();
        let first = born();
        let second = born();
        broadcaster.notify_all(&first);
        broadcaster.notify_all(&second);
        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(rx.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn full_or_closed_queue_drops_silently() {
        let (broadcaster, rx) = NatsBroadcaster::queue();
        for _ in 0..QUEUE_CAPACITY.saturating_add(10) {
            broadcaster.notify_all(&born());
        }
        drop(rx);
        broadcaster.notify_all(&born());
    }

    #[test]
    fn payload_is_tagged_json() {
        let json = serde_json::to_value(born()).unwrap();
        assert_eq!(json.get("type").and_then(|t| t.as_str()), Some("agent_born"));
    }
}
