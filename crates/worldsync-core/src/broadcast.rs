//! The announcement seam.
//!
//! The core never waits for an announcement to be delivered and never
//! fails because one was dropped. [`ChannelBroadcaster`] delivers to
//! in-process subscribers; the engine binary adds a NATS-backed one.

use tokio::sync::broadcast;
use worldsync_types::Announcement;

/// Capacity of the in-process announcement channel.
///
/// A subscriber that falls further behind receives
/// [`broadcast::error::RecvError::Lagged`] and skips to the newest message.
const BROADCAST_CAPACITY: usize = 256;

/// Fire-and-forget delivery of world-wide announcements.
pub trait Broadcaster: Send + Sync {
    /// Send `announcement` to every connected session.
    fn notify_all(&self, announcement: &Announcement);
}

/// In-process broadcaster over a [`tokio::sync::broadcast`] channel.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Announcement>,
}

impl ChannelBroadcaster {
    /// Create a broadcaster with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to every announcement sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn notify_all(&self, announcement: &Announcement) {
        // send fails only when nobody is subscribed, which is normal.
        let receivers = self.tx.send(announcement.clone()).unwrap_or(0);
        tracing::debug!(receivers, ?announcement, "Announcement sent");
    }
}

/// Drain everything currently queued on `rx`, skipping lag gaps.
pub fn drain(rx: &mut broadcast::Receiver<Announcement>) -> Vec<Announcement> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(announcement) => out.push(announcement),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}
