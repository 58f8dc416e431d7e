//! Store key layout for the arena.
//!
//! ```text
//! arena:active               blob     Option<ResourceId> of the current slot
//! arena:cooldowns            blob     template id -> earliest respawn time
//! arena:resource:{id}        blob     ContestedResource record
//! arena:{id}:hp              counter  authoritative remaining HP
//! arena:{id}:damage          ledger   contributor -> credited damage
//! arena:{id}:phase:{n}       marker   phase n was announced
//! arena:{id}:settled         marker   SettlementRecord
//! rewards:xp, rewards:gold   ledger   contributor -> total paid
//! ```

use worldsync_types::ResourceId;

/// The active-encounter slot.
pub const ACTIVE: &str = "arena:active";

/// Per-template respawn cooldowns.
pub const COOLDOWNS: &str = "arena:cooldowns";

/// Experience paid out, per contributor.
pub const XP_LEDGER: &str = "rewards:xp";

/// Gold paid out, per contributor.
pub const GOLD_LEDGER: &str = "rewards:gold";

/// The resource record.
pub fn resource(id: ResourceId) -> String {
    format!("arena:resource:{id}")
}

/// The HP counter.
pub fn hp(id: ResourceId) -> String {
    format!("arena:{id}:hp")
}

/// The damage ledger.
pub fn damage(id: ResourceId) -> String {
    format!("arena:{id}:damage")
}

/// The announce-once marker of `phase`.
pub fn phase(id: ResourceId, phase: u8) -> String {
    format!("arena:{id}:phase:{phase}")
}

/// The settlement marker.
pub fn settled(id: ResourceId) -> String {
    format!("arena:{id}:settled")
}
