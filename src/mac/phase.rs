//! Phase capability traits.
//!
//! Every control phase comes in a master and a dynamic variant: two
//! concrete structs implementing the same capability set, selected once at
//! startup from the node's network id. Phases receive the shared
//! [`MacContext`](super::MacContext) by reference on every call and hold no
//! references to each other; cross-phase effects (resync/desync fan-out)
//! are dispatched by the engine from the timesync outcome.

use super::MacContext;

/// Outcome of a timesync slot, reported to the slotframe engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Still synchronized (or the master, which always is).
    InSync,
    /// A resynchronization completed this slot: the engine must fan out
    /// `resync()` to the other phases.
    Resynced,
    /// Synchronization was lost this slot: the engine must fan out
    /// `desync()`.
    Desynced,
    /// A resynchronization attempt failed; the node remains
    /// desynchronized and nothing is fanned out.
    StillDesynced,
}

/// A control or data phase of the slotframe.
pub trait MacPhase: Send {
    /// Run the phase's slot beginning at `slot_start` (local time). The
    /// phase must return before the next slot deadline.
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64);

    /// Update phase state without touching the radio, used when the slot
    /// must be skipped but round-robin or slot counters must advance.
    fn advance(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let _ = (ctx, slot_start);
    }

    /// Called after the node resynchronized.
    fn resync(&mut self, ctx: &mut MacContext) {
        let _ = ctx;
    }

    /// Called when the node lost synchronization.
    fn desync(&mut self, ctx: &mut MacContext) {
        let _ = ctx;
    }
}

/// The timesync phase drives the synchronization state machine and is the
/// time source for everything else.
pub trait TimesyncPhase: Send {
    /// Run the timesync slot and report the synchronization outcome.
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) -> SyncOutcome;

    /// Start instant of the current slotframe on the corrected clock.
    fn slotframe_start(&self) -> i64;

    /// Whether the rest of the MAC may operate (the node is synchronized
    /// or is the master).
    fn mac_can_operate(&self) -> bool;

    /// One-time initialization before the slotframe loop starts.
    fn mac_start_hook(&mut self, ctx: &mut MacContext);
}
