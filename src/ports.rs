//! Port traits — the boundary between the network engine and the platform.
//!
//! ```text
//!   Adapter (transceiver driver, RTC) ──▶ Port trait ──▶ MAC engine
//! ```
//!
//! The transceiver driver and the timed-sleep primitive are external
//! collaborators: the engine only names their interfaces here. Adapters
//! implement these traits; the engine consumes them through shared handles
//! so the same MAC code runs against real hardware or the in-memory
//! simulation used by the host test suite.

use crate::error::RadioError;

// ───────────────────────────────────────────────────────────────
// Radio port
// ───────────────────────────────────────────────────────────────

/// Transceiver configuration applied before each phase's radio activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioConfig {
    pub frequency_hz: u32,
    pub tx_power_dbm: i8,
    /// Hardware CRC check on receive.
    pub crc_enabled: bool,
}

/// Metadata of a successfully received frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecvInfo {
    /// Frame length in bytes.
    pub size: usize,
    /// Received signal strength, dBm.
    pub rssi: i16,
    /// Local-clock timestamp of the start-of-frame delimiter.
    pub timestamp_ns: i64,
    /// False when the transceiver could not timestamp the frame.
    pub timestamp_valid: bool,
}

/// The radio transceiver. Owned exclusively by the MAC thread.
///
/// All deadlines and timeouts are absolute nanosecond instants on the local
/// clock. Errors are status values; implementations must not panic on radio
/// faults.
pub trait Radio: Send + Sync {
    fn configure(&self, cfg: &RadioConfig);

    fn turn_on(&self);

    fn turn_off(&self);

    /// Put the transceiver in idle between slots to save energy.
    fn idle(&self);

    /// Transmit `frame` so that the start-of-frame delimiter goes on air
    /// exactly at `deadline_ns`.
    fn send_at(&self, frame: &[u8], deadline_ns: i64) -> Result<(), RadioError>;

    /// Listen until a frame arrives or `timeout_ns` passes. On success the
    /// frame bytes are written to `buf`.
    fn recv(&self, buf: &mut [u8], timeout_ns: i64) -> Result<RecvInfo, RadioError>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic local clock with timed sleep, the only suspension primitive
/// the MAC thread uses.
pub trait MacClock: Send + Sync {
    /// Current local time, nanoseconds.
    fn now(&self) -> i64;

    /// Block the calling thread until the local clock reaches `deadline_ns`.
    /// Returns immediately if the deadline already passed.
    fn sleep_until(&self, deadline_ns: i64);
}
