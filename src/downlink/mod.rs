//! Schedule distribution: the downlink control slot.
//!
//! The master floods each new schedule as a train of packets, repeated
//! [`SCHEDULE_REPETITIONS`] times, then applies it locally; dynamic nodes
//! reassemble the packets (tolerant of `SCHEDULE_REPETITIONS - 1` missed
//! rounds), expand the implicit schedule incrementally across downlinks,
//! and every node installs the explicit schedule atomically at the
//! activation tile boundary.

pub mod dynamic;
pub mod expansion;
pub mod master;

pub use dynamic::DynamicScheduleDownlink;
pub use expansion::ScheduleExpander;
pub use master::MasterScheduleDownlink;

use crate::config::NetworkConfig;
use crate::mac::{RECEIVING_WAKEUP_ADVANCE_NS, SENDING_WAKEUP_ADVANCE_NS};
use crate::util::packet::MAX_PACKET_SIZE;

/// Send rounds per schedule; a fourth pass only applies it locally.
pub const SCHEDULE_REPETITIONS: u8 = 3;

/// Schedule packets always use sequence number 1 in their nonce; the tile
/// number already makes each downlink slot unique.
pub const DOWNLINK_SEQUENCE_NUMBER: u64 = 1;

/// Per-hop rebroadcast delay of the schedule flood: frame time at 32 us
/// per byte (plus preamble bytes), processing time, and the wakeup advance
/// of whichever side is slower.
pub fn rebroadcast_interval(config: &NetworkConfig) -> i64 {
    const COMPUTATION_TIME_NS: i64 = 244_000;
    let tx_time = (MAX_PACKET_SIZE as i64 + 8) * 32_000;
    let a = SENDING_WAKEUP_ADVANCE_NS;
    let b = RECEIVING_WAKEUP_ADVANCE_NS + config.max_admitted_rcv_window_ns;
    tx_time + COMPUTATION_TIME_NS + a.max(b)
}
