//! Network configuration.
//!
//! All startup parameters of a TDMH node. The configuration is immutable
//! after construction and every cross-check runs in [`NetworkConfig::validate`];
//! a node refuses to start on any violation rather than clamping silently.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Control superframe structure: a bitmask over `size` tiles, bit `i` set
/// means tile `i` opens with a downlink control slot, clear means uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSuperframe {
    bitmask: u32,
    size: u8,
}

impl ControlSuperframe {
    pub fn new(bitmask: u32, size: u8) -> Self {
        Self { bitmask, size }
    }

    /// The canonical two-tile structure: one downlink, one uplink.
    pub fn standard() -> Self {
        Self::new(0b01, 2)
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_control_downlink(&self, tile: usize) -> bool {
        debug_assert!(tile < self.size());
        (self.bitmask >> tile) & 1 == 1
    }

    pub fn is_control_uplink(&self, tile: usize) -> bool {
        !self.is_control_downlink(tile)
    }

    pub fn count_downlink_slots(&self) -> usize {
        (0..self.size()).filter(|&i| self.is_control_downlink(i)).count()
    }

    pub fn count_uplink_slots(&self) -> usize {
        self.size() - self.count_downlink_slots()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size < 2 || self.size > 32 {
            return Err(ConfigError::ValidationFailed("superframe size out of [2,32]"));
        }
        if !self.is_control_downlink(0) {
            return Err(ConfigError::ValidationFailed("first superframe tile must be a downlink"));
        }
        if self.count_uplink_slots() == 0 {
            return Err(ConfigError::ValidationFailed("superframe has no uplink tile"));
        }
        // Reject non-minimal structures, e.g. 0b0101 over 4 tiles is 0b01 over 2.
        if self.size % 2 == 0 {
            let half = self.size / 2;
            let low = self.bitmask & ((1u32 << half) - 1);
            let high = (self.bitmask >> half) & ((1u32 << half) - 1);
            if low == high {
                return Err(ConfigError::ValidationFailed("superframe structure is not minimal"));
            }
        }
        Ok(())
    }
}

/// Immutable per-node network configuration.
///
/// Times are nanoseconds, RSSI values dBm. Fields mirror the wire-visible
/// parameters every node of a network must agree on, plus local tunables
/// (neighbor thresholds, timeouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    // --- Identity ---
    /// This node's network id; 0 is the master.
    pub network_id: u8,
    /// Nonzero forces the node to synchronize only at this hop.
    pub static_hop: u8,

    // --- Network shape ---
    pub max_hops: u8,
    /// Must be a multiple of 8 (neighbor bitmaps are byte-packed).
    pub max_nodes: u16,
    pub pan_id: u16,
    pub tx_power_dbm: i8,
    pub base_frequency_hz: u32,

    // --- Timing ---
    pub clock_sync_period_ns: i64,
    pub tile_duration_ns: i64,
    pub max_admitted_rcv_window_ns: i64,

    // --- Uplink ---
    /// Topologies guaranteed a place in every uplink message.
    pub guaranteed_topologies: u8,
    pub num_uplink_packets: u8,

    // --- Neighbor management ---
    pub max_missed_timesyncs: u8,
    pub max_rounds_unavailable_becomes_dead: u16,
    pub max_rounds_weak_link_becomes_dead: u16,
    pub min_neighbor_rssi: i16,
    pub min_weak_neighbor_rssi: i16,

    // --- Features ---
    pub channel_spatial_reuse: bool,
    pub use_weak_topologies: bool,

    // --- Security ---
    pub authenticate_control_messages: bool,
    pub encrypt_control_messages: bool,
    pub authenticate_data_messages: bool,
    pub encrypt_data_messages: bool,
    pub do_master_challenge_authentication: bool,
    /// Challenge-response timeout, counted in timesync periods.
    pub master_challenge_timeout: u32,
    /// Master key rotation period, counted in timesync periods; 0 disables
    /// periodic rekeying.
    pub rekeying_period_timesyncs: u32,

    // --- Slotframe ---
    pub control_superframe: ControlSuperframe,
}

impl NetworkConfig {
    /// A workable starting point for a small test network. Callers still
    /// need to set `network_id` and validate.
    pub fn base(network_id: u8, max_hops: u8, max_nodes: u16) -> Self {
        Self {
            network_id,
            static_hop: 0,
            max_hops,
            max_nodes,
            pan_id: 0xcafe,
            tx_power_dbm: 5,
            base_frequency_hz: 2_450_000_000,
            clock_sync_period_ns: 10_000_000_000,
            tile_duration_ns: 100_000_000,
            max_admitted_rcv_window_ns: 6_000_000,
            guaranteed_topologies: 4,
            num_uplink_packets: 1,
            max_missed_timesyncs: 3,
            max_rounds_unavailable_becomes_dead: 3,
            max_rounds_weak_link_becomes_dead: 8,
            min_neighbor_rssi: -75,
            min_weak_neighbor_rssi: -95,
            channel_spatial_reuse: false,
            use_weak_topologies: false,
            authenticate_control_messages: false,
            encrypt_control_messages: false,
            authenticate_data_messages: false,
            encrypt_data_messages: false,
            do_master_challenge_authentication: false,
            master_challenge_timeout: 5,
            rekeying_period_timesyncs: 0,
            control_superframe: ControlSuperframe::standard(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.network_id == 0
    }

    /// Encryption implies authentication on the same class of messages.
    pub fn authenticate_control(&self) -> bool {
        self.authenticate_control_messages | self.encrypt_control_messages
    }

    pub fn authenticate_data(&self) -> bool {
        self.authenticate_data_messages | self.encrypt_data_messages
    }

    /// Byte length of a neighbor bitmap.
    pub fn neighbor_bitmask_size(&self) -> usize {
        (self.max_nodes as usize) / 8
    }

    pub fn control_superframe_duration_ns(&self) -> i64 {
        self.tile_duration_ns * self.control_superframe.size() as i64
    }

    pub fn superframes_per_clock_sync(&self) -> i64 {
        self.clock_sync_period_ns / self.control_superframe_duration_ns()
    }

    pub fn uplinks_per_superframe(&self) -> usize {
        self.control_superframe.count_uplink_slots()
    }

    pub fn downlinks_per_superframe(&self) -> usize {
        self.control_superframe.count_downlink_slots()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control_superframe.validate()?;
        if self.max_nodes == 0 || self.max_nodes % 8 != 0 {
            return Err(ConfigError::ValidationFailed("maxNodes must be a nonzero multiple of 8"));
        }
        if self.network_id as u16 >= self.max_nodes {
            return Err(ConfigError::ValidationFailed("networkId out of range"));
        }
        if self.max_hops == 0 {
            return Err(ConfigError::ValidationFailed("maxHops must be at least 1"));
        }
        if self.num_uplink_packets == 0 {
            return Err(ConfigError::ValidationFailed("numUplinkPackets must be at least 1"));
        }
        if self.clock_sync_period_ns % self.control_superframe_duration_ns() != 0 {
            return Err(ConfigError::ValidationFailed(
                "control superframe duration does not divide clock sync period",
            ));
        }
        // Guaranteed topologies must fit the uplink message.
        let topology_size = crate::uplink::topology::TopologyElement::max_size(
            self.neighbor_bitmask_size(),
            self.use_weak_topologies,
        );
        let total = crate::uplink::message::first_uplink_packet_capacity(self)
            + (self.num_uplink_packets as usize - 1)
                * crate::uplink::message::other_uplink_packet_capacity(self);
        if self.guaranteed_topologies as usize * topology_size > total {
            return Err(ConfigError::ValidationFailed(
                "guaranteedTopologies exceed uplink message capacity",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_superframe_is_valid() {
        let cs = ControlSuperframe::standard();
        assert!(cs.validate().is_ok());
        assert!(cs.is_control_downlink(0));
        assert!(cs.is_control_uplink(1));
        assert_eq!(cs.count_downlink_slots(), 1);
        assert_eq!(cs.count_uplink_slots(), 1);
    }

    #[test]
    fn superframe_must_open_with_downlink() {
        assert!(ControlSuperframe::new(0b10, 2).validate().is_err());
    }

    #[test]
    fn superframe_needs_an_uplink() {
        assert!(ControlSuperframe::new(0b11, 2).validate().is_err());
    }

    #[test]
    fn non_minimal_superframe_rejected() {
        // 0b0101 over 4 tiles repeats 0b01 over 2.
        assert!(ControlSuperframe::new(0b0101, 4).validate().is_err());
        // 0b0001 over 4 is fine.
        assert!(ControlSuperframe::new(0b0001, 4).validate().is_ok());
    }

    #[test]
    fn base_config_validates() {
        let cfg = NetworkConfig::base(0, 6, 16);
        assert!(cfg.validate().is_ok());
        assert!(cfg.is_master());
        assert_eq!(cfg.neighbor_bitmask_size(), 2);
        assert_eq!(cfg.superframes_per_clock_sync(), 50);
    }

    #[test]
    fn max_nodes_multiple_of_eight() {
        let mut cfg = NetworkConfig::base(0, 6, 16);
        cfg.max_nodes = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sync_period_must_align_to_superframe() {
        let mut cfg = NetworkConfig::base(0, 6, 16);
        cfg.clock_sync_period_ns = 10_000_000_001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn encryption_implies_authentication() {
        let mut cfg = NetworkConfig::base(1, 6, 16);
        cfg.encrypt_control_messages = true;
        assert!(cfg.authenticate_control());
        cfg.encrypt_data_messages = true;
        assert!(cfg.authenticate_data());
    }
}
