//! Timesync: master beacon dissemination by controlled flooding and the
//! FLOPSYNC-2 closed-loop clock correction on dynamic nodes.
//!
//! Beacon wire format (11 bytes, plus master index and tag with
//! authentication):
//! `[0x46] [0x08] [hop] [panHi] [panLo] [0xff] [0xff] [counter:u32]
//! ([masterIndex:u32]) ([tag:16])`
//!
//! The packet counter is the absolute network-time unit since master boot:
//! multiplying by the clock-sync period recovers absolute network time.

pub mod dynamic;
pub mod flopsync;
pub mod master;

pub use dynamic::DynamicTimesync;
pub use flopsync::Flopsync2;
pub use master::MasterTimesync;

use crate::config::NetworkConfig;
use crate::error::PacketError;
use crate::util::Packet;

/// Per-hop rebroadcast delay: 32 us per byte plus 600 us total margin.
pub const REBROADCAST_INTERVAL_NS: i64 = 1_016_000;

/// Beacon header plus packet counter.
pub const SYNC_PACKET_BASE_SIZE: usize = 11;

/// Timesync beacons always use sequence number 1 in their nonce.
pub const TIMESYNC_SEQUENCE_NUMBER: u64 = 1;

/// Expected beacon size for this configuration.
pub fn sync_packet_size(config: &NetworkConfig) -> usize {
    if config.authenticate_control() {
        SYNC_PACKET_BASE_SIZE + 4 + crate::util::packet::TAG_SIZE
    } else {
        SYNC_PACKET_BASE_SIZE
    }
}

/// Build a beacon with the given hop, counter and optional master index.
pub fn build_sync_packet(
    config: &NetworkConfig,
    hop: u8,
    counter: u32,
    master_index: Option<u32>,
) -> Result<Packet, PacketError> {
    let mut pkt = Packet::new();
    pkt.put(&[
        0x46, // frame type 0b110 (reserved), intra pan
        0x08, // no source addressing, short destination addressing
        hop,  // seq no reused as glossy hop count, 0 = root node
        (config.pan_id >> 8) as u8,
        (config.pan_id & 0xff) as u8,
        0xff, // destination address (broadcast)
        0xff,
    ])?;
    pkt.put_u32(counter)?;
    if let Some(mi) = master_index {
        pkt.put_u32(mi)?;
    }
    Ok(pkt)
}

/// Read the packet counter of a received beacon.
pub fn packet_counter(pkt: &Packet) -> u32 {
    u32::from_le_bytes([pkt[7], pkt[8], pkt[9], pkt[10]])
}

/// Read the master index of a received beacon (authenticated networks).
pub fn packet_master_index(pkt: &Packet) -> u32 {
    u32::from_le_bytes([pkt[11], pkt[12], pkt[13], pkt[14]])
}

/// Structural beacon check shared by the synchronized and scanning paths:
/// header bytes, pan id and expected size.
pub fn beacon_shape_ok(config: &NetworkConfig, pkt: &Packet) -> bool {
    pkt.size() == sync_packet_size(config)
        && pkt[0] == 0x46
        && pkt[1] == 0x08
        && pkt[3] == (config.pan_id >> 8) as u8
        && pkt[4] == (config.pan_id & 0xff) as u8
        && pkt[5] == 0xff
        && pkt[6] == 0xff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let cfg = NetworkConfig::base(0, 6, 16);
        let pkt = build_sync_packet(&cfg, 0, 1234, None).unwrap();
        assert_eq!(pkt.size(), sync_packet_size(&cfg));
        assert!(beacon_shape_ok(&cfg, &pkt));
        assert_eq!(packet_counter(&pkt), 1234);
    }

    #[test]
    fn beacon_with_master_index() {
        let mut cfg = NetworkConfig::base(0, 6, 16);
        cfg.authenticate_control_messages = true;
        let pkt = build_sync_packet(&cfg, 0, 7, Some(3)).unwrap();
        // Size counts the not-yet-appended tag.
        assert_eq!(pkt.size() + crate::util::packet::TAG_SIZE, sync_packet_size(&cfg));
        assert_eq!(packet_master_index(&pkt), 3);
    }

    #[test]
    fn wrong_pan_rejected() {
        let cfg = NetworkConfig::base(0, 6, 16);
        let mut other = cfg.clone();
        other.pan_id = 0xbeef;
        let pkt = build_sync_packet(&other, 0, 0, None).unwrap();
        assert!(!beacon_shape_ok(&cfg, &pkt));
    }
}
