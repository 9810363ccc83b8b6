//! MAC context and the slotframe engine.
//!
//! [`MacContext`] bundles everything the phases share: configuration,
//! radio and clock handles, the stream and key managers, network time and
//! the virtual clock, radio statistics, and the slot duration arithmetic.
//! [`MacEngine`] owns the context plus the four phases and runs the
//! cooperative slotframe loop, one deadline at a time.

pub mod engine;
pub mod phase;

pub use engine::MacEngine;

use std::sync::Arc;

use log::{debug, warn};

use crate::config::NetworkConfig;
use crate::crypto::keys::KeyManager;
use crate::dataphase::DATA_SLOT_DURATION_NS;
use crate::error::{ConfigError, RadioError};
use crate::ports::{MacClock, Radio, RadioConfig, RecvInfo};
use crate::stream::StreamManager;
use crate::time::{NetworkTimeBase, VirtualClock};
use crate::util::Packet;

/// Lead time needed to wake and arm the transmitter before a deadline.
pub const SENDING_WAKEUP_ADVANCE_NS: i64 = 500_000;
/// Lead time needed to wake the receiver before the expected arrival.
pub const RECEIVING_WAKEUP_ADVANCE_NS: i64 = 500_000;
/// On-air time of preamble plus start-of-frame delimiter.
pub const PACKET_PREAMBLE_NS: i64 = 160_000;
/// Worst-case radio propagation delay (one kilometre).
pub const MAX_PROPAGATION_DELAY_NS: i64 = 3_334;

/// Round `value` up to a multiple of `to`.
pub fn align_up(value: i64, to: i64) -> i64 {
    (value + to - 1) / to * to
}

/// Send/receive counters with halving on saturation, so the ratios stay
/// meaningful over long uptimes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RadioStats {
    pub send_total: u32,
    pub send_errors: u32,
    pub recv_total: u32,
    pub recv_errors: u32,
}

impl RadioStats {
    fn account_send(&mut self, failed: bool) {
        if failed {
            self.send_errors += 1;
        }
        self.send_total += 1;
        if self.send_total & (1 << 31) != 0 {
            self.send_total >>= 1;
            self.send_errors >>= 1;
        }
    }

    fn account_recv(&mut self, failed: bool) {
        if failed {
            self.recv_errors += 1;
        }
        self.recv_total += 1;
        if self.recv_total & (1 << 31) != 0 {
            self.recv_total >>= 1;
            self.recv_errors >>= 1;
        }
    }
}

/// Shared state of the MAC thread, passed to every phase by reference.
pub struct MacContext {
    pub config: Arc<NetworkConfig>,
    pub radio: Arc<dyn Radio>,
    pub clock: Arc<dyn MacClock>,
    pub stream_mgr: Arc<StreamManager>,
    key_mgr: Box<dyn KeyManager>,

    pub network_time: NetworkTimeBase,
    pub virtual_clock: VirtualClock,
    hop: u8,
    stats: RadioStats,

    // Slot timing, derived once from the configuration.
    pub data_slot_duration: i64,
    pub uplink_slot_duration: i64,
    pub downlink_slot_duration: i64,
    pub slots_per_tile: usize,
    pub data_slots_in_downlink_tile: usize,
    pub data_slots_in_uplink_tile: usize,
    pub tile_slack: i64,
}

impl MacContext {
    pub fn new(
        config: Arc<NetworkConfig>,
        radio: Arc<dyn Radio>,
        clock: Arc<dyn MacClock>,
        stream_mgr: Arc<StreamManager>,
        key_mgr: Box<dyn KeyManager>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tile = config.tile_duration_ns;
        let data_slot = DATA_SLOT_DURATION_NS;
        if tile % data_slot != 0 {
            return Err(ConfigError::ValidationFailed(
                "tile duration is not a multiple of the data slot",
            ));
        }

        let uplink_raw = (crate::uplink::PACKET_ARRIVAL_AND_PROCESSING_NS
            + crate::uplink::TRANSMISSION_INTERVAL_NS)
            * config.num_uplink_packets as i64;
        let uplink_slot_duration = align_up(uplink_raw, data_slot);

        let timesync_duration = RECEIVING_WAKEUP_ADVANCE_NS
            + 2 * config.max_admitted_rcv_window_ns
            + config.max_hops as i64 * crate::timesync::REBROADCAST_INTERVAL_NS;
        let schedule_duration = RECEIVING_WAKEUP_ADVANCE_NS
            + 2 * config.max_admitted_rcv_window_ns
            + config.max_hops as i64 * crate::downlink::rebroadcast_interval(&config);
        let downlink_slot_duration = align_up(timesync_duration.max(schedule_duration), data_slot);

        if tile - downlink_slot_duration < data_slot {
            return Err(ConfigError::ValidationFailed("downlink slot too large for tile"));
        }
        if tile - uplink_slot_duration < data_slot {
            return Err(ConfigError::ValidationFailed("uplink slot too large for tile"));
        }

        let slots_per_tile = (tile / data_slot) as usize;
        let data_slots_in_downlink_tile = ((tile - downlink_slot_duration) / data_slot) as usize;
        let data_slots_in_uplink_tile = ((tile - uplink_slot_duration) / data_slot) as usize;
        assert_eq!(
            downlink_slot_duration + data_slots_in_downlink_tile as i64 * data_slot,
            uplink_slot_duration + data_slots_in_uplink_tile as i64 * data_slot,
        );
        let tile_slack =
            tile - (uplink_slot_duration + data_slots_in_uplink_tile as i64 * data_slot);

        let sync_period = config.clock_sync_period_ns;
        Ok(Self {
            config,
            radio,
            clock,
            stream_mgr,
            key_mgr,
            network_time: NetworkTimeBase::new(),
            virtual_clock: VirtualClock::new(sync_period),
            hop: 0,
            stats: RadioStats::default(),
            data_slot_duration: data_slot,
            uplink_slot_duration,
            downlink_slot_duration,
            slots_per_tile,
            data_slots_in_downlink_tile,
            data_slots_in_uplink_tile,
            tile_slack,
        })
    }

    pub fn network_id(&self) -> u8 {
        self.config.network_id
    }

    pub fn is_master(&self) -> bool {
        self.config.is_master()
    }

    pub fn hop(&self) -> u8 {
        self.hop
    }

    pub fn set_hop(&mut self, hop: u8) {
        self.hop = hop;
    }

    pub fn key_manager(&mut self) -> &mut dyn KeyManager {
        &mut *self.key_mgr
    }

    pub fn stats(&self) -> RadioStats {
        self.stats
    }

    /// Tile counter at a local instant; requires a valid network time.
    pub fn current_tile(&self, local_ns: i64) -> u32 {
        let nt = self.network_time.to_network(local_ns);
        (nt / self.config.tile_duration_ns).max(0) as u32
    }

    /// Number of timesync tiles in `[0, tile)`: timesync opens tile 0 of
    /// every clock-sync period.
    pub fn num_timesyncs(&self, tile: u32) -> u32 {
        let tiles_per_sync =
            (self.config.clock_sync_period_ns / self.config.tile_duration_ns) as u32;
        tile.div_ceil(tiles_per_sync)
    }

    pub fn radio_config(&self) -> RadioConfig {
        RadioConfig {
            frequency_hz: self.config.base_frequency_hz,
            tx_power_dbm: self.config.tx_power_dbm,
            crc_enabled: true,
        }
    }

    pub fn configure_radio(&self) {
        self.radio.configure(&self.radio_config());
    }

    pub fn radio_idle(&self) {
        self.radio.idle();
    }

    /// Transmit a frame so it goes on air at `deadline_ns` (local clock),
    /// sleeping until the transmitter wakeup point first.
    pub fn send_packet_at(&mut self, pkt: &Packet, deadline_ns: i64) {
        let wakeup = deadline_ns - SENDING_WAKEUP_ADVANCE_NS;
        let now = self.clock.now();
        if now >= deadline_ns {
            debug!("[M] send too late");
            self.stats.account_send(true);
            return;
        }
        if now < wakeup {
            self.clock.sleep_until(wakeup);
        }
        let failed = self.radio.send_at(pkt.as_frame(), deadline_ns).is_err();
        self.stats.account_send(failed);
    }

    /// Receive a frame expected at `t_expected` within `±window`, keeping
    /// the radio on until `pred` accepts a frame or the window closes.
    pub fn recv_packet_filtered(
        &mut self,
        pkt: &mut Packet,
        t_expected: i64,
        window: i64,
        mut pred: impl FnMut(&Packet, &RecvInfo) -> bool,
    ) -> Option<RecvInfo> {
        let wakeup = t_expected - (RECEIVING_WAKEUP_ADVANCE_NS + window);
        let timeout = t_expected + window + PACKET_PREAMBLE_NS + MAX_PROPAGATION_DELAY_NS;
        let now = self.clock.now();
        if now + window >= t_expected {
            debug!("[M] recv too late");
            self.stats.account_recv(true);
            return None;
        }
        if now < wakeup {
            self.clock.sleep_until(wakeup);
        }
        let mut buf = [0u8; crate::util::packet::MAX_PACKET_SIZE];
        loop {
            match self.radio.recv(&mut buf, timeout) {
                Ok(info) => {
                    if pkt.load_frame(&buf[..info.size]).is_err() {
                        self.stats.account_recv(true);
                        continue;
                    }
                    if pred(pkt, &info) {
                        self.stats.account_recv(false);
                        return Some(info);
                    }
                    // Not the frame we are waiting for; keep listening.
                }
                Err(RadioError::Crc) => {
                    self.stats.account_recv(true);
                }
                Err(_) => {
                    self.stats.account_recv(true);
                    return None;
                }
            }
            if self.clock.now() >= timeout {
                return None;
            }
        }
    }

    /// Receive without a frame filter.
    pub fn recv_packet(
        &mut self,
        pkt: &mut Packet,
        t_expected: i64,
        window: i64,
    ) -> Option<RecvInfo> {
        self.recv_packet_filtered(pkt, t_expected, window, |_, _| true)
    }

    /// Listen with no deadline; used while scanning for a network.
    pub fn recv_packet_scanning(
        &mut self,
        pkt: &mut Packet,
        mut pred: impl FnMut(&Packet, &RecvInfo) -> bool,
    ) -> RecvInfo {
        let mut buf = [0u8; crate::util::packet::MAX_PACKET_SIZE];
        loop {
            match self.radio.recv(&mut buf, i64::MAX) {
                Ok(info) => {
                    if pkt.load_frame(&buf[..info.size]).is_err() {
                        continue;
                    }
                    if pred(pkt, &info) {
                        self.stats.account_recv(false);
                        return info;
                    }
                }
                Err(e) => {
                    self.stats.account_recv(true);
                    if e == RadioError::Timeout {
                        warn!("[M] scan receive timed out unexpectedly");
                    }
                }
            }
        }
    }
}
