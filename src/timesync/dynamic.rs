//! Dynamic-node timesync: receive the beacon, rebroadcast it one hop
//! further, and close the FLOPSYNC-2 loop.
//!
//! The resync/desync state machine: a desynchronized node scans
//! indefinitely for a beacon, picks its hop from the first acceptable one,
//! and re-enters the network; a synchronized node listens in a window
//! around the computed arrival instant, widening the window on each miss
//! until `maxMissedTimesyncs` consecutive losses force a desync.

use log::{debug, info, warn};

use crate::crypto::keys::KeyManagerStatus;
use crate::mac::phase::{SyncOutcome, TimesyncPhase};
use crate::mac::MacContext;
use crate::util::Packet;

use super::flopsync::Flopsync2;
use super::{
    beacon_shape_ok, packet_counter, packet_master_index, REBROADCAST_INTERVAL_NS,
    TIMESYNC_SEQUENCE_NUMBER,
};

/// RSSI slack below the neighbor threshold accepted while scanning: when
/// resyncing there is a single chance to pick a hop, so the filter is less
/// conservative than the rest of the MAC (three sigma of transceiver RSSI
/// spread in an experimental setup).
const SCAN_RSSI_DELTA: i16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalStatus {
    Desynchronized,
    Syncing,
    InSync,
}

pub struct DynamicTimesync {
    controller: Flopsync2,
    status: InternalStatus,
    /// Corrected arrival timestamp of the last beacon (or its estimate on
    /// a miss).
    measured_frame_start: i64,
    /// Estimated arrival of the next beacon including the clock
    /// correction (uncorrected clock).
    computed_frame_start: i64,
    /// Nominal arrival, first hook time plus N periods (uncorrected).
    theoretical_frame_start: i64,
    clock_correction: i64,
    receiver_window: i64,
    missed_packets: u8,
    packet_counter: u32,
    /// Cached hop, mirrors the context after a resync.
    hop: u8,
}

impl DynamicTimesync {
    pub fn new() -> Self {
        Self {
            controller: Flopsync2::new(),
            status: InternalStatus::Desynchronized,
            measured_frame_start: 0,
            computed_frame_start: 0,
            theoretical_frame_start: 0,
            clock_correction: 0,
            receiver_window: 0,
            missed_packets: 0,
            packet_counter: 0,
            hop: 1,
        }
    }

    fn next(&mut self, ctx: &MacContext) {
        // The theoretical start advances on the uncorrected clock: the
        // reference must stay the first hook time or a second hidden
        // integrator would build up.
        self.theoretical_frame_start += ctx.config.clock_sync_period_ns;
        self.computed_frame_start += ctx.config.clock_sync_period_ns + self.clock_correction;
    }

    fn update_virtual_clock(&self, ctx: &mut MacContext) {
        ctx.virtual_clock.update(
            self.theoretical_frame_start,
            self.computed_frame_start,
            self.clock_correction,
        );
    }

    fn slotframe_start_at(&self, hop: u8) -> i64 {
        self.measured_frame_start - (i64::from(hop) - 1) * REBROADCAST_INTERVAL_NS
    }

    /// Periodic reception in the synchronized state. Returns the outcome
    /// for the engine.
    fn periodic_sync(&mut self, ctx: &mut MacContext) -> SyncOutcome {
        let corrected_start = ctx.virtual_clock.corrected(self.computed_frame_start);
        let cfg = ctx.config.clone();
        let my_hop = ctx.hop();
        let mut pkt = Packet::new();
        let received = ctx.recv_packet_filtered(
            &mut pkt,
            corrected_start,
            self.receiver_window,
            |p, r| {
                // When synchronized the hop cannot change.
                r.timestamp_valid
                    && beacon_shape_ok(&cfg, p)
                    && u16::from(p[2]) + 1 == u16::from(my_hop)
            },
        );

        let Some(info) = received else {
            ctx.radio_idle();
            return self.missed_packet(ctx);
        };

        // Rebroadcast one hop further before anything else: flooding
        // latency budget is per-hop.
        pkt[2] += 1;
        self.measured_frame_start = ctx.virtual_clock.corrected(info.timestamp_ns);
        self.rebroadcast(ctx, &pkt);
        ctx.radio_idle();

        if ctx.config.authenticate_control() {
            let mi = packet_master_index(&pkt);
            let current_mi = ctx.key_manager().master_index();
            let index_valid = if mi < current_mi || mi > current_mi + 1 {
                // The chain may only move forward, one step at a time.
                false
            } else {
                if mi == current_mi + 1 {
                    match ctx.key_manager().status() {
                        KeyManagerStatus::Connected => ctx.key_manager().attempt_advance(),
                        KeyManagerStatus::MasterUntrusted => ctx.key_manager().advance_resync(),
                        _ => {}
                    }
                }
                true
            };

            let verified = index_valid && self.verify_beacon(ctx, &mut pkt, my_hop);
            if !verified {
                if ctx.key_manager().status() == KeyManagerStatus::Advancing {
                    ctx.key_manager().rollback_advance();
                }
                debug!("[T] beacon rejected (index or tag)");
                return self.missed_packet(ctx);
            }
            if ctx.key_manager().status() == KeyManagerStatus::Advancing {
                ctx.key_manager().commit_advance();
            }
        }

        self.do_periodic_sync(ctx, info.timestamp_ns, &pkt);
        SyncOutcome::InSync
    }

    /// Verify the beacon tag. The master authenticates with hop zero, so
    /// the hop byte is zeroed for verification and restored afterwards.
    fn verify_beacon(&mut self, ctx: &mut MacContext, pkt: &mut Packet, hop: u8) -> bool {
        let tile = ctx.current_tile(self.slotframe_start_at(hop));
        let mi = ctx.key_manager().master_index();
        let saved_hop = pkt[2];
        pkt[2] = 0;
        let ocb = ctx.key_manager().timesync_ocb();
        ocb.set_nonce(tile, TIMESYNC_SEQUENCE_NUMBER, mi);
        let verified = matches!(pkt.verify(ocb), Ok(true));
        pkt[2] = saved_hop;
        if !verified {
            debug!("[T] beacon verify failed");
        }
        verified
    }

    fn do_periodic_sync(&mut self, ctx: &mut MacContext, arrival_ns: i64, pkt: &Packet) {
        self.packet_counter = self.packet_counter.wrapping_add(1);
        let received_counter = packet_counter(pkt);
        if received_counter != self.packet_counter {
            warn!(
                "[T] beacon counter {} (expected {})",
                received_counter, self.packet_counter
            );
            self.packet_counter = received_counter;
        }

        let error = arrival_ns - self.computed_frame_start;
        let (correction, window) = self.controller.compute_correction(error);
        self.missed_packets = 0;
        self.clock_correction = correction;
        self.receiver_window = window;
        self.status = InternalStatus::InSync;
        self.update_virtual_clock(ctx);
        debug!("[T] hop={} e={} u={} w={}", pkt[2], error, correction, window);
    }

    /// Blocking scan for a beacon while desynchronized. Returns Resynced
    /// on success.
    fn resync_time(&mut self, ctx: &mut MacContext) -> SyncOutcome {
        info!("[T] resync scan");
        let cfg = ctx.config.clone();
        let mut pkt = Packet::new();
        let info = ctx.recv_packet_scanning(&mut pkt, |p, r| {
            if !r.timestamp_valid || !beacon_shape_ok(&cfg, p) {
                return false;
            }
            // Ignore weak beacons: the hop choice is final until desync.
            if r.rssi < cfg.min_neighbor_rssi - SCAN_RSSI_DELTA {
                return false;
            }
            if cfg.static_hop > 0 {
                u16::from(p[2]) + 1 == u16::from(cfg.static_hop)
            } else {
                // Other control phases reuse the same header; the hop
                // field disambiguates.
                u16::from(p[2]) + 1 <= u16::from(cfg.max_hops)
            }
        });

        // All timestamps are measured from this hook point, no correction
        // applies yet.
        self.controller.reset();
        self.computed_frame_start = info.timestamp_ns;
        self.theoretical_frame_start = info.timestamp_ns;
        self.receiver_window = self.controller.receiver_window();
        self.clock_correction = 0;
        self.missed_packets = 0;
        self.status = InternalStatus::Syncing;
        self.update_virtual_clock(ctx);

        self.measured_frame_start = ctx.virtual_clock.corrected(info.timestamp_ns);
        pkt[2] += 1;
        self.rebroadcast(ctx, &pkt);
        ctx.radio_idle();
        let hop = pkt[2];
        ctx.set_hop(hop);
        self.hop = hop;

        // Establish network time from the beacon counter.
        self.packet_counter = packet_counter(&pkt);
        let network_now =
            i64::from(self.packet_counter) * ctx.config.clock_sync_period_ns;
        let slotframe_start = self.slotframe_start_at(hop);
        ctx.network_time.set(slotframe_start, network_now);

        if ctx.config.authenticate_control() {
            let mi = packet_master_index(&pkt);
            let index_valid = ctx.key_manager().attempt_resync(mi);
            let verified = index_valid && {
                let tile = ctx.current_tile(slotframe_start);
                let saved_hop = pkt[2];
                pkt[2] = 0;
                let ocb = ctx.key_manager().timesync_ocb();
                ocb.set_nonce(tile, TIMESYNC_SEQUENCE_NUMBER, mi);
                let ok = matches!(pkt.verify(ocb), Ok(true));
                pkt[2] = saved_hop;
                ok
            };
            if !verified {
                debug!("[T] resync beacon rejected");
                ctx.key_manager().rollback_resync();
                let _ = self.missed_packet(ctx);
                self.status = InternalStatus::Desynchronized;
                return SyncOutcome::StillDesynced;
            }
            if ctx.config.do_master_challenge_authentication {
                // Commit deferred to the challenge-response handshake.
                ctx.key_manager().send_challenge();
            } else {
                ctx.key_manager().commit_resync();
            }
        }

        info!(
            "[T] resynced hop={} counter={} at NT={}",
            hop, self.packet_counter, network_now
        );
        SyncOutcome::Resynced
    }

    /// Account a missed (or rejected) beacon.
    fn missed_packet(&mut self, ctx: &mut MacContext) -> SyncOutcome {
        // Keep network time flowing even without the beacon.
        self.packet_counter = self.packet_counter.wrapping_add(1);
        self.measured_frame_start = ctx.virtual_clock.corrected(self.computed_frame_start);

        self.missed_packets += 1;
        if self.missed_packets >= ctx.config.max_missed_timesyncs {
            info!("[T] lost synchronization");
            self.status = InternalStatus::Desynchronized;
            self.controller.reset();
            // Reset the correction so both conversion directions of the
            // virtual clock are exactly symmetrical for the unbounded
            // desynchronized period.
            self.clock_correction = 0;
            self.update_virtual_clock(ctx);
            return SyncOutcome::Desynced;
        }
        let (correction, window) = self.controller.lost_packet();
        self.clock_correction = correction;
        self.receiver_window = window;
        self.update_virtual_clock(ctx);
        debug!(
            "[T] missed beacon ({}), u={} w={}",
            self.missed_packets, correction, window
        );
        SyncOutcome::InSync
    }

    fn rebroadcast(&self, ctx: &mut MacContext, pkt: &Packet) {
        if pkt[2] >= ctx.config.max_hops {
            return;
        }
        ctx.send_packet_at(pkt, self.measured_frame_start + REBROADCAST_INTERVAL_NS);
    }
}

impl Default for DynamicTimesync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimesyncPhase for DynamicTimesync {
    fn mac_start_hook(&mut self, _ctx: &mut MacContext) {}

    fn execute(&mut self, ctx: &mut MacContext, _slot_start: i64) -> SyncOutcome {
        self.next(ctx);
        ctx.configure_radio();
        let outcome = if self.status == InternalStatus::Desynchronized {
            self.resync_time(ctx)
        } else {
            self.periodic_sync(ctx)
        };

        // Challenge bookkeeping; a failed or timed-out challenge forces a
        // desync regardless of beacon reception.
        if ctx.key_manager().periodic_update() {
            self.status = InternalStatus::Desynchronized;
            self.controller.reset();
            self.clock_correction = 0;
            self.update_virtual_clock(ctx);
            return SyncOutcome::Desynced;
        }
        outcome
    }

    fn slotframe_start(&self) -> i64 {
        self.slotframe_start_at(self.hop)
    }

    fn mac_can_operate(&self) -> bool {
        self.status == InternalStatus::InSync
    }
}
