//! Master-side timesync: transmit the beacon once per clock-sync period.
//!
//! The master is the time source: its local clock is network time, it
//! never resynchronizes and never desynchronizes.

use log::debug;

use crate::mac::phase::{SyncOutcome, TimesyncPhase};
use crate::mac::MacContext;

use super::{build_sync_packet, TIMESYNC_SEQUENCE_NUMBER};

/// Delay between startup and the first beacon.
const INITIALIZATION_DELAY_NS: i64 = 1_000_000;

pub struct MasterTimesync {
    slotframe_time: i64,
    packet_counter: u32,
}

impl MasterTimesync {
    pub fn new() -> Self {
        Self {
            slotframe_time: 0,
            packet_counter: 0,
        }
    }

    fn next(&mut self, ctx: &MacContext) {
        self.slotframe_time += ctx.config.clock_sync_period_ns;
        self.packet_counter = self.packet_counter.wrapping_add(1);
    }
}

impl Default for MasterTimesync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimesyncPhase for MasterTimesync {
    fn mac_start_hook(&mut self, ctx: &mut MacContext) {
        self.slotframe_time = ctx.clock.now() + INITIALIZATION_DELAY_NS;
        // Network time zero is the first slotframe start.
        ctx.network_time.set(self.slotframe_time, 0);
        // Compensate the next() performed by the first execute.
        self.slotframe_time -= ctx.config.clock_sync_period_ns;
        self.packet_counter = u32::MAX;
    }

    fn execute(&mut self, ctx: &mut MacContext, _slot_start: i64) -> SyncOutcome {
        self.next(ctx);
        ctx.configure_radio();

        // Key rotation is paced by timesync periods.
        let _ = ctx.key_manager().periodic_update();

        let authenticate = ctx.config.authenticate_control();
        let master_index = authenticate.then(|| ctx.key_manager().master_index());
        let mut pkt = build_sync_packet(&ctx.config, 0, self.packet_counter, master_index)
            .expect("beacon fits the frame");
        if authenticate {
            pkt.reserve_tag();
            let tile = ctx.current_tile(self.slotframe_time);
            let mi = master_index.unwrap_or(0);
            let ocb = ctx.key_manager().timesync_ocb();
            ocb.set_nonce(tile, TIMESYNC_SEQUENCE_NUMBER, mi);
            pkt.put_tag(ocb).expect("beacon fits the frame");
        }

        ctx.send_packet_at(&pkt, self.slotframe_time);
        ctx.radio_idle();
        debug!(
            "[T] beacon counter={} at {}",
            self.packet_counter, self.slotframe_time
        );
        SyncOutcome::InSync
    }

    fn slotframe_start(&self) -> i64 {
        self.slotframe_time
    }

    fn mac_can_operate(&self) -> bool {
        true
    }
}
