//! Dynamic-side schedule distribution: reassemble the flooded schedule,
//! expand it, and install it at the activation barrier.
//!
//! Packets are keyed by `(scheduleId, currentPacket)`: the flood repeats
//! each round three times, so reassembly tolerates up to two fully missed
//! rounds. A node that reaches the activation tile without the complete
//! schedule asks the master for a resend and keeps running the old one.

use log::{debug, info, warn};

use crate::dataphase::{ActiveScheduleHandle, DataPhase};
use crate::mac::phase::MacPhase;
use crate::mac::MacContext;
use crate::schedule::{DownlinkElement, InfoType, ScheduleElement, ScheduleHeader, SchedulePacket};
use crate::stream::{StreamId, StreamManagementElement};
use crate::util::Packet;

use super::expansion::ScheduleExpander;
use super::{rebroadcast_interval, DOWNLINK_SEQUENCE_NUMBER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// No schedule in flight; the active one (if any) keeps running.
    Applied,
    /// Collecting packets of a new schedule.
    Receiving,
    /// All packets seen; expansion runs until the activation tile.
    AwaitingActivation,
}

pub struct DynamicScheduleDownlink {
    data_schedule: ActiveScheduleHandle,
    expander: ScheduleExpander,
    rebroadcast_interval_ns: i64,

    status: Status,
    header: ScheduleHeader,
    /// Elements of the schedule being reassembled, by packet index.
    packets: Vec<Vec<ScheduleElement>>,
    received: Vec<bool>,
    /// Id of the last applied schedule; older floods are ignored.
    applied_schedule_id: u32,
}

impl DynamicScheduleDownlink {
    pub fn new(ctx: &MacContext, data_schedule: ActiveScheduleHandle) -> Self {
        Self {
            data_schedule,
            expander: ScheduleExpander::new(ctx),
            rebroadcast_interval_ns: rebroadcast_interval(&ctx.config),
            status: Status::Applied,
            header: ScheduleHeader::default(),
            packets: Vec::new(),
            received: Vec::new(),
            applied_schedule_id: 0,
        }
    }

    fn all_packets_received(&self) -> bool {
        !self.received.is_empty() && self.received.iter().all(|&r| r)
    }

    fn full_schedule(&self) -> Vec<ScheduleElement> {
        let mut elements = Vec::new();
        for packet in &self.packets {
            elements.extend_from_slice(packet);
        }
        elements
    }

    fn handle_header(&mut self, ctx: &mut MacContext, header: &ScheduleHeader) {
        if header.schedule_id <= self.applied_schedule_id {
            // Replayed or stale flood.
            return;
        }
        if self.status == Status::Applied || header.schedule_id != self.header.schedule_id {
            // First packet of a new schedule: reset reassembly.
            self.header = *header;
            self.packets = vec![Vec::new(); header.total_packets as usize];
            self.received = vec![false; header.total_packets as usize];
            self.status = Status::Receiving;
            self.expander.reset();
            info!(
                "[SD] receiving schedule {} ({} packets, activation tile {})",
                header.schedule_id, header.total_packets, header.activation_tile
            );
        }
        let _ = ctx;
    }

    fn handle_packet(&mut self, ctx: &mut MacContext, spkt: SchedulePacket) {
        // Info elements and challenge responses apply immediately,
        // whatever the reassembly state.
        let mut infos: Vec<(StreamId, InfoType)> = Vec::new();
        let mut schedule_elements = Vec::new();
        for element in &spkt.elements {
            match element {
                DownlinkElement::Schedule(e) => schedule_elements.push(*e),
                DownlinkElement::Info { id, ty } => infos.push((*id, *ty)),
                DownlinkElement::Response { .. } => {
                    let _ = ctx.key_manager().verify_response(element);
                }
            }
        }
        ctx.stream_mgr.apply_info_elements(&infos);

        if !spkt.header.is_schedule_packet() {
            return;
        }
        self.handle_header(ctx, &spkt.header);
        if self.status != Status::Receiving
            || spkt.header.schedule_id != self.header.schedule_id
        {
            return;
        }
        let index = spkt.header.current_packet as usize;
        if index >= self.received.len() {
            return;
        }
        if !self.received[index] {
            self.packets[index] = schedule_elements;
            self.received[index] = true;
            debug!(
                "[SD] got schedule packet {}/{}",
                index + 1,
                self.header.total_packets
            );
        }
        if self.all_packets_received() {
            self.status = Status::AwaitingActivation;
            ctx.stream_mgr.set_schedule(&self.full_schedule());
            self.expander.start(&self.header);
        }
    }

    /// Install the fully expanded schedule at the activation barrier.
    fn try_apply(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let current_tile = ctx.current_tile(slot_start);
        if current_tile < self.header.activation_tile {
            return;
        }
        match self.status {
            Status::AwaitingActivation => {
                let schedule = self.full_schedule();
                if !self.expander.is_complete() {
                    warn!("[SD] expansion incomplete at activation, finishing now");
                    while !self.expander.is_complete() {
                        self.expander.continue_expansion(ctx, &schedule);
                    }
                }
                let (explicit, forwarded) = self.expander.take_results();
                DataPhase::apply_schedule(
                    &self.data_schedule,
                    explicit,
                    self.header.schedule_id,
                    u32::from(self.header.schedule_tiles),
                    forwarded,
                );
                ctx.stream_mgr.apply_schedule(&schedule);
                self.applied_schedule_id = self.header.schedule_id;
                self.status = Status::Applied;
                info!(
                    "[SD] schedule {} applied at tile {}",
                    self.applied_schedule_id, current_tile
                );
            }
            Status::Receiving => {
                // The whole flood was missed; ask the master to resend and
                // keep the old schedule running.
                warn!(
                    "[SD] schedule {} incomplete at activation",
                    self.header.schedule_id
                );
                ctx.stream_mgr
                    .enqueue_sme(StreamManagementElement::make_resend(ctx.network_id()));
                self.status = Status::Applied;
            }
            Status::Applied => {}
        }
    }
}

impl MacPhase for DynamicScheduleDownlink {
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) {
        // Apply first: the activation tile is a barrier, packets come
        // after.
        self.try_apply(ctx, slot_start);

        // The flood reaches this node after one rebroadcast per hop.
        let hop = ctx.hop().max(1);
        let expected = slot_start + i64::from(hop - 1) * self.rebroadcast_interval_ns;
        let window = ctx.config.max_admitted_rcv_window_ns;
        ctx.configure_radio();
        let mut pkt = Packet::new();
        let pan_id = ctx.config.pan_id;
        let received =
            ctx.recv_packet_filtered(&mut pkt, expected, window, |p, _| p.check_pan_header(pan_id));

        if let Some(_info) = received {
            // Flood one hop further before parsing.
            if hop < ctx.config.max_hops {
                let resend_at = expected + self.rebroadcast_interval_ns;
                ctx.send_packet_at(&pkt, resend_at);
            }
            ctx.radio_idle();

            if ctx.config.authenticate_control() {
                let tile = ctx.current_tile(slot_start);
                let mi = ctx.key_manager().master_index();
                let ocb = ctx.key_manager().downlink_ocb();
                ocb.set_nonce(tile, DOWNLINK_SEQUENCE_NUMBER, mi);
                if !matches!(pkt.verify(ocb), Ok(true)) {
                    debug!("[SD] schedule packet verification failed");
                    self.advance_expansion(ctx);
                    return;
                }
            }
            match SchedulePacket::deserialize(&mut pkt) {
                Ok(spkt) => self.handle_packet(ctx, spkt),
                Err(_) => debug!("[SD] malformed schedule packet"),
            }
        } else {
            ctx.radio_idle();
        }

        self.advance_expansion(ctx);

        // Stream rekeying work is amortized over downlink slots too.
        if ctx.config.authenticate_data() {
            ctx.stream_mgr.continue_rekeying();
        }
    }

    fn advance(&mut self, ctx: &mut MacContext, slot_start: i64) {
        self.try_apply(ctx, slot_start);
        self.advance_expansion(ctx);
    }

    fn resync(&mut self, _ctx: &mut MacContext) {
        // Whatever was in flight predates the resync.
        self.status = Status::Applied;
        self.expander.reset();
        self.packets.clear();
        self.received.clear();
    }

    fn desync(&mut self, _ctx: &mut MacContext) {
        self.status = Status::Applied;
        self.header = ScheduleHeader::default();
        self.applied_schedule_id = 0;
        self.expander.reset();
        self.packets.clear();
        self.received.clear();
    }
}

impl DynamicScheduleDownlink {
    fn advance_expansion(&mut self, ctx: &mut MacContext) {
        if self.status == Status::AwaitingActivation && !self.expander.is_complete() {
            let schedule = self.full_schedule();
            self.expander.continue_expansion(ctx, &schedule);
        }
    }
}
