//! Master-side schedule distribution.
//!
//! When the scheduler produces a schedule with a new id, the master
//! computes the activation tile, splits the element list into packets, and
//! sends each round of packets three times; the fourth pass applies the
//! schedule locally at the activation boundary. Downlink slots without a
//! schedule to distribute carry info elements and challenge responses.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::dataphase::{ActiveScheduleHandle, DataPhase};
use crate::mac::phase::MacPhase;
use crate::mac::MacContext;
use crate::schedule::{
    DownlinkElement, Schedule, ScheduleComputation, ScheduleElement, ScheduleHeader,
    SchedulePacket,
};
use crate::stream::collection::StreamCollection;
use crate::stream::StreamId;
use crate::util::Packet;

use super::expansion::ScheduleExpander;
use super::{DOWNLINK_SEQUENCE_NUMBER, SCHEDULE_REPETITIONS};

pub struct MasterScheduleDownlink {
    schedule_comp: Arc<ScheduleComputation>,
    collection: Arc<StreamCollection>,
    data_schedule: ActiveScheduleHandle,
    expander: ScheduleExpander,

    header: ScheduleHeader,
    schedule: Vec<ScheduleElement>,
    /// Next element to serialize within the current round.
    position: usize,
    distributing: bool,
    packet_capacity: usize,
}

impl MasterScheduleDownlink {
    pub fn new(
        ctx: &MacContext,
        schedule_comp: Arc<ScheduleComputation>,
        collection: Arc<StreamCollection>,
        data_schedule: ActiveScheduleHandle,
    ) -> Self {
        Self {
            schedule_comp,
            collection,
            data_schedule,
            expander: ScheduleExpander::new(ctx),
            header: ScheduleHeader::default(),
            schedule: Vec::new(),
            position: 0,
            distributing: false,
            packet_capacity: SchedulePacket::packet_capacity(ctx.config.authenticate_control()),
        }
    }

    fn fetch_new_schedule(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let Schedule { elements, id, tiles } = self.schedule_comp.schedule();
        let current_tile = ctx.current_tile(slot_start);
        // An empty schedule still needs one packet for the header alone.
        let num_packets = elements.len().div_ceil(self.packet_capacity).max(1);

        // Earliest activation, before alignment to the outgoing schedule.
        let mut activation_tile = self.activation_tile(ctx, current_tile, num_packets);

        let last_tiles = u32::from(self.header.schedule_tiles);
        if last_tiles > 0 {
            // Align to a boundary of the previous schedule so periods and
            // offsets carry over seamlessly.
            let last_activation = self.header.activation_tile;
            if current_tile < last_activation {
                warn!(
                    "[SD] currentTile={current_tile} < lastActivationTile={last_activation}"
                );
            }
            let mut aligned = last_activation
                + (activation_tile + last_tiles - 1 - last_activation) / last_tiles * last_tiles;
            // The aligned tile must not be a timesync; postpone by a full
            // old schedule if it is.
            if ctx.num_timesyncs(aligned + 1) - ctx.num_timesyncs(aligned) > 0 {
                aligned += last_tiles;
            }
            if ctx.num_timesyncs(aligned + 1) - ctx.num_timesyncs(aligned) > 0 {
                warn!("[SD] two consecutive timesyncs at tile {aligned}");
            }
            activation_tile = aligned;
        }

        self.header = ScheduleHeader {
            total_packets: num_packets as u16,
            current_packet: 0,
            schedule_id: id,
            activation_tile,
            schedule_tiles: tiles as u16,
            repetition: 0,
        };
        self.schedule = elements;
        self.position = 0;
        self.distributing = true;

        // Local bookkeeping starts immediately: endpoint creation for the
        // pending schedule and the amortized expansion.
        ctx.stream_mgr.set_schedule(&self.schedule);
        self.expander.start(&self.header);
        info!(
            "[SD] distributing schedule {} ({} elements, {} packets, activation tile {})",
            id,
            self.schedule.len(),
            num_packets,
            activation_tile
        );
    }

    /// Earliest tile that leaves room for `3 * num_packets` downlinks, is
    /// aligned to a control superframe, and is not a timesync. Downlinks
    /// occupied by timesyncs do not count, and accounting for them can
    /// encompass even more timesyncs, so the computation iterates.
    fn activation_tile(&self, ctx: &MacContext, current_tile: u32, num_packets: usize) -> u32 {
        let mut num_downlinks = (u32::from(SCHEDULE_REPETITIONS)) * num_packets as u32;
        // No packet goes out in the current tile.
        let first_tile = current_tile + 1;

        let cs = ctx.config.control_superframe;
        let cs_size = cs.size() as u32;
        let cs_downlinks = cs.count_downlink_slots() as u32;

        // Align to the beginning of a control superframe, consuming the
        // downlinks passed on the way.
        let mut activation_tile = first_tile;
        let phase = first_tile % cs_size;
        if phase != 0 {
            for i in phase..cs_size {
                if cs.is_control_downlink(i as usize) && num_downlinks > 0 {
                    num_downlinks -= 1;
                }
                activation_tile += 1;
            }
        }

        let mut begin = first_tile;
        let mut i = 0;
        loop {
            assert!(i < 10, "activation tile refinement does not converge");
            i += 1;

            let full_superframes = num_downlinks / cs_downlinks;
            activation_tile += full_superframes * cs_size;
            num_downlinks -= full_superframes * cs_downlinks;

            let mut remaining = 0;
            if num_downlinks > 0 {
                // A partial superframe still advances activation by a full
                // one (alignment), leaving some downlinks free.
                activation_tile += cs_size;
                remaining = cs_downlinks - num_downlinks;
            }

            let num_timesyncs = ctx.num_timesyncs(activation_tile) - ctx.num_timesyncs(begin);
            let activation_is_timesync =
                ctx.num_timesyncs(activation_tile + 1) - ctx.num_timesyncs(activation_tile) == 1;

            if num_timesyncs > remaining {
                // Timesyncs ate more downlinks than were spare; go around
                // again from here.
                num_downlinks = num_timesyncs - remaining;
                begin = activation_tile;
            } else if activation_is_timesync {
                // The activation tile itself must not be a timesync; the
                // next superframe cannot start with one too.
                activation_tile += cs_size;
                break;
            } else {
                break;
            }
        }
        activation_tile
    }

    fn send_schedule_packet(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let mut spkt = SchedulePacket {
            header: self.header,
            elements: Vec::new(),
        };
        let mut used = 0;
        while used < self.packet_capacity && self.position < self.schedule.len() {
            spkt.elements
                .push(DownlinkElement::Schedule(self.schedule[self.position]));
            self.position += 1;
            used += 1;
        }
        // Fill the remaining capacity with info elements and challenge
        // responses.
        let mut extra = self.pending_extras(ctx, self.packet_capacity - used);
        spkt.elements.append(&mut extra);

        self.transmit(ctx, &spkt, slot_start);

        self.header.current_packet += 1;
        if self.header.current_packet >= self.header.total_packets {
            self.position = 0;
            self.header.current_packet = 0;
            self.header.repetition += 1;
        }
        debug!(
            "[SD] sent schedule packet {}/{} rep {}",
            self.header.current_packet, self.header.total_packets, self.header.repetition
        );
    }

    fn send_info_packet(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let elements = self.pending_extras(ctx, self.packet_capacity);
        if elements.is_empty() {
            return;
        }
        let spkt = SchedulePacket {
            // Info-only packets have totalPackets == 0.
            header: ScheduleHeader {
                schedule_id: self.header.schedule_id,
                ..Default::default()
            },
            elements,
        };
        self.transmit(ctx, &spkt, slot_start);
    }

    fn pending_extras(&mut self, ctx: &mut MacContext, room: usize) -> Vec<DownlinkElement> {
        let mut extras = Vec::new();
        if room == 0 {
            return extras;
        }
        if ctx.key_manager().challenges_present() {
            extras.append(&mut ctx.key_manager().solve_challenges());
            extras.truncate(room);
        }
        let infos = self.collection.dequeue_info(room - extras.len());
        let info_elements: Vec<(StreamId, crate::schedule::InfoType)> = infos.clone();
        for (id, ty) in infos {
            extras.push(DownlinkElement::Info { id, ty });
        }
        // The master's own stream manager learns the infos right away.
        ctx.stream_mgr.apply_info_elements(&info_elements);
        extras
    }

    fn transmit(&mut self, ctx: &mut MacContext, spkt: &SchedulePacket, slot_start: i64) {
        let mut pkt = Packet::new();
        if spkt.serialize(&mut pkt, ctx.config.pan_id).is_err() {
            warn!("[SD] schedule packet overflow");
            return;
        }
        if ctx.config.authenticate_control() {
            pkt.reserve_tag();
            let tile = ctx.current_tile(slot_start);
            let mi = ctx.key_manager().master_index();
            let ocb = ctx.key_manager().downlink_ocb();
            ocb.set_nonce(tile, DOWNLINK_SEQUENCE_NUMBER, mi);
            if pkt.put_tag(ocb).is_err() {
                warn!("[SD] schedule packet overflow");
                return;
            }
        }
        ctx.configure_radio();
        ctx.send_packet_at(&pkt, slot_start);
        ctx.radio_idle();
    }

    /// Apply the schedule locally once the activation tile is reached.
    fn try_apply(&mut self, ctx: &mut MacContext, slot_start: i64) -> bool {
        let current_tile = ctx.current_tile(slot_start);
        if current_tile < self.header.activation_tile {
            return false;
        }
        if !self.expander.is_complete() {
            // Late: finish in one go rather than miss the barrier.
            warn!("[SD] expansion incomplete at activation, finishing now");
            while !self.expander.is_complete() {
                self.expander.continue_expansion(ctx, &self.schedule);
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
        ctx.stream_mgr.apply_schedule(&self.schedule);
        info!(
            "[SD] schedule {} applied at tile {}",
            self.header.schedule_id, current_tile
        );
        true
    }
}

impl MacPhase for MasterScheduleDownlink {
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) {
        if self.schedule_comp.schedule_id() != self.header.schedule_id {
            // A new schedule is ready: pick it up and wait for the next
            // downlink before sending the first packet.
            self.fetch_new_schedule(ctx, slot_start);
            return;
        }
        if !self.distributing {
            self.send_info_packet(ctx, slot_start);
            return;
        }
        self.expander.continue_expansion(ctx, &self.schedule);
        if self.header.repetition < SCHEDULE_REPETITIONS {
            self.send_schedule_packet(ctx, slot_start);
        } else if self.try_apply(ctx, slot_start) {
            self.schedule_comp.schedule_applied();
            self.distributing = false;
        }
    }

    // The master can neither resync nor desync.
}
