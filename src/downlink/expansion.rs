//! Schedule expansion: from the implicit schedule to this node's explicit
//! per-slot action table.
//!
//! Expansion is expensive, so it is amortized: each downlink slot between
//! reception and activation processes at most a budget of implicit
//! elements. For streams this node transmits, the expansion also
//! precomputes the wakeup list handed to the stream manager, so blocked
//! application writers fire just before their radio slot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::dataphase::ForwardShare;
use crate::mac::MacContext;
use crate::schedule::{
    Action, BufferHandle, ExplicitScheduleElement, ScheduleElement, ScheduleHeader,
};
use crate::stream::manager::{StreamWakeupInfo, WakeupInfoKind};
use crate::stream::StreamId;
use crate::util::Packet;

/// Budgeted cost of expanding one implicit element.
const SINGLE_EXPANSION_TIME_NS: i64 = 300_000;

pub struct ScheduleExpander {
    expansions_per_slot: usize,
    slots_per_tile: usize,
    superframe_size: usize,

    in_progress: bool,
    complete: bool,
    index: usize,
    activation_tile: u32,
    schedule_slots: usize,

    explicit: Vec<ExplicitScheduleElement>,
    buffers: BTreeMap<u32, BufferHandle>,
    forwarded: BTreeMap<StreamId, ForwardShare>,
    unique_streams: BTreeSet<StreamId>,
    curr_list: Vec<StreamWakeupInfo>,
    next_list: Vec<StreamWakeupInfo>,
}

impl ScheduleExpander {
    pub fn new(ctx: &MacContext) -> Self {
        // Rounded down: the budget must fit the downlink slot.
        let expansions_per_slot =
            (ctx.downlink_slot_duration / SINGLE_EXPANSION_TIME_NS).max(1) as usize;
        Self {
            expansions_per_slot,
            slots_per_tile: ctx.slots_per_tile,
            superframe_size: ctx.config.control_superframe.size(),
            in_progress: false,
            complete: false,
            index: 0,
            activation_tile: 0,
            schedule_slots: 0,
            explicit: Vec::new(),
            buffers: BTreeMap::new(),
            forwarded: BTreeMap::new(),
            unique_streams: BTreeSet::new(),
            curr_list: Vec::new(),
            next_list: Vec::new(),
        }
    }

    pub fn expansions_per_slot(&self) -> usize {
        self.expansions_per_slot
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Begin expanding a freshly received schedule.
    pub fn start(&mut self, header: &ScheduleHeader) {
        if self.in_progress {
            warn!("[SD] expansion restarted while in progress");
        }
        self.in_progress = true;
        self.complete = false;
        self.index = 0;
        self.activation_tile = header.activation_tile;
        self.schedule_slots = header.schedule_tiles as usize * self.slots_per_tile;
        self.explicit = vec![ExplicitScheduleElement::default(); self.schedule_slots];
        self.buffers.clear();
        self.forwarded.clear();
        self.unique_streams.clear();
        self.curr_list.clear();
        self.next_list.clear();
        debug!("[SD] expansion started, {} slots", self.schedule_slots);
    }

    /// Abandon any expansion in progress.
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.complete = false;
        self.explicit.clear();
        self.buffers.clear();
        self.forwarded.clear();
    }

    /// Process up to the per-slot budget of implicit elements. When the
    /// last element is expanded, the wakeup lists are completed and handed
    /// to the stream manager.
    pub fn continue_expansion(&mut self, ctx: &MacContext, schedule: &[ScheduleElement]) {
        if !self.in_progress || self.complete {
            return;
        }
        let my_id = ctx.network_id();
        let budget_end = (self.index + self.expansions_per_slot).min(schedule.len());
        while self.index < budget_end {
            let element = &schedule[self.index];
            self.expand_element(ctx, element, my_id);
            self.index += 1;
        }
        if self.index >= schedule.len() {
            self.complete = true;
            self.in_progress = false;
            self.complete_wakeup_lists(ctx);
            debug!(
                "[SD] expansion complete, {} buffers",
                self.buffers.len()
            );
        }
    }

    fn expand_element(&mut self, ctx: &MacContext, element: &ScheduleElement, my_id: u8) {
        let period_slots = element.period_tiles() as usize * self.slots_per_tile;
        let mut buffer = None;

        let action = if element.id.src == my_id && element.tx == my_id {
            Action::SendStream
        } else if element.id.dst == my_id && element.rx == my_id {
            Action::RecvStream
        } else if element.tx == my_id {
            // Forward a saved multi-hop packet.
            match self.buffers.get(&element.id.key()) {
                Some(b) => buffer = Some(b.clone()),
                // The receive leg always precedes the transmit leg of a
                // path, so the buffer must already exist.
                None => warn!("[SD] expansion missing buffer for {}", element.id),
            }
            let ctr = self.forwarded.entry(element.id).or_default();
            ctr.share += 1;
            ctr.remaining = ctr.share;
            Action::SendBuffer
        } else if element.rx == my_id {
            // Receive and save a multi-hop packet; redundant legs happily
            // share the buffer.
            let handle = self
                .buffers
                .entry(element.id.key())
                .or_insert_with(|| Arc::new(Mutex::new(Packet::new())))
                .clone();
            buffer = Some(handle);
            Action::RecvBuffer
        } else {
            Action::Sleep
        };

        if action == Action::Sleep {
            // Never overwrite an already scheduled slot with sleep.
            return;
        }

        let first_insertion = self.unique_streams.insert(element.id);
        let mut first_slot = true;
        let mut slot = element.offset as usize;
        while slot < self.schedule_slots {
            let mut entry = ExplicitScheduleElement::new(action, element.stream_info());
            entry.buffer = buffer.clone();
            self.explicit[slot] = entry;

            if action == Action::SendStream && first_insertion && first_slot {
                let advance = ctx.stream_mgr.wakeup_advance(element.id);
                if advance > 0 {
                    self.add_stream_to_wakeup_list(ctx, element, advance);
                }
                first_slot = false;
            }
            slot += period_slots;
        }
    }

    /// Compute the absolute wakeup instant of a transmitting stream. A
    /// wakeup advance larger than the offset wraps into the superframe
    /// before activation and lands in the next-superframe list.
    fn add_stream_to_wakeup_list(
        &mut self,
        ctx: &MacContext,
        element: &ScheduleElement,
        advance_ns: i64,
    ) {
        let slot_duration = ctx.data_slot_duration;
        let tile_duration = ctx.config.tile_duration_ns;
        let mut wakeup_slot = element.offset as i64 - advance_ns / slot_duration;
        let negative = wakeup_slot < 0;
        if negative {
            wakeup_slot += (self.superframe_size * self.slots_per_tile) as i64;
        }
        let tile_in_superframe = wakeup_slot as usize / self.slots_per_tile;
        let slack = tile_in_superframe as i64 * ctx.tile_slack;
        let offset_ns = wakeup_slot * slot_duration + slack;
        let period_ns = i64::from(element.period_tiles()) * tile_duration;

        let base_tile = if negative {
            i64::from(self.activation_tile) - self.superframe_size as i64
        } else {
            i64::from(self.activation_tile)
        };
        let activation_network_ns = base_tile * tile_duration;
        let wakeup_local = ctx.network_time.to_local(activation_network_ns) + offset_ns;

        let entry = StreamWakeupInfo {
            kind: WakeupInfoKind::Stream,
            id: element.id,
            wakeup_time_ns: wakeup_local,
            period_ns,
        };
        if negative {
            self.next_list.push(entry);
        } else {
            self.curr_list.push(entry);
        }
    }

    /// Add the downlink-boundary wakeups, sort both lists, and hand them
    /// over.
    fn complete_wakeup_lists(&mut self, ctx: &MacContext) {
        let tile_duration = ctx.config.tile_duration_ns;
        let activation_network_ns = i64::from(self.activation_tile) * tile_duration;
        let activation_local = ctx.network_time.to_local(activation_network_ns);
        let downlink_slots = (ctx.downlink_slot_duration / ctx.data_slot_duration) as usize;
        let superframe_period = self.superframe_size as i64 * tile_duration;
        for tile in 0..self.superframe_size {
            if ctx.config.control_superframe.is_control_downlink(tile) {
                // Wake at the end of the downlink slots of this tile.
                let wakeup_slot = tile * self.slots_per_tile + downlink_slots;
                let offset_ns = wakeup_slot as i64 * ctx.data_slot_duration;
                self.curr_list.push(StreamWakeupInfo {
                    kind: WakeupInfoKind::Downlink,
                    id: StreamId::default(),
                    wakeup_time_ns: activation_local + offset_ns,
                    period_ns: superframe_period,
                });
            }
        }
        self.curr_list.sort_by_key(|w| w.wakeup_time_ns);
        self.next_list.sort_by_key(|w| w.wakeup_time_ns);
        ctx.stream_mgr
            .set_wakeup_lists(self.curr_list.clone(), self.next_list.clone());
    }

    /// The finished explicit schedule and forwarding counters.
    pub fn take_results(
        &mut self,
    ) -> (Vec<ExplicitScheduleElement>, BTreeMap<StreamId, ForwardShare>) {
        debug_assert!(self.complete);
        (
            core::mem::take(&mut self.explicit),
            core::mem::take(&mut self.forwarded),
        )
    }
}
