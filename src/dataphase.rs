//! Data phase: executes the explicit per-slot action table.
//!
//! Each data slot indexes the explicit schedule and performs its action:
//! move a payload between the radio and an application stream, or store /
//! forward the shared buffer of a multi-hop stream. The slot counter runs
//! over every slot of the tile (control slots included, skipped with
//! [`DataPhase::advance_by`]) so schedule offsets and the on-air position
//! stay in lockstep on every node.
//!
//! End-to-end data authentication uses the per-stream cipher with the
//! nonce `(periodIndex, streamSequenceNumber, masterIndex)`: both
//! endpoints derive it from the slot position alone, and forwarding nodes
//! relay the authenticated frame untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::mac::phase::MacPhase;
use crate::mac::MacContext;
use crate::schedule::{Action, ExplicitScheduleElement};
use crate::stream::StreamId;
use crate::util::Packet;

/// Duration of one data slot.
pub const DATA_SLOT_DURATION_NS: i64 = 10_000_000;

/// Per-stream share of the forwarding buffer: `remaining` transmissions
/// before the buffer is cleared to keep stale data from crossing into the
/// next period.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardShare {
    pub share: u8,
    pub remaining: u8,
}

/// The active explicit schedule of this node.
#[derive(Default)]
pub struct ActiveSchedule {
    pub elements: Vec<ExplicitScheduleElement>,
    pub schedule_id: u32,
    pub schedule_tiles: u32,
    pub forwarded: BTreeMap<StreamId, ForwardShare>,
    /// Slot counter within the schedule, counting every slot of the tile;
    /// reset at the activation barrier.
    pub slot: u64,
}

/// Handle shared between the data phase and the schedule distribution
/// phase, which installs new schedules at the activation barrier.
pub type ActiveScheduleHandle = Arc<Mutex<ActiveSchedule>>;

pub struct DataPhase {
    schedule: ActiveScheduleHandle,
    slots_per_tile: u64,
}

impl DataPhase {
    pub fn new(slots_per_tile: usize) -> Self {
        Self {
            schedule: Arc::new(Mutex::new(ActiveSchedule::default())),
            slots_per_tile: slots_per_tile as u64,
        }
    }

    pub fn schedule_handle(&self) -> ActiveScheduleHandle {
        self.schedule.clone()
    }

    /// Install a new explicit schedule; called at the activation tile
    /// barrier by the schedule distribution phase.
    pub fn apply_schedule(
        handle: &ActiveScheduleHandle,
        elements: Vec<ExplicitScheduleElement>,
        schedule_id: u32,
        schedule_tiles: u32,
        forwarded: BTreeMap<StreamId, ForwardShare>,
    ) {
        let mut sched = handle.lock().unwrap();
        sched.elements = elements;
        sched.schedule_id = schedule_id;
        sched.schedule_tiles = schedule_tiles;
        sched.forwarded = forwarded;
        // Activation is a tile boundary barrier: slot zero is the first
        // slot of the activation tile on every node.
        sched.slot = 0;
        info!(
            "[D] schedule {} active, {} slots",
            schedule_id,
            sched.elements.len()
        );
    }

    /// Skip the slots covered by a control phase.
    pub fn advance_by(&mut self, slots: usize) {
        self.schedule.lock().unwrap().slot += slots as u64;
    }

    fn run_slot(&mut self, ctx: &mut MacContext, slot_start: i64) {
        let (slot, element) = {
            let mut sched = self.schedule.lock().unwrap();
            let slot = sched.slot;
            sched.slot += 1;
            if sched.elements.is_empty() {
                return;
            }
            let element = sched.elements[(slot % sched.elements.len() as u64) as usize].clone();
            (slot, element)
        };
        match element.action {
            Action::Sleep => {}
            Action::SendStream => self.send_stream(ctx, &element, slot, slot_start),
            Action::RecvStream => self.recv_stream(ctx, &element, slot, slot_start),
            Action::SendBuffer => self.send_buffer(ctx, &element, slot_start),
            Action::RecvBuffer => self.recv_buffer(ctx, &element, slot_start),
        }
    }

    /// Nonce pieces both endpoints can derive from the slot position.
    fn stream_nonce(&self, ctx: &MacContext, element: &ExplicitScheduleElement, slot: u64) -> (u32, u64) {
        let period_slots =
            u64::from(element.stream.params.period.tiles()) * self.slots_per_tile;
        let period_index = (slot / period_slots) as u32;
        let seq = ctx.stream_mgr.stream_sequence_number(element.stream.id);
        (period_index, seq)
    }

    fn send_stream(
        &mut self,
        ctx: &mut MacContext,
        element: &ExplicitScheduleElement,
        slot: u64,
        slot_start: i64,
    ) {
        let id = element.stream.id;
        // The sequence number advances when the period's last copy is
        // latched, so read the nonce pieces first.
        let (period_index, seq) = self.stream_nonce(ctx, element, slot);
        let mut pkt = Packet::new();
        if !ctx.stream_mgr.send_packet(id, &mut pkt) {
            debug!("[D] stream {id} has nothing to send");
            return;
        }
        if ctx.config.authenticate_data() {
            let mi = ctx.key_manager().master_index();
            let encrypt = ctx.config.encrypt_data_messages;
            let tagged = ctx.stream_mgr.with_stream_cipher(id, |ocb| {
                ocb.set_nonce(period_index, seq, mi);
                if encrypt {
                    pkt.encrypt_and_put_tag(ocb)
                } else {
                    pkt.put_tag(ocb)
                }
            });
            if !matches!(tagged, Some(Ok(()))) {
                debug!("[D] stream {id} payload too large to authenticate");
                return;
            }
        }
        ctx.configure_radio();
        ctx.send_packet_at(&pkt, slot_start);
        ctx.radio_idle();
    }

    fn recv_stream(
        &mut self,
        ctx: &mut MacContext,
        element: &ExplicitScheduleElement,
        slot: u64,
        slot_start: i64,
    ) {
        let id = element.stream.id;
        // Read the nonce pieces before the period can close.
        let (period_index, seq) = self.stream_nonce(ctx, element, slot);
        ctx.configure_radio();
        let mut pkt = Packet::new();
        let window = ctx.config.max_admitted_rcv_window_ns;
        let received = ctx.recv_packet(&mut pkt, slot_start, window);
        ctx.radio_idle();

        let Some(_) = received else {
            ctx.stream_mgr.miss_packet(id);
            return;
        };
        if ctx.config.authenticate_data() {
            let mi = ctx.key_manager().master_index();
            let encrypt = ctx.config.encrypt_data_messages;
            let valid = ctx.stream_mgr.with_stream_cipher(id, |ocb| {
                ocb.set_nonce(period_index, seq, mi);
                if encrypt {
                    pkt.verify_and_decrypt(ocb)
                } else {
                    pkt.verify(ocb)
                }
            });
            if !matches!(valid, Some(Ok(true))) {
                debug!("[D] stream {id} authentication failed");
                ctx.stream_mgr.miss_packet(id);
                return;
            }
        }
        ctx.stream_mgr.receive_packet(id, &pkt);
    }

    fn send_buffer(
        &mut self,
        ctx: &mut MacContext,
        element: &ExplicitScheduleElement,
        slot_start: i64,
    ) {
        let Some(buffer) = &element.buffer else {
            debug!("[D] forwarding slot without a buffer");
            return;
        };
        let pkt = {
            let buf = buffer.lock().unwrap();
            (!buf.is_empty()).then(|| buf.clone())
        };
        if let Some(pkt) = pkt {
            ctx.configure_radio();
            ctx.send_packet_at(&pkt, slot_start);
            ctx.radio_idle();
        }
        // Decrement the buffer share; once every forwarding slot of the
        // period has fired, clear it so stale data cannot leak into the
        // next period.
        let mut sched = self.schedule.lock().unwrap();
        if let Some(ctr) = sched.forwarded.get_mut(&element.stream.id) {
            ctr.remaining = ctr.remaining.saturating_sub(1);
            if ctr.remaining == 0 {
                ctr.remaining = ctr.share;
                buffer.lock().unwrap().clear();
            }
        }
    }

    fn recv_buffer(
        &mut self,
        ctx: &mut MacContext,
        element: &ExplicitScheduleElement,
        slot_start: i64,
    ) {
        let Some(buffer) = &element.buffer else {
            debug!("[D] receive slot without a buffer");
            return;
        };
        ctx.configure_radio();
        let mut pkt = Packet::new();
        let window = ctx.config.max_admitted_rcv_window_ns;
        let received = ctx.recv_packet(&mut pkt, slot_start, window);
        ctx.radio_idle();
        if received.is_some() {
            let mut buf = buffer.lock().unwrap();
            // With redundancy the buffer may already hold this period's
            // copy; the first reception wins.
            if buf.is_empty() {
                *buf = pkt;
            }
        }
    }
}

impl MacPhase for DataPhase {
    fn execute(&mut self, ctx: &mut MacContext, slot_start: i64) {
        self.run_slot(ctx, slot_start);
    }

    fn advance(&mut self, _ctx: &mut MacContext, _slot_start: i64) {
        self.schedule.lock().unwrap().slot += 1;
    }

    fn desync(&mut self, _ctx: &mut MacContext) {
        let mut sched = self.schedule.lock().unwrap();
        sched.elements.clear();
        sched.forwarded.clear();
        sched.schedule_id = 0;
        sched.slot = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::BufferHandle;
    use crate::stream::{StreamInfo, StreamParameters, StreamStatus};

    fn element(action: Action, buffer: Option<BufferHandle>) -> ExplicitScheduleElement {
        let info = StreamInfo::new(
            StreamId::new(1, 3, 0, 1),
            StreamParameters::default(),
            StreamStatus::Established,
        );
        let mut e = ExplicitScheduleElement::new(action, info);
        e.buffer = buffer;
        e
    }

    #[test]
    fn apply_schedule_installs_elements() {
        let phase = DataPhase::new(10);
        let handle = phase.schedule_handle();
        DataPhase::apply_schedule(
            &handle,
            vec![element(Action::Sleep, None)],
            7,
            2,
            BTreeMap::new(),
        );
        let sched = handle.lock().unwrap();
        assert_eq!(sched.schedule_id, 7);
        assert_eq!(sched.elements.len(), 1);
    }

    #[test]
    fn forward_share_clears_buffer_at_period_end() {
        let phase = DataPhase::new(10);
        let handle = phase.schedule_handle();
        let buffer: BufferHandle = Arc::new(Mutex::new(Packet::new()));
        buffer.lock().unwrap().put(&[1, 2, 3]).unwrap();
        let id = StreamId::new(1, 3, 0, 1);
        let mut forwarded = BTreeMap::new();
        forwarded.insert(
            id,
            ForwardShare {
                share: 2,
                remaining: 2,
            },
        );
        DataPhase::apply_schedule(
            &handle,
            vec![element(Action::SendBuffer, Some(buffer.clone()))],
            1,
            1,
            forwarded,
        );
        // Exercise the share bookkeeping directly (no radio in this test).
        {
            let mut sched = handle.lock().unwrap();
            let ctr = sched.forwarded.get_mut(&id).unwrap();
            ctr.remaining -= 1;
            assert_eq!(ctr.remaining, 1);
            ctr.remaining -= 1;
            if ctr.remaining == 0 {
                ctr.remaining = ctr.share;
                buffer.lock().unwrap().clear();
            }
        }
        assert!(buffer.lock().unwrap().is_empty());
        assert_eq!(handle.lock().unwrap().forwarded[&id].remaining, 2);
    }
}
