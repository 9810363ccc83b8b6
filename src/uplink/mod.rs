//! Uplink collection: round-robin topology and SME transport toward the
//! master.
//!
//! Exactly one node transmits in each uplink slot, chosen by a
//! deterministic round-robin over all node ids. The round-robin position
//! is a pure function of absolute network time, so every node that knows
//! the time agrees on whose turn it is, synchronized or not.

pub mod dynamic;
pub mod graph;
pub mod master;
pub mod message;
pub mod neighbors;
pub mod topology;

pub use dynamic::DynamicUplink;
pub use graph::{NetworkGraph, NetworkTopology};
pub use master::MasterUplink;
pub use message::{ReceiveUplinkMessage, SendUplinkMessage};
pub use neighbors::NeighborTable;
pub use topology::TopologyElement;

use log::debug;

use crate::mac::MacContext;
use crate::stream::{SmeKey, StreamManagementElement};
use crate::util::{Packet, UpdatableQueue};

/// Gap between consecutive packets of one uplink message.
pub const TRANSMISSION_INTERVAL_NS: i64 = 1_000_000;
/// Worst-case packet arrival plus processing time.
pub const PACKET_ARRIVAL_AND_PROCESSING_NS: i64 = 5_000_000;

/// Round-robin and reception logic shared by both uplink roles.
pub struct UplinkBase {
    my_id: u8,
    nodes_count: u16,
    next_node: u8,
    pub topology_queue: UpdatableQueue<u8, TopologyElement>,
    pub sme_queue: UpdatableQueue<SmeKey, StreamManagementElement>,
    pub neighbors: NeighborTable,
}

impl UplinkBase {
    pub fn new(ctx: &MacContext) -> Self {
        Self {
            my_id: ctx.network_id(),
            nodes_count: ctx.config.max_nodes,
            next_node: (ctx.config.max_nodes - 1) as u8,
            topology_queue: UpdatableQueue::new(),
            sme_queue: UpdatableQueue::new(),
            neighbors: NeighborTable::new(&ctx.config, ctx.network_id(), ctx.hop()),
        }
    }

    /// Node transmitting in this uplink slot, advancing the round-robin.
    pub fn current_node(&mut self) -> u8 {
        let current = self.next_node;
        self.next_node = if self.next_node == 0 {
            (self.nodes_count - 1) as u8
        } else {
            self.next_node - 1
        };
        current
    }

    /// Realign the round-robin from absolute network time: count how many
    /// uplink slots have started since boot.
    pub fn align_to_network_time(&mut self, ctx: &MacContext, network_now_ns: i64) {
        let superframe_duration = ctx.config.control_superframe_duration_ns();
        let tile_duration = ctx.config.tile_duration_ns;
        let uplinks_per_superframe = ctx.config.uplinks_per_superframe() as i64;
        let superframe = ctx.config.control_superframe;

        // Half a data slot of guard makes the division robust to noise.
        let time = network_now_ns + ctx.data_slot_duration / 2;
        let superframe_count = time / superframe_duration;
        let mut within = time % superframe_duration;

        let mut phase = superframe_count * uplinks_per_superframe;
        for i in 0..superframe.size() {
            if within < tile_duration {
                break;
            }
            within -= tile_duration;
            if superframe.is_control_uplink(i) {
                phase += 1;
            }
        }
        self.next_node =
            ((i64::from(self.nodes_count) - 1 - (phase % i64::from(self.nodes_count))) as u16)
                as u8;
        debug!("[U] round robin aligned, next node {}", self.next_node);
    }

    /// Listen for `current_node`'s uplink message and fold it into the
    /// neighbor state; forwarded elements are enqueued when this node is
    /// the assignee.
    pub fn receive_uplink(&mut self, ctx: &mut MacContext, slot_start: i64, current_node: u8) {
        let authenticate = ctx.config.authenticate_control();
        let tile = ctx.current_tile(slot_start);
        let mut message = ReceiveUplinkMessage::new(&ctx.config);
        let window = ctx.config.max_admitted_rcv_window_ns;

        ctx.configure_radio();
        let mut pkt = Packet::new();
        let received = ctx.recv_packet(&mut pkt, slot_start, window);
        let ok = match received {
            Some(info) => {
                let cipher = if authenticate {
                    let mi = ctx.key_manager().master_index();
                    let ocb = ctx.key_manager().uplink_ocb();
                    ocb.set_nonce(tile, 1, mi);
                    Some(ocb)
                } else {
                    None
                };
                message.process_packet(
                    pkt,
                    info.rssi,
                    info.timestamp_valid.then_some(info.timestamp_ns),
                    cipher.map(|c| c as &mut dyn crate::crypto::Aead),
                )
            }
            None => false,
        };

        if !ok {
            self.neighbors.missed_message(current_node);
            ctx.radio_idle();
            debug!("[U] missed uplink of node {current_node}");
            return;
        }

        let sender_topology = message.sender_topology(current_node);
        self.neighbors.received_message(
            current_node,
            message.hop(),
            message.rssi(),
            message.bad_assignee(),
            &sender_topology,
        );
        debug!(
            "[U] <- N={} rssi={} assignee={}",
            current_node,
            message.rssi(),
            message.assignee()
        );

        if message.assignee() == self.my_id {
            self.topology_queue.enqueue(current_node, sender_topology);
            message.deserialize_into(&mut self.topology_queue, &mut self.sme_queue);

            let mut expected = slot_start;
            for i in 1..message.num_packets() {
                // A missed packet aborts the rest of the train.
                expected += PACKET_ARRIVAL_AND_PROCESSING_NS + TRANSMISSION_INTERVAL_NS;
                let mut pkt = Packet::new();
                let Some(info) = ctx.recv_packet(&mut pkt, expected, window) else {
                    break;
                };
                let cipher = if authenticate {
                    let mi = ctx.key_manager().master_index();
                    let ocb = ctx.key_manager().uplink_ocb();
                    ocb.set_nonce(tile, (i + 1) as u64, mi);
                    Some(ocb)
                } else {
                    None
                };
                if !message.process_packet(
                    pkt,
                    info.rssi,
                    info.timestamp_valid.then_some(info.timestamp_ns),
                    cipher.map(|c| c as &mut dyn crate::crypto::Aead),
                ) {
                    break;
                }
                message.deserialize_into(&mut self.topology_queue, &mut self.sme_queue);
            }
        }
        ctx.radio_idle();
    }

    /// Transmit this node's uplink message.
    pub fn send_uplink(
        &mut self,
        ctx: &mut MacContext,
        slot_start: i64,
        hop: u8,
        assignee: u8,
        forward_queues: bool,
    ) {
        let authenticate = ctx.config.authenticate_control();
        let tile = ctx.current_tile(slot_start);
        let (available_topologies, available_smes) = if forward_queues {
            ctx.stream_mgr.dequeue_smes(&mut self.sme_queue);
            (self.topology_queue.len(), self.sme_queue.len())
        } else {
            (0, 0)
        };
        let mut message = SendUplinkMessage::new(
            &ctx.config,
            hop,
            self.neighbors.is_bad_assignee(),
            assignee,
            self.neighbors.my_topology_element().clone(),
            available_topologies,
            available_smes,
        );
        ctx.configure_radio();
        let mut deadline = slot_start;
        for i in 0..message.num_packets() {
            let cipher = if authenticate {
                let mi = ctx.key_manager().master_index();
                let ocb = ctx.key_manager().uplink_ocb();
                ocb.set_nonce(tile, (i + 1) as u64, mi);
                Some(ocb as &mut dyn crate::crypto::Aead)
            } else {
                None
            };
            let pkt = message.next_packet(&mut self.topology_queue, &mut self.sme_queue, cipher);
            ctx.send_packet_at(&pkt, deadline);
            deadline += PACKET_ARRIVAL_AND_PROCESSING_NS + TRANSMISSION_INTERVAL_NS;
        }
        ctx.radio_idle();
        debug!("[U] -> N={} assignee={}", self.my_id, assignee);
    }
}
