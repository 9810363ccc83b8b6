//! Uplink message: the (possibly multi-packet) frame train a node sends in
//! its uplink slot.
//!
//! First packet: pan header, uplink header (hop with the bad-assignee flag
//! in the high bit, assignee, element counts), the sender's neighbor
//! bitmap(s), then forwarded topologies and SMEs. Follow-up packets carry
//! only the pan header and more elements. Topologies always precede SMEs
//! and elements never straddle packets, so both ends can compute the exact
//! per-packet layout from the header alone — which is also how received
//! packets are validated byte-for-byte before anything is enqueued.

use log::debug;

use crate::config::NetworkConfig;
use crate::crypto::Aead;
use crate::stream::{SmeKey, StreamManagementElement};
use crate::util::packet::{MAX_PACKET_SIZE, PAN_HEADER_SIZE, TAG_SIZE};
use crate::util::{Packet, RuntimeBitset, UpdatableQueue};

use super::topology::TopologyElement;

/// Uplink header size: hop/flag, assignee, numTopology, numSME.
pub const UPLINK_HEADER_SIZE: usize = 4;

/// Payload capacity of the first packet of an uplink message.
pub fn first_uplink_packet_capacity(config: &NetworkConfig) -> usize {
    let bitmaps = if config.use_weak_topologies { 2 } else { 1 };
    let tag = if config.authenticate_control() { TAG_SIZE } else { 0 };
    MAX_PACKET_SIZE
        - PAN_HEADER_SIZE
        - UPLINK_HEADER_SIZE
        - bitmaps * config.neighbor_bitmask_size()
        - tag
}

/// Payload capacity of the second and following packets.
pub fn other_uplink_packet_capacity(config: &NetworkConfig) -> usize {
    let tag = if config.authenticate_control() { TAG_SIZE } else { 0 };
    MAX_PACKET_SIZE - PAN_HEADER_SIZE - tag
}

/// Per-packet element placement: topologies first across the packet train,
/// then SMEs, never splitting an element. Returns the per-packet counts;
/// elements that do not fit within `max_packets` are dropped from the
/// counts.
fn allocate_elements(
    topologies: usize,
    smes: usize,
    first_capacity: usize,
    other_capacity: usize,
    max_packets: usize,
    topology_size: usize,
    sme_size: usize,
) -> Vec<(usize, usize)> {
    let mut layout = Vec::new();
    let mut remaining_topologies = topologies;
    let mut remaining_smes = smes;
    let mut capacity = first_capacity;
    loop {
        let t = remaining_topologies.min(capacity / topology_size);
        capacity -= t * topology_size;
        remaining_topologies -= t;
        let mut s = 0;
        // No SMEs as long as there are topologies left to place.
        if remaining_topologies == 0 {
            s = remaining_smes.min(capacity / sme_size);
            capacity -= s * sme_size;
            remaining_smes -= s;
        }
        layout.push((t, s));
        if (remaining_topologies == 0 && remaining_smes == 0) || layout.len() >= max_packets {
            break;
        }
        capacity = other_capacity;
    }
    layout
}

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

pub struct SendUplinkMessage {
    pan_id: u16,
    authenticate: bool,
    encrypt: bool,
    topology_size: usize,
    /// Per-packet (topologies, SMEs) placement.
    layout: Vec<(usize, usize)>,
    next_packet_index: usize,
    header: [u8; UPLINK_HEADER_SIZE],
    my_topology: TopologyElement,
}

impl SendUplinkMessage {
    /// Plan an uplink message. `available_*` are the queue sizes; the plan
    /// guarantees room for `guaranteedTopologies`, fills with SMEs, then
    /// tops up with further topologies.
    pub fn new(
        config: &NetworkConfig,
        hop: u8,
        bad_assignee: bool,
        assignee: u8,
        my_topology: TopologyElement,
        available_topologies: usize,
        available_smes: usize,
    ) -> Self {
        let topology_size =
            TopologyElement::max_size(config.neighbor_bitmask_size(), config.use_weak_topologies);
        let sme_size = StreamManagementElement::wire_size();
        let first_capacity = first_uplink_packet_capacity(config);
        let other_capacity = other_uplink_packet_capacity(config);
        let max_packets = config.num_uplink_packets as usize;

        let total_bytes = first_capacity + (max_packets - 1) * other_capacity;
        let mut num_topologies =
            (config.guaranteed_topologies as usize).min(available_topologies);
        let remaining_topologies = available_topologies - num_topologies;
        let max_smes = (total_bytes - num_topologies * topology_size) / sme_size;
        let num_smes = available_smes.min(max_smes);
        let unused = total_bytes - num_topologies * topology_size - num_smes * sme_size;
        num_topologies += (unused / topology_size).min(remaining_topologies);

        let layout = allocate_elements(
            num_topologies,
            num_smes,
            first_capacity,
            other_capacity,
            max_packets,
            topology_size,
            sme_size,
        );
        let placed_topologies: usize = layout.iter().map(|p| p.0).sum();
        let placed_smes: usize = layout.iter().map(|p| p.1).sum();

        let hop_field = if bad_assignee { hop | 0x80 } else { hop };
        Self {
            pan_id: config.pan_id,
            authenticate: config.authenticate_control(),
            encrypt: config.encrypt_control_messages,
            topology_size,
            layout,
            next_packet_index: 0,
            header: [
                hop_field,
                assignee,
                placed_topologies as u8,
                placed_smes as u8,
            ],
            my_topology,
        }
    }

    pub fn num_packets(&self) -> usize {
        self.layout.len()
    }

    /// Build the next packet of the train, dequeueing the planned number
    /// of topologies and SMEs. When authentication is on, the cipher nonce
    /// must be set by the caller before this call.
    pub fn next_packet(
        &mut self,
        topologies: &mut UpdatableQueue<u8, TopologyElement>,
        smes: &mut UpdatableQueue<SmeKey, StreamManagementElement>,
        cipher: Option<&mut dyn Aead>,
    ) -> Packet {
        let (num_topologies, num_smes) = self.layout[self.next_packet_index];
        let mut pkt = Packet::new();
        // The frame is sized to always fit the plan.
        pkt.put_pan_header(self.pan_id).expect("uplink frame overflow");
        if self.authenticate {
            pkt.reserve_tag();
        }
        if self.next_packet_index == 0 {
            pkt.put(&self.header).expect("uplink frame overflow");
            self.my_topology.serialize(&mut pkt).expect("uplink frame overflow");
        }
        for _ in 0..num_topologies {
            let topology = topologies.dequeue().expect("fewer topologies than planned");
            debug_assert_eq!(topology.size(), self.topology_size);
            topology.serialize(&mut pkt).expect("uplink frame overflow");
        }
        for _ in 0..num_smes {
            let sme = smes.dequeue().expect("fewer SMEs than planned");
            sme.serialize(&mut pkt).expect("uplink frame overflow");
        }
        if let Some(cipher) = cipher {
            if self.encrypt {
                pkt.encrypt_and_put_tag(cipher).expect("uplink frame overflow");
            } else if self.authenticate {
                pkt.put_tag(cipher).expect("uplink frame overflow");
            }
        }
        self.next_packet_index += 1;
        pkt
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

pub struct ReceiveUplinkMessage {
    pan_id: u16,
    max_nodes: u16,
    max_hops: u8,
    use_weak: bool,
    authenticate: bool,
    encrypt: bool,
    topology_size: usize,
    sme_size: usize,
    first_capacity: usize,
    other_capacity: usize,
    max_packets: usize,

    packet: Packet,
    received_packets: usize,
    /// Expected per-packet layout, derived from the first header.
    layout: Vec<(usize, usize)>,
    header: [u8; UPLINK_HEADER_SIZE],
    topology: RuntimeBitset,
    weak_topology: Option<RuntimeBitset>,
    rssi: i16,
    timestamp: Option<i64>,
}

impl ReceiveUplinkMessage {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            pan_id: config.pan_id,
            max_nodes: config.max_nodes,
            max_hops: config.max_hops,
            use_weak: config.use_weak_topologies,
            authenticate: config.authenticate_control(),
            encrypt: config.encrypt_control_messages,
            topology_size: TopologyElement::max_size(
                config.neighbor_bitmask_size(),
                config.use_weak_topologies,
            ),
            sme_size: StreamManagementElement::wire_size(),
            first_capacity: first_uplink_packet_capacity(config),
            other_capacity: other_uplink_packet_capacity(config),
            max_packets: config.num_uplink_packets as usize,
            packet: Packet::new(),
            received_packets: 0,
            layout: Vec::new(),
            header: [0; UPLINK_HEADER_SIZE],
            topology: RuntimeBitset::new(config.max_nodes as usize),
            weak_topology: None,
            rssi: -120,
            timestamp: None,
        }
    }

    /// Validate one received frame of the train. When authentication is on,
    /// the cipher nonce must be set by the caller before this call. An
    /// invalid frame is treated as not received.
    pub fn process_packet(
        &mut self,
        mut pkt: Packet,
        rssi: i16,
        timestamp: Option<i64>,
        cipher: Option<&mut dyn Aead>,
    ) -> bool {
        if let Some(cipher) = cipher {
            let valid = if self.encrypt {
                pkt.verify_and_decrypt(cipher)
            } else {
                pkt.verify(cipher)
            };
            if !matches!(valid, Ok(true)) {
                debug!("[U] uplink tag verification failed");
                return false;
            }
        }
        let ok = if self.received_packets == 0 {
            self.check_first_packet(&mut pkt)
        } else {
            self.check_other_packet(&mut pkt)
        };
        if !ok {
            return false;
        }
        self.packet = pkt;
        self.rssi = rssi;
        self.timestamp = timestamp;
        self.received_packets += 1;
        true
    }

    pub fn num_packets(&self) -> usize {
        self.layout.len()
    }

    pub fn hop(&self) -> u8 {
        self.header[0] & 0x7f
    }

    pub fn bad_assignee(&self) -> bool {
        self.header[0] & 0x80 != 0
    }

    pub fn assignee(&self) -> u8 {
        self.header[1]
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// The sender's own topology element.
    pub fn sender_topology(&self, sender: u8) -> TopologyElement {
        TopologyElement::from_bitsets(sender, self.topology.clone(), self.weak_topology.clone())
    }

    /// Extract the validated forwarded topologies and SMEs of the current
    /// packet into the local queues.
    pub fn deserialize_into(
        &mut self,
        topologies: &mut UpdatableQueue<u8, TopologyElement>,
        smes: &mut UpdatableQueue<SmeKey, StreamManagementElement>,
    ) {
        debug_assert!(self.received_packets > 0);
        let (num_topologies, num_smes) = self.layout[self.received_packets - 1];
        let bitmask_size = self.max_nodes as usize / 8;
        for _ in 0..num_topologies {
            let Ok(topology) =
                TopologyElement::deserialize(&mut self.packet, bitmask_size, self.use_weak)
            else {
                return;
            };
            topologies.enqueue(topology.id(), topology);
        }
        for _ in 0..num_smes {
            let Ok(sme) = StreamManagementElement::deserialize(&mut self.packet) else {
                return;
            };
            smes.enqueue(sme.key(), sme);
        }
    }

    fn check_first_packet(&mut self, pkt: &mut Packet) -> bool {
        let bitmaps = if self.use_weak { 2 } else { 1 };
        let bitmask_size = self.max_nodes as usize / 8;
        let header_size = PAN_HEADER_SIZE + UPLINK_HEADER_SIZE + bitmaps * bitmask_size;
        if pkt.size() < header_size {
            return false;
        }
        if !pkt.check_pan_header(self.pan_id) {
            return false;
        }
        pkt.remove_pan_header().expect("size checked");
        let mut header = [0u8; UPLINK_HEADER_SIZE];
        pkt.get(&mut header).expect("size checked");
        let hop = header[0] & 0x7f;
        if hop == 0 || hop > self.max_hops {
            return false;
        }
        if u16::from(header[1]) >= self.max_nodes {
            return false;
        }
        let mut bitmap = vec![0u8; bitmask_size];
        pkt.get(&mut bitmap).expect("size checked");
        let topology = RuntimeBitset::from_bytes(&bitmap);
        let weak_topology = if self.use_weak {
            pkt.get(&mut bitmap).expect("size checked");
            Some(RuntimeBitset::from_bytes(&bitmap))
        } else {
            None
        };

        let layout = allocate_elements(
            header[2] as usize,
            header[3] as usize,
            self.first_capacity,
            self.other_capacity,
            self.max_packets,
            self.topology_size,
            self.sme_size,
        );
        // The advertised counts must actually fit the packet train.
        let placed: (usize, usize) = layout
            .iter()
            .fold((0, 0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        if placed != (header[2] as usize, header[3] as usize) {
            return false;
        }
        if !self.check_elements(pkt, layout[0]) {
            return false;
        }
        self.header = header;
        self.topology = topology;
        self.weak_topology = weak_topology;
        self.layout = layout;
        true
    }

    fn check_other_packet(&mut self, pkt: &mut Packet) -> bool {
        if self.received_packets >= self.layout.len() {
            return false;
        }
        if pkt.size() < PAN_HEADER_SIZE || !pkt.check_pan_header(self.pan_id) {
            return false;
        }
        pkt.remove_pan_header().expect("size checked");
        let expected = self.layout[self.received_packets];
        self.check_elements(pkt, expected)
    }

    /// Strict content check: the packet must hold exactly the expected
    /// elements, each individually valid.
    fn check_elements(&self, pkt: &Packet, expected: (usize, usize)) -> bool {
        let (num_topologies, num_smes) = expected;
        let expected_size = num_topologies * self.topology_size + num_smes * self.sme_size;
        if pkt.size() != expected_size {
            return false;
        }
        for i in 0..num_topologies {
            let offset = i * self.topology_size;
            if !TopologyElement::validate_at(pkt, offset, self.max_nodes, self.use_weak) {
                return false;
            }
        }
        for i in 0..num_smes {
            let offset = num_topologies * self.topology_size + i * self.sme_size;
            if !StreamManagementElement::validate_at(pkt, offset, self.max_nodes) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        Direction, Period, Redundancy, SmeType, StreamId, StreamInfo, StreamParameters,
        StreamStatus,
    };

    fn config() -> NetworkConfig {
        NetworkConfig::base(3, 6, 32)
    }

    fn topology(id: u8) -> TopologyElement {
        let mut t = TopologyElement::new(id, 32, false);
        t.add_node(0);
        t.add_node(id.wrapping_add(1));
        t
    }

    fn sme(src: u8) -> StreamManagementElement {
        let info = StreamInfo::new(
            StreamId::new(src, 0, 1, 2),
            StreamParameters::new(Redundancy::None, Period::P2, 8, Direction::Tx),
            StreamStatus::Connecting,
        );
        StreamManagementElement::new(&info, SmeType::Connect)
    }

    fn roundtrip(
        cfg: &NetworkConfig,
        topologies: Vec<TopologyElement>,
        smes: Vec<StreamManagementElement>,
    ) -> (ReceiveUplinkMessage, UpdatableQueue<u8, TopologyElement>, UpdatableQueue<SmeKey, StreamManagementElement>)
    {
        let mut tq = UpdatableQueue::new();
        for t in topologies {
            tq.enqueue(t.id(), t);
        }
        let mut sq = UpdatableQueue::new();
        for s in smes {
            sq.enqueue(s.key(), s);
        }
        let mut send = SendUplinkMessage::new(
            cfg,
            2,
            false,
            1,
            topology(3),
            tq.len(),
            sq.len(),
        );
        let mut recv = ReceiveUplinkMessage::new(cfg);
        let mut out_t = UpdatableQueue::new();
        let mut out_s = UpdatableQueue::new();
        for _ in 0..send.num_packets() {
            let pkt = send.next_packet(&mut tq, &mut sq, None);
            assert!(recv.process_packet(pkt, -60, Some(1000), None));
            recv.deserialize_into(&mut out_t, &mut out_s);
        }
        (recv, out_t, out_s)
    }

    #[test]
    fn empty_message_roundtrip() {
        let cfg = config();
        let (recv, t, s) = roundtrip(&cfg, vec![], vec![]);
        assert_eq!(recv.num_packets(), 1);
        assert_eq!(recv.hop(), 2);
        assert_eq!(recv.assignee(), 1);
        assert!(!recv.bad_assignee());
        assert!(recv.sender_topology(3).neighbors().get(0));
        assert!(t.is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn forwarded_elements_roundtrip() {
        let cfg = config();
        let (_, t, s) = roundtrip(
            &cfg,
            vec![topology(5), topology(6)],
            vec![sme(5), sme(6), sme(7)],
        );
        assert_eq!(t.len(), 2);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn bad_assignee_travels_in_hop_high_bit() {
        let cfg = config();
        let mut tq = UpdatableQueue::new();
        let mut sq = UpdatableQueue::new();
        let mut send = SendUplinkMessage::new(&cfg, 3, true, 2, topology(3), 0, 0);
        let pkt = send.next_packet(&mut tq, &mut sq, None);
        let mut recv = ReceiveUplinkMessage::new(&cfg);
        assert!(recv.process_packet(pkt, -60, None, None));
        assert!(recv.bad_assignee());
        assert_eq!(recv.hop(), 3);
    }

    #[test]
    fn guaranteed_topologies_fit_one_packet() {
        // guaranteedTopologies = K forwarded topologies fit in exactly one
        // packet for maxNodes = 32.
        let cfg = config();
        let k = cfg.guaranteed_topologies as usize;
        let topologies: Vec<_> = (0..k as u8).map(|i| topology(i + 4)).collect();
        let mut tq = UpdatableQueue::new();
        for t in topologies {
            tq.enqueue(t.id(), t);
        }
        let mut sq = UpdatableQueue::new();
        let mut send = SendUplinkMessage::new(&cfg, 2, false, 1, topology(3), k, 0);
        assert_eq!(send.num_packets(), 1);
        let pkt = send.next_packet(&mut tq, &mut sq, None);
        let mut recv = ReceiveUplinkMessage::new(&cfg);
        assert!(recv.process_packet(pkt, -60, None, None));
        let mut out_t = UpdatableQueue::new();
        let mut out_s = UpdatableQueue::new();
        recv.deserialize_into(&mut out_t, &mut out_s);
        assert_eq!(out_t.len(), k);
    }

    #[test]
    fn multi_packet_message() {
        let mut cfg = config();
        cfg.num_uplink_packets = 2;
        // More SMEs than one packet can carry.
        let smes: Vec<_> = (0..20).map(sme).collect();
        let (recv, _, s) = roundtrip(&cfg, vec![], smes);
        assert_eq!(recv.num_packets(), 2);
        assert_eq!(s.len(), 20);
    }

    #[test]
    fn excess_elements_are_dropped_not_split() {
        let cfg = config(); // one uplink packet
        let smes: Vec<_> = (0..40).map(sme).collect();
        let (_, _, s) = roundtrip(&cfg, vec![], smes);
        // first capacity = 125-5-4-4 = 112 -> 14 SMEs of 8 bytes
        assert_eq!(s.len(), 14);
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let cfg = config();
        let mut tq = UpdatableQueue::new();
        let mut sq = UpdatableQueue::new();
        let mut send = SendUplinkMessage::new(&cfg, 2, false, 1, topology(3), 0, 0);
        let mut pkt = send.next_packet(&mut tq, &mut sq, None);
        pkt[5] = 0; // hop = 0 is invalid
        let mut recv = ReceiveUplinkMessage::new(&cfg);
        assert!(!recv.process_packet(pkt, -60, None, None));
    }

    #[test]
    fn advertised_count_must_match_content() {
        let cfg = config();
        let mut tq = UpdatableQueue::new();
        let mut sq = UpdatableQueue::new();
        let mut send = SendUplinkMessage::new(&cfg, 2, false, 1, topology(3), 0, 0);
        let mut pkt = send.next_packet(&mut tq, &mut sq, None);
        pkt[7] = 1; // claim one forwarded topology, carry none
        let mut recv = ReceiveUplinkMessage::new(&cfg);
        assert!(!recv.process_packet(pkt, -60, None, None));
    }

    #[test]
    fn authenticated_roundtrip_and_tamper() {
        let mut cfg = config();
        cfg.authenticate_control_messages = true;
        let mut ocb_tx = crate::crypto::AesOcb::new(&[7u8; 16]);
        let mut ocb_rx = crate::crypto::AesOcb::new(&[7u8; 16]);

        let mut tq = UpdatableQueue::new();
        let mut sq = UpdatableQueue::new();
        sq.enqueue(sme(5).key(), sme(5));
        let mut send = SendUplinkMessage::new(&cfg, 2, false, 1, topology(3), 0, 1);
        ocb_tx.set_nonce(9, 1, 0);
        let pkt = send.next_packet(&mut tq, &mut sq, Some(&mut ocb_tx));

        let mut recv = ReceiveUplinkMessage::new(&cfg);
        ocb_rx.set_nonce(9, 1, 0);
        let mut tampered = pkt.clone();
        let last = tampered.size() - 1;
        tampered[last] ^= 1;
        assert!(!recv.process_packet(tampered, -60, None, Some(&mut ocb_rx)));

        let mut recv = ReceiveUplinkMessage::new(&cfg);
        ocb_rx.set_nonce(9, 1, 0);
        assert!(recv.process_packet(pkt, -60, None, Some(&mut ocb_rx)));
    }
}
