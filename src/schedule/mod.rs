//! Schedule model: the implicit schedule computed by the master, the
//! downlink wire elements that distribute it, and the explicit per-slot
//! action table each node expands locally.

pub mod computation;
pub mod router;

pub use computation::{Schedule, ScheduleComputation};

use std::sync::{Arc, Mutex};

use crate::error::PacketError;
use crate::stream::{StreamId, StreamInfo, StreamParameters, StreamStatus};
use crate::util::packet::{PAN_HEADER_SIZE, TAG_SIZE};
use crate::util::Packet;

// ---------------------------------------------------------------------------
// Downlink element types
// ---------------------------------------------------------------------------

/// Discriminates downlink elements; 4 bits on the wire, so at most 16
/// element types can ever exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownlinkElementType {
    ScheduleElement = 0,
    InfoElement = 1,
    /// Response to a challenge for master authentication.
    Response = 2,
}

/// Action assigned to one data slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// Sleep to save energy.
    #[default]
    Sleep = 0,
    /// Send a packet of a stream opened from this node.
    SendStream = 1,
    /// Receive a packet of a stream opened to this node.
    RecvStream = 2,
    /// Send a saved packet of a multi-hop stream.
    SendBuffer = 3,
    /// Receive and save a packet of a multi-hop stream.
    RecvBuffer = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InfoType {
    /// The master accepted the new server.
    ServerOpened = 0,
    /// The master rejected or closed the server.
    ServerClosed = 1,
    /// The master rejected the new stream.
    StreamReject = 2,
}

impl InfoType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::ServerOpened),
            1 => Some(Self::ServerClosed),
            2 => Some(Self::StreamReject),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule header
// ---------------------------------------------------------------------------

/// Header of every schedule distribution packet, 15 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleHeader {
    pub total_packets: u16,
    pub current_packet: u16,
    pub schedule_id: u32,
    pub activation_tile: u32,
    pub schedule_tiles: u16,
    pub repetition: u8,
}

impl ScheduleHeader {
    pub const fn wire_size() -> usize {
        2 + 2 + 4 + 4 + 2 + 1
    }

    /// Info-only packets carry `total_packets == 0`.
    pub fn is_schedule_packet(&self) -> bool {
        self.total_packets > 0
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put_u16(self.total_packets)?;
        pkt.put_u16(self.current_packet)?;
        pkt.put_u32(self.schedule_id)?;
        pkt.put_u32(self.activation_tile)?;
        pkt.put_u16(self.schedule_tiles)?;
        pkt.put_u8(self.repetition)
    }

    pub fn deserialize(pkt: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self {
            total_packets: pkt.get_u16()?,
            current_packet: pkt.get_u16()?,
            schedule_id: pkt.get_u32()?,
            activation_tile: pkt.get_u32()?,
            schedule_tiles: pkt.get_u16()?,
            repetition: pkt.get_u8()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Schedule element
// ---------------------------------------------------------------------------

/// One routed transmission of a stream: `tx` sends to `rx` at `offset`
/// slots within `period × slotsPerTile`, repeating every period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleElement {
    pub id: StreamId,
    pub params: StreamParameters,
    pub tx: u8,
    pub rx: u8,
    pub offset: u32,
}

impl ScheduleElement {
    /// Single-hop transmission: tx = src, rx = dst.
    pub fn single_hop(id: StreamId, params: StreamParameters) -> Self {
        Self {
            id,
            params,
            tx: id.src,
            rx: id.dst,
            offset: 0,
        }
    }

    pub fn multi_hop(id: StreamId, params: StreamParameters, tx: u8, rx: u8) -> Self {
        Self {
            id,
            params,
            tx,
            rx,
            offset: 0,
        }
    }

    pub fn period_tiles(&self) -> u32 {
        self.params.period.tiles()
    }

    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo::new(self.id, self.params, StreamStatus::Established)
    }
}

/// All downlink element variants share one 10-byte wire slot; the type
/// nibble lives in the high bits of the last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkElement {
    Schedule(ScheduleElement),
    Info { id: StreamId, ty: InfoType },
    Response { node_id: u8, response: [u8; 8] },
}

impl DownlinkElement {
    pub const fn wire_size() -> usize {
        3 + 2 + 5
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        match self {
            Self::Schedule(e) => {
                pkt.put(&e.id.to_bytes())?;
                pkt.put(&e.params.to_bytes())?;
                Self::put_content(pkt, e.tx, e.rx, e.offset, DownlinkElementType::ScheduleElement)
            }
            Self::Info { id, ty } => {
                pkt.put(&id.to_bytes())?;
                pkt.put(&StreamParameters::default().to_bytes())?;
                // The info message rides in the offset field.
                Self::put_content(pkt, 0, 0, *ty as u32, DownlinkElementType::InfoElement)
            }
            Self::Response { node_id, response } => {
                pkt.put_u8(*node_id)?;
                pkt.put(response)?;
                pkt.put_u8((DownlinkElementType::Response as u8) << 4)
            }
        }
    }

    fn put_content(
        pkt: &mut Packet,
        tx: u8,
        rx: u8,
        offset: u32,
        ty: DownlinkElementType,
    ) -> Result<(), PacketError> {
        debug_assert!(offset < (1 << 20));
        pkt.put_u8(tx)?;
        pkt.put_u8(rx)?;
        pkt.put_u8((offset & 0xff) as u8)?;
        pkt.put_u8(((offset >> 8) & 0xff) as u8)?;
        pkt.put_u8((((offset >> 16) & 0x0f) as u8) | ((ty as u8) << 4))
    }

    pub fn deserialize(pkt: &mut Packet) -> Result<Option<Self>, PacketError> {
        if pkt.size() < Self::wire_size() {
            return Err(PacketError::Underflow);
        }
        // Element type rides in the high nibble of the last byte.
        let type_nibble = pkt[Self::wire_size() - 1] >> 4;
        match type_nibble {
            0 | 1 => {
                let mut id = [0u8; 3];
                pkt.get(&mut id)?;
                let mut params = [0u8; 2];
                pkt.get(&mut params)?;
                let tx = pkt.get_u8()?;
                let rx = pkt.get_u8()?;
                let b0 = pkt.get_u8()?;
                let b1 = pkt.get_u8()?;
                let b2 = pkt.get_u8()?;
                let offset =
                    u32::from(b0) | u32::from(b1) << 8 | u32::from(b2 & 0x0f) << 16;
                let id = StreamId::from_bytes(id);
                if type_nibble == 0 {
                    let Some(params) = StreamParameters::from_bytes(params) else {
                        return Ok(None);
                    };
                    Ok(Some(Self::Schedule(ScheduleElement {
                        id,
                        params,
                        tx,
                        rx,
                        offset,
                    })))
                } else {
                    match InfoType::from_raw(offset) {
                        Some(ty) => Ok(Some(Self::Info { id, ty })),
                        None => Ok(None),
                    }
                }
            }
            2 => {
                let node_id = pkt.get_u8()?;
                let mut response = [0u8; 8];
                pkt.get(&mut response)?;
                pkt.discard(1)?;
                Ok(Some(Self::Response { node_id, response }))
            }
            _ => {
                // Unknown element type: skip its slot, reject the element.
                pkt.discard(Self::wire_size())?;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule packet
// ---------------------------------------------------------------------------

/// One downlink distribution frame: pan header, schedule header, and as
/// many downlink elements as fit.
#[derive(Debug, Clone, Default)]
pub struct SchedulePacket {
    pub header: ScheduleHeader,
    pub elements: Vec<DownlinkElement>,
}

impl SchedulePacket {
    /// Number of downlink elements fitting one frame, tag included when
    /// control messages are authenticated.
    pub fn packet_capacity(authenticate: bool) -> usize {
        let tag = if authenticate { TAG_SIZE } else { 0 };
        (crate::util::packet::MAX_PACKET_SIZE
            - tag
            - PAN_HEADER_SIZE
            - ScheduleHeader::wire_size())
            / DownlinkElement::wire_size()
    }

    pub fn serialize(&self, pkt: &mut Packet, pan_id: u16) -> Result<(), PacketError> {
        pkt.put_pan_header(pan_id)?;
        self.header.serialize(pkt)?;
        for e in &self.elements {
            e.serialize(pkt)?;
        }
        Ok(())
    }

    /// Parse a received frame; the pan header must already be verified.
    /// Malformed elements are dropped individually.
    pub fn deserialize(pkt: &mut Packet) -> Result<Self, PacketError> {
        pkt.remove_pan_header()?;
        let header = ScheduleHeader::deserialize(pkt)?;
        let count = pkt.size() / DownlinkElement::wire_size();
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(e) = DownlinkElement::deserialize(pkt)? {
                elements.push(e);
            }
        }
        Ok(Self { header, elements })
    }
}

// ---------------------------------------------------------------------------
// Explicit schedule
// ---------------------------------------------------------------------------

/// Shared forwarding buffer between the receiving and transmitting slots of
/// a multi-hop stream within one schedule period.
pub type BufferHandle = Arc<Mutex<Packet>>;

/// Action table entry for one slot of this node's explicit schedule.
#[derive(Debug, Clone, Default)]
pub struct ExplicitScheduleElement {
    pub action: Action,
    pub stream: StreamInfo,
    pub buffer: Option<BufferHandle>,
}

impl ExplicitScheduleElement {
    pub fn new(action: Action, stream: StreamInfo) -> Self {
        Self {
            action,
            stream,
            buffer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Period, Redundancy};

    fn element() -> ScheduleElement {
        ScheduleElement {
            id: StreamId::new(1, 4, 2, 7),
            params: StreamParameters::new(Redundancy::Double, Period::P10, 32, Direction::Tx),
            tx: 3,
            rx: 4,
            offset: 0xabcde, // needs all 20 bits
        }
    }

    #[test]
    fn header_wire_roundtrip() {
        let h = ScheduleHeader {
            total_packets: 3,
            current_packet: 1,
            schedule_id: 0xdead_beef,
            activation_tile: 1234,
            schedule_tiles: 20,
            repetition: 2,
        };
        let mut pkt = Packet::new();
        h.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), ScheduleHeader::wire_size());
        assert_eq!(ScheduleHeader::deserialize(&mut pkt).unwrap(), h);
    }

    #[test]
    fn schedule_element_wire_roundtrip() {
        let e = DownlinkElement::Schedule(element());
        let mut pkt = Packet::new();
        e.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), DownlinkElement::wire_size());
        assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(e));
    }

    #[test]
    fn info_element_wire_roundtrip() {
        let e = DownlinkElement::Info {
            id: StreamId::new(2, 2, 0, 5),
            ty: InfoType::StreamReject,
        };
        let mut pkt = Packet::new();
        e.serialize(&mut pkt).unwrap();
        assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(e));
    }

    #[test]
    fn response_element_wire_roundtrip() {
        let e = DownlinkElement::Response {
            node_id: 9,
            response: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut pkt = Packet::new();
        e.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), DownlinkElement::wire_size());
        assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), Some(e));
    }

    #[test]
    fn unknown_element_type_is_skipped() {
        let mut pkt = Packet::new();
        pkt.put(&[0u8; 9]).unwrap();
        pkt.put_u8(0xf0).unwrap(); // type nibble 15
        assert_eq!(DownlinkElement::deserialize(&mut pkt).unwrap(), None);
        assert!(pkt.is_empty());
    }

    #[test]
    fn schedule_packet_roundtrip() {
        let spkt = SchedulePacket {
            header: ScheduleHeader {
                total_packets: 1,
                current_packet: 0,
                schedule_id: 7,
                activation_tile: 100,
                schedule_tiles: 10,
                repetition: 0,
            },
            elements: vec![
                DownlinkElement::Schedule(element()),
                DownlinkElement::Info {
                    id: StreamId::new(1, 1, 0, 2),
                    ty: InfoType::ServerOpened,
                },
            ],
        };
        let mut pkt = Packet::new();
        spkt.serialize(&mut pkt, 0xcafe).unwrap();
        assert!(pkt.check_pan_header(0xcafe));
        let parsed = SchedulePacket::deserialize(&mut pkt).unwrap();
        assert_eq!(parsed.header, spkt.header);
        assert_eq!(parsed.elements, spkt.elements);
    }

    #[test]
    fn packet_capacity_counts() {
        // 125 - 5 - 15 = 105 bytes -> 10 elements; minus the 16-byte tag
        // when authenticated -> 8 elements.
        assert_eq!(SchedulePacket::packet_capacity(false), 10);
        assert_eq!(SchedulePacket::packet_capacity(true), 8);
    }
}
