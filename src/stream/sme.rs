//! Stream Management Elements.
//!
//! An SME is the small uplink message describing a stream lifecycle event.
//! Wire format: `StreamId` (3 B) + `StreamParameters` (2 B) + type (1 B) +
//! sequence number (2 B). The sequence number comes from a global atomic
//! counter and exists purely to diagnose SME losses along the uplink.
//!
//! Challenge SMEs reuse the id and parameter fields as an opaque container
//! for the 4 challenge bytes, so the parameter field is kept raw internally
//! and only parsed where a real parameter block is expected.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::error::PacketError;
use crate::util::Packet;

use super::{StreamId, StreamInfo, StreamParameters};

/// Global SME sequence counter.
static SEQ_COUNTER: AtomicU16 = AtomicU16::new(0);

fn next_seq() -> u16 {
    SEQ_COUNTER.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmeType {
    /// Request to open a new stream.
    Connect = 0,
    /// Request to open a new server.
    Listen = 1,
    /// Request to close the stream or server.
    Closed = 2,
    /// Request to resend the schedule.
    ResendSchedule = 3,
    /// Challenge for master authentication.
    Challenge = 4,
}

impl SmeType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Connect),
            1 => Some(Self::Listen),
            2 => Some(Self::Closed),
            3 => Some(Self::ResendSchedule),
            4 => Some(Self::Challenge),
            _ => None,
        }
    }

    /// SME class for queue keying: types of the same class (and stream)
    /// overwrite each other in the forwarding queue.
    pub fn class(self) -> u8 {
        match self {
            Self::Connect | Self::Listen | Self::Closed => 0,
            Self::ResendSchedule => 1,
            Self::Challenge => 2,
        }
    }
}

impl core::fmt::Display for SmeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Connect => "CONNECT",
            Self::Listen => "LISTEN",
            Self::Closed => "CLOSED",
            Self::ResendSchedule => "RESEND_SCHEDULE",
            Self::Challenge => "CHALLENGE",
        };
        write!(f, "{s}")
    }
}

/// Key for SMEs held in an [`UpdatableQueue`](crate::util::UpdatableQueue):
/// a fresh CONNECT for a stream overwrites a stale CLOSED in place, while a
/// RESEND_SCHEDULE from the same node never collides with either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SmeKey {
    pub id: StreamId,
    pub class: u8,
}

impl SmeKey {
    pub fn new(id: StreamId, ty: SmeType) -> Self {
        Self {
            id,
            class: ty.class(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamManagementElement {
    id: StreamId,
    /// Raw parameter bytes; challenge SMEs smuggle challenge bytes here.
    params_raw: [u8; 2],
    ty: SmeType,
    seq_no: u16,
}

impl StreamManagementElement {
    pub fn new(info: &StreamInfo, ty: SmeType) -> Self {
        Self {
            id: info.id,
            params_raw: info.params.to_bytes(),
            ty,
            seq_no: next_seq(),
        }
    }

    /// A schedule-resend request from `node`.
    pub fn make_resend(node: u8) -> Self {
        Self {
            id: StreamId::new(node, node, 0, 0),
            params_raw: [0; 2],
            ty: SmeType::ResendSchedule,
            seq_no: next_seq(),
        }
    }

    /// A master-authentication challenge from `node`. The 4 challenge bytes
    /// are packed into the dst/port/parameter fields.
    pub fn make_challenge(node: u8, challenge: [u8; 4]) -> Self {
        Self {
            id: StreamId {
                src: node,
                dst: challenge[0],
                src_port: challenge[1] & 0x0f,
                dst_port: challenge[1] >> 4,
            },
            params_raw: [challenge[2], challenge[3]],
            ty: SmeType::Challenge,
            seq_no: next_seq(),
        }
    }

    /// Recover the 4 challenge bytes of a CHALLENGE SME.
    pub fn challenge_bytes(&self) -> [u8; 4] {
        let id = self.id.to_bytes();
        [id[1], id[2], self.params_raw[0], self.params_raw[1]]
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Parsed parameter block; reserved encodings fall back to defaults.
    /// Only meaningful for CONNECT and LISTEN elements, whose parameters
    /// are validated before acceptance.
    pub fn params(&self) -> StreamParameters {
        StreamParameters::from_bytes(self.params_raw).unwrap_or_default()
    }

    pub fn ty(&self) -> SmeType {
        self.ty
    }

    pub fn seq_no(&self) -> u16 {
        self.seq_no
    }

    pub fn key(&self) -> SmeKey {
        SmeKey::new(self.id, self.ty)
    }

    pub const fn wire_size() -> usize {
        3 + 2 + 1 + 2
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put(&self.id.to_bytes())?;
        pkt.put(&self.params_raw)?;
        pkt.put_u8(self.ty as u8)?;
        pkt.put_u16(self.seq_no)
    }

    pub fn deserialize(pkt: &mut Packet) -> Result<Self, PacketError> {
        let mut id = [0u8; 3];
        pkt.get(&mut id)?;
        let mut params_raw = [0u8; 2];
        pkt.get(&mut params_raw)?;
        let ty = pkt.get_u8()?;
        let seq_no = pkt.get_u16()?;
        Ok(Self {
            id: StreamId::from_bytes(id),
            params_raw,
            // Unknown types are rejected by validate_at before this runs.
            ty: SmeType::from_raw(ty).unwrap_or(SmeType::Closed),
            seq_no,
        })
    }

    /// Strict validation of an SME at `offset` inside a received packet,
    /// without consuming it. Bit widths and reserved values are checked
    /// before anything is enqueued.
    pub fn validate_at(pkt: &Packet, offset: usize, max_nodes: u16) -> bool {
        if pkt.size() < offset + Self::wire_size() {
            return false;
        }
        let id = StreamId::from_bytes([pkt[offset], pkt[offset + 1], pkt[offset + 2]]);
        let params_raw = [pkt[offset + 3], pkt[offset + 4]];
        let Some(ty) = SmeType::from_raw(pkt[offset + 5]) else {
            return false;
        };

        match ty {
            SmeType::Connect | SmeType::Listen | SmeType::Closed => {
                if u16::from(id.src) >= max_nodes || u16::from(id.dst) >= max_nodes {
                    return false;
                }
                if StreamParameters::from_bytes(params_raw).is_none() {
                    return false;
                }
                if ty == SmeType::Listen && !id.is_server() {
                    return false;
                }
                true
            }
            SmeType::ResendSchedule => {
                // The master never asks for a resend; the id must be the
                // degenerate (n,n,0,0).
                id.src != 0
                    && id.src == id.dst
                    && u16::from(id.src) < max_nodes
                    && id.src_port == 0
                    && id.dst_port == 0
            }
            SmeType::Challenge => id.src != 0 && u16::from(id.src) < max_nodes,
        }
    }
}
