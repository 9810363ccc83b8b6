//! Stream identities, parameters and lifecycle states.
//!
//! A stream is identified by `(src, dst, srcPort, dstPort)`; a server is
//! the degenerate identifier with `src == dst` and `srcPort == 0`. The
//! parameter block packs redundancy, period, payload size and direction
//! into the 16-bit wire field used by SMEs and schedule elements.

pub mod collection;
pub mod endpoint;
pub mod manager;
pub mod sme;

pub use collection::{MasterStreamInfo, MasterStreamStatus, StreamChange, StreamCollection, StreamSnapshot};
pub use endpoint::{Server, Stream};
pub use manager::{StreamManager, StreamWakeupInfo};
pub use sme::{SmeKey, SmeType, StreamManagementElement};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StreamId
// ---------------------------------------------------------------------------

/// Stream identifier, 3 bytes on the wire:
/// `src:8 | dst:8 | srcPort:4 | dstPort:4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub src: u8,
    pub dst: u8,
    pub src_port: u8,
    pub dst_port: u8,
}

impl StreamId {
    pub fn new(src: u8, dst: u8, src_port: u8, dst_port: u8) -> Self {
        debug_assert!(src_port < 16 && dst_port < 16);
        Self {
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    /// Identifier of the server endpoint this stream connects to.
    pub fn server_id(&self) -> Self {
        Self::new(self.dst, self.dst, 0, self.dst_port)
    }

    /// A server identifier has `src == dst` and `srcPort == 0`.
    pub fn is_server(&self) -> bool {
        self.src == self.dst && self.src_port == 0
    }

    pub fn is_stream(&self) -> bool {
        !self.is_server()
    }

    /// Unique integer key (useful for maps and forwarding buffers).
    pub fn key(&self) -> u32 {
        u32::from(self.src)
            | u32::from(self.dst) << 8
            | u32::from(self.src_port) << 16
            | u32::from(self.dst_port) << 20
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.src, self.dst, self.src_port | (self.dst_port << 4)]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self {
            src: bytes[0],
            dst: bytes[1],
            src_port: bytes[2] & 0x0f,
            dst_port: bytes[2] >> 4,
        }
    }

    /// Padded 16-byte block for per-stream key derivation.
    pub fn to_key_block(self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[..3].copy_from_slice(&self.to_bytes());
        block
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.src, self.dst, self.src_port, self.dst_port
        )
    }
}

// ---------------------------------------------------------------------------
// Stream parameters
// ---------------------------------------------------------------------------

/// Transmission redundancy of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Redundancy {
    None = 0,
    Double = 1,
    Triple = 2,
    DoubleSpatial = 3,
    TripleSpatial = 4,
}

impl Redundancy {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Double),
            2 => Some(Self::Triple),
            3 => Some(Self::DoubleSpatial),
            4 => Some(Self::TripleSpatial),
            _ => None,
        }
    }

    pub fn is_spatial(self) -> bool {
        matches!(self, Self::DoubleSpatial | Self::TripleSpatial)
    }

    /// Number of times each transmission appears in a period.
    pub fn multiplier(self) -> u8 {
        match self {
            Self::None => 1,
            Self::Double | Self::DoubleSpatial => 2,
            Self::Triple | Self::TripleSpatial => 3,
        }
    }
}

/// Stream period, in tiles. Three bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Period {
    P1 = 1,
    P2 = 2,
    P5 = 3,
    P10 = 4,
    P20 = 5,
    P50 = 6,
    P100 = 7,
}

impl Period {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::P1),
            2 => Some(Self::P2),
            3 => Some(Self::P5),
            4 => Some(Self::P10),
            5 => Some(Self::P20),
            6 => Some(Self::P50),
            7 => Some(Self::P100),
            _ => None,
        }
    }

    /// Period length in tiles.
    pub fn tiles(self) -> u32 {
        match self {
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P5 => 5,
            Self::P10 => 10,
            Self::P20 => 20,
            Self::P50 => 50,
            Self::P100 => 100,
        }
    }
}

/// Data direction relative to the client that opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Tx = 0,
    Rx = 1,
}

/// Stream parameter block, 2 bytes on the wire:
/// `redundancy:3 | period:3 | payload:7 | direction:1 | reserved:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParameters {
    pub redundancy: Redundancy,
    pub period: Period,
    pub payload_size: u8,
    pub direction: Direction,
}

impl StreamParameters {
    pub fn new(redundancy: Redundancy, period: Period, payload_size: u8, direction: Direction) -> Self {
        debug_assert!(payload_size < 128);
        Self {
            redundancy,
            period,
            payload_size,
            direction,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        let packed: u16 = u16::from(self.redundancy as u8)
            | u16::from(self.period as u8) << 3
            | u16::from(self.payload_size & 0x7f) << 6
            | u16::from(self.direction as u8) << 13;
        packed.to_le_bytes()
    }

    /// Parse from the wire; `None` when a reserved encoding is used.
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        let packed = u16::from_le_bytes(bytes);
        if packed >> 14 != 0 {
            return None;
        }
        Some(Self {
            redundancy: Redundancy::from_raw((packed & 0x7) as u8)?,
            period: Period::from_raw(((packed >> 3) & 0x7) as u8)?,
            payload_size: ((packed >> 6) & 0x7f) as u8,
            direction: if (packed >> 13) & 1 == 0 {
                Direction::Tx
            } else {
                Direction::Rx
            },
        })
    }
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self::new(Redundancy::None, Period::P1, 0, Direction::Tx)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a node-side endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Uninitialized,
    // Client side
    Connecting,
    ConnectFailed,
    AcceptWait,
    Established,
    RemotelyClosed,
    Reopened,
    CloseWait,
    Closed,
    // Server side
    ListenWait,
    ListenFailed,
    Listen,
}

impl StreamStatus {
    /// States in which the data phase moves payload for this endpoint.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Established | Self::Reopened | Self::RemotelyClosed)
    }
}

/// Complete endpoint descriptor handed across API boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub params: StreamParameters,
    pub status: StreamStatus,
}

impl StreamInfo {
    pub fn new(id: StreamId, params: StreamParameters, status: StreamStatus) -> Self {
        Self { id, params, status }
    }
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            id: StreamId::default(),
            params: StreamParameters::default(),
            status: StreamStatus::Uninitialized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_wire_roundtrip() {
        let id = StreamId::new(3, 9, 5, 12);
        assert_eq!(StreamId::from_bytes(id.to_bytes()), id);
        assert_eq!(id.to_bytes()[2], 5 | (12 << 4));
    }

    #[test]
    fn server_identifier() {
        let id = StreamId::new(3, 9, 5, 12);
        let server = id.server_id();
        assert!(server.is_server());
        assert!(!id.is_server());
        assert_eq!(server, StreamId::new(9, 9, 0, 12));
    }

    #[test]
    fn keys_are_unique() {
        let a = StreamId::new(1, 2, 3, 4);
        let b = StreamId::new(2, 1, 3, 4);
        let c = StreamId::new(1, 2, 4, 3);
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_ne!(b.key(), c.key());
    }

    #[test]
    fn params_wire_roundtrip() {
        let p = StreamParameters::new(Redundancy::TripleSpatial, Period::P10, 99, Direction::Rx);
        let parsed = StreamParameters::from_bytes(p.to_bytes()).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn params_reserved_bits_rejected() {
        let p = StreamParameters::new(Redundancy::None, Period::P1, 1, Direction::Tx);
        let mut raw = p.to_bytes();
        raw[1] |= 0x40; // set a reserved bit
        assert!(StreamParameters::from_bytes(raw).is_none());
    }

    #[test]
    fn params_bad_redundancy_rejected() {
        // redundancy encoding 5..7 are reserved
        let raw = (5u16).to_le_bytes();
        assert!(StreamParameters::from_bytes(raw).is_none());
    }

    #[test]
    fn period_tiles() {
        assert_eq!(Period::P1.tiles(), 1);
        assert_eq!(Period::P5.tiles(), 5);
        assert_eq!(Period::P100.tiles(), 100);
    }

    #[test]
    fn redundancy_multiplier() {
        assert_eq!(Redundancy::None.multiplier(), 1);
        assert_eq!(Redundancy::Double.multiplier(), 2);
        assert_eq!(Redundancy::TripleSpatial.multiplier(), 3);
        assert!(Redundancy::DoubleSpatial.is_spatial());
        assert!(!Redundancy::Triple.is_spatial());
    }
}
