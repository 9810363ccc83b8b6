//! Unified error types for the TDMH network engine.
//!
//! The MAC thread never unwinds: radio and packet failures are plain status
//! values that the slotframe loop converts into counters and state-machine
//! inputs. Every subsystem error converts into the top-level [`Error`] so
//! callers outside the MAC (configuration, stream API) get one uniform type.

use core::fmt;

// ---------------------------------------------------------------------------
// Radio status
// ---------------------------------------------------------------------------

/// Outcome of a radio send or receive, reported as a value and never thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// No frame arrived within the receive window.
    Timeout,
    /// A frame arrived but failed the CRC check.
    Crc,
    /// The requested transmission deadline is already in the past.
    TooLate,
    /// The frame does not fit the transceiver buffer.
    TooLong,
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "receive timeout"),
            Self::Crc => write!(f, "CRC failure"),
            Self::TooLate => write!(f, "deadline in the past"),
            Self::TooLong => write!(f, "frame too long"),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet buffer errors
// ---------------------------------------------------------------------------

/// Over/underflow of the fixed 125-byte radio frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// A `put` exceeded the free space of the frame.
    Overflow,
    /// A `get` or `discard` exceeded the bytes stored in the frame.
    Underflow,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "packet overflow"),
            Self::Underflow => write!(f, "packet underflow"),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Startup validation failures of [`NetworkConfig`](crate::config::NetworkConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A config field or cross-check failed; the string names which one.
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(what) => write!(f, "invalid configuration: {what}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream API errors
// ---------------------------------------------------------------------------

/// Errors returned by the file-descriptor style stream API.
///
/// [`code()`](StreamError::code) maps each variant to the numeric code of the
/// synchronous API contract, so callers that want plain integers still get
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The master identity is not verified; all stream operations refuse.
    MasterUntrusted,
    /// No free client source port, duplicate endpoint, or unknown file
    /// descriptor.
    InvalidEndpoint,
    /// The operation requires an ESTABLISHED stream.
    NotEstablished,
    /// The endpoint was closed, locally or by the network.
    Closed,
    /// `wait()` called on a receive-only stream.
    NotSender,
}

impl StreamError {
    /// Numeric code of the synchronous API contract.
    pub fn code(self) -> i32 {
        match self {
            Self::MasterUntrusted => -10,
            Self::InvalidEndpoint => -1,
            Self::NotSender => -2,
            Self::NotEstablished => -3,
            Self::Closed => -4,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MasterUntrusted => write!(f, "master untrusted"),
            Self::InvalidEndpoint => write!(f, "invalid endpoint"),
            Self::NotEstablished => write!(f, "stream not established"),
            Self::Closed => write!(f, "stream closed"),
            Self::NotSender => write!(f, "not a sending stream"),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation of the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Radio(RadioError),
    Packet(PacketError),
    Config(ConfigError),
    Stream(StreamError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio(e) => write!(f, "radio: {e}"),
            Self::Packet(e) => write!(f, "packet: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Stream(e) => write!(f, "stream: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<RadioError> for Error {
    fn from(e: RadioError) -> Self {
        Self::Radio(e)
    }
}

impl From<PacketError> for Error {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
