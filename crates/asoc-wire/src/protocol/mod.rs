//! Protocol constants and frame types.
//!
//! Wire layouts live in the submodules: [`frame`] for the 14-byte header and
//! the stream codec, [`handshake`] for HELLO/ACCEPT, [`discovery`] for the
//! 50-byte broadcast datagram. All multi-byte integers are big-endian; there
//! is no padding, no alignment, and no optional field anywhere.

pub mod discovery;
pub mod frame;
pub mod handshake;

use crate::error::WireError;

/// Current protocol version, carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size: version(1) + type(1) + stream_id(4) + seq(4) + length(4).
pub const HEADER_LEN: usize = 14;

/// Discovery datagram size.
pub const DISCOVERY_LEN: usize = 50;

/// HELLO payload size: uuid(16) + challenge(4) + signature(16).
pub const HELLO_LEN: usize = 36;

/// ACCEPT payload size: token(8) + signature(8).
pub const ACCEPT_LEN: usize = 16;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame type discriminator.
///
/// Explicit u8 values; anything else on an established session is dropped
/// silently, anything else during the handshake is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// One chunk of a stream.
    Data = 1,
    /// Stream terminator; sequence is one past the last DATA frame.
    End = 2,
    /// Reserved control channel; used to announce a stream's application tag.
    Control = 3,
    /// Handshake: identity proof.
    Hello = 4,
    /// Handshake: session token issue.
    Accept = 5,
}

impl FrameType {
    /// True for the two frame types that only appear during the handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self, FrameType::Hello | FrameType::Accept)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::End),
            3 => Ok(FrameType::Control),
            4 => Ok(FrameType::Hello),
            5 => Ok(FrameType::Accept),
            other => Err(WireError::UnknownType(other)),
        }
    }
}
