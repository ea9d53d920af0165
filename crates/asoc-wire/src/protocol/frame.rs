//! Frame header layout and the length-framed stream codec.
//!
//! ## Header format (14 bytes, big-endian)
//!
//! ```text
//! +-------------+----------+----------------+-----------+---------------+
//! | Version (1B)| Type (1B)| Stream id (4B) | Seq (4B)  | Length (4B)   |
//! +-------------+----------+----------------+-----------+---------------+
//! ```
//!
//! The payload follows immediately; `Length` counts payload bytes only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::protocol::{FrameType, DEFAULT_MAX_FRAME_BYTES, HEADER_LEN, PROTOCOL_VERSION};
use crate::types::StreamId;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub seq: u32,
    pub len: u32,
}

/// Encode a header into its 14-byte wire form.
pub fn encode_frame_header(header: &FrameHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = PROTOCOL_VERSION;
    out[1] = header.frame_type as u8;
    out[2..6].copy_from_slice(&header.stream_id.0.to_be_bytes());
    out[6..10].copy_from_slice(&header.seq.to_be_bytes());
    out[10..14].copy_from_slice(&header.len.to_be_bytes());
    out
}

/// Decode a 14-byte header. Strict: unknown versions and types are errors.
pub fn decode_frame_header(buf: &[u8]) -> Result<FrameHeader, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::ShortBuffer {
            need: HEADER_LEN,
            have: buf.len(),
        });
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(buf[0]));
    }
    let frame_type = FrameType::try_from(buf[1])?;
    let stream_id = StreamId(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]));
    let seq = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
    Ok(FrameHeader {
        frame_type,
        stream_id,
        seq,
        len,
    })
}

/// A complete frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub seq: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream_id: StreamId, seq: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            seq,
            payload,
        }
    }

    pub fn end(stream_id: StreamId, seq: u32) -> Self {
        Self {
            frame_type: FrameType::End,
            stream_id,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn control(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Control,
            stream_id,
            seq: 0,
            payload,
        }
    }

    /// Handshake frames travel on the reserved stream 0, sequence 0.
    pub fn handshake(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id: StreamId::HANDSHAKE,
            seq: 0,
            payload,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_type: self.frame_type,
            stream_id: self.stream_id,
            seq: self.seq,
            len: self.payload.len() as u32,
        }
    }

    /// Total encoded size on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec for framing [`Frame`] values over a byte stream.
///
/// Handles length framing, version validation, and the payload-size cap.
/// During the handshake the codec is strict: any unrecognized frame type is
/// an error. Once the session is established the owner switches it to
/// lenient mode, where frames of unknown type are skipped without surfacing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    lenient: bool,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            lenient: false,
        }
    }

    /// Switch to established-session behavior: skip unknown frame types.
    pub fn set_established(&mut self) {
        self.lenient = true;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            // Need at least the header
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            // Peek at the header (don't consume yet)
            if src[0] != PROTOCOL_VERSION {
                return Err(WireError::BadVersion(src[0]));
            }
            let raw_type = src[1];
            let len = u32::from_be_bytes([src[10], src[11], src[12], src[13]]) as usize;

            if len > self.max_payload {
                return Err(WireError::BadLength {
                    len,
                    max: self.max_payload,
                });
            }

            // Check if we have the full frame
            let total = HEADER_LEN + len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            match FrameType::try_from(raw_type) {
                Ok(frame_type) => {
                    let stream_id = StreamId(u32::from_be_bytes([src[2], src[3], src[4], src[5]]));
                    let seq = u32::from_be_bytes([src[6], src[7], src[8], src[9]]);
                    src.advance(HEADER_LEN);
                    let payload = src.split_to(len).freeze();
                    return Ok(Some(Frame {
                        frame_type,
                        stream_id,
                        seq,
                        payload,
                    }));
                }
                Err(err) => {
                    if self.lenient {
                        // Unrecognized type on an established session:
                        // consume the whole frame and keep reading.
                        src.advance(total);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        if item.payload.len() > self.max_payload {
            return Err(WireError::BadLength {
                len: item.payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(item.frame_type as u8);
        dst.put_u32(item.stream_id.0);
        dst.put_u32(item.seq);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
