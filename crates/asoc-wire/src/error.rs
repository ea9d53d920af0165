//! Error type for wire-level encoding and decoding.
//!
//! Every decode operation in this crate fails with one of these variants.
//! What a failure means for the connection (drop the datagram, drop the
//! frame, kill the session) is the caller's decision, not the codec's.

use thiserror::Error;

/// Decode/verify failure for a single protocol unit.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("invalid length {len} (max {max})")]
    BadLength { len: usize, max: usize },

    #[error("signature verification failed")]
    BadSignature,

    #[error("timestamp outside freshness window")]
    StaleTimestamp,

    // Required by the tokio-util codec traits; only the framed stream
    // decoder ever produces it.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
