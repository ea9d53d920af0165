//! Error types for the node runtime.
//!
//! Network conditions never cross the public API as errors: they surface
//! through completion results (`StreamHandle`) and membership callbacks.
//! Only configuration and usage mistakes are returned synchronously.

use std::fmt;

use asoc_wire::NodeId;
use thiserror::Error;

use crate::streaming::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Errors surfaced by the node's public API.
#[derive(Error, Debug)]
pub enum NodeError {
    // === Configuration / usage ===
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no established session with peer {0}")]
    NoSession(NodeId),

    #[error("chunk size {0} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}")]
    InvalidChunkSize(usize),

    // === Completion results ===
    #[error("stream aborted before completion")]
    Aborted,

    // === Startup ===
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Why a peer's session went away, as reported to `on_peer_down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    /// The peer violated the protocol (sequence gap, oversized frame,
    /// handshake frame in the data phase, wrong stream parity).
    ProtocolViolation,
    /// The transport failed (reset, refused, write stalled past the drain
    /// deadline).
    Transport,
    /// Nothing was received for the idle window.
    IdleTimeout,
    /// The peer closed the connection.
    PeerClosed,
    /// This node is shutting down.
    Shutdown,
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownReason::ProtocolViolation => write!(f, "protocol violation"),
            DownReason::Transport => write!(f, "transport error"),
            DownReason::IdleTimeout => write!(f, "idle timeout"),
            DownReason::PeerClosed => write!(f, "peer closed"),
            DownReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
