//! Core identifier types shared by the wire and runtime crates.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the mesh.
///
/// Generated once at process start and stable for the lifetime of the node.
/// On the wire it travels as the raw 16 bytes of the UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID (seeded identity).
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from the 16 raw bytes carried on the wire.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 raw bytes carried on the wire.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream identifier within a session.
///
/// Id 0 is reserved for the handshake. Odd ids are allocated by the side
/// that initiated the transport, even ids by the side that accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// The reserved handshake stream.
    pub const HANDSHAKE: StreamId = StreamId(0);

    pub fn is_handshake(&self) -> bool {
        self.0 == 0
    }

    /// Which side of the session allocates this id.
    pub fn allocator(&self) -> Role {
        if self.0 & 1 == 1 {
            Role::Initiator
        } else {
            Role::Acceptor
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the transport a node is on for a given session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the transport and sent the first HELLO. Allocates odd stream ids.
    Initiator,
    /// Accepted the transport and issued the session token. Allocates even ids.
    Acceptor,
}

impl Role {
    pub fn remote(&self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }

    /// First stream id this role hands out.
    pub fn first_stream_id(&self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }
}

/// 8-byte session token issued in ACCEPT.
///
/// Retained on the session for its lifetime; never re-verified after the
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken([u8; 8]);

impl SessionToken {
    /// Draw a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

/// Shared secret keying every HMAC in the protocol.
///
/// Opaque bytes distributed out-of-band. The `Debug` impl never prints key
/// material.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(Vec<u8>);

impl ApiKey {
    /// Minimum accepted key length in bytes.
    pub const MIN_LEN: usize = 16;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({} bytes)", self.0.len())
    }
}

impl From<&[u8]> for ApiKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}
