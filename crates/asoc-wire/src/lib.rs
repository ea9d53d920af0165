//! # asoc-wire
//!
//! Wire protocol for the ASoc tensor-streaming mesh.
//!
//! This crate contains:
//! - The 50-byte authenticated discovery datagram
//! - The 14-byte frame header and the length-framed stream codec
//! - The HELLO/ACCEPT handshake payloads
//! - Community hashing and truncated HMAC-SHA256 tags
//!
//! ## Architecture
//!
//! Everything here is stateless and performs no I/O: encoding is
//! deterministic and bit-exact, decoding verifies before it parses, and all
//! signature comparisons are constant-time. The runtime crate (`asoc-node`)
//! drives these types from its socket tasks.

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used items at crate root
pub use error::WireError;
pub use protocol::{FrameType, PROTOCOL_VERSION};
pub use types::{ApiKey, NodeId, Role, SessionToken, StreamId};
