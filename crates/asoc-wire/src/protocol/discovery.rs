//! The 50-byte authenticated discovery datagram.
//!
//! ```text
//! +-----------------+-----------+----------+----------------+----------------+-----------------+
//! | Community (8B)  | UUID (16B)| Port (2B)| Timestamp (4B) | Challenge (4B) | Signature (16B) |
//! +-----------------+-----------+----------+----------------+----------------+-----------------+
//! ```
//!
//! The signature is HMAC-SHA256 over the first 34 bytes, truncated to 16.
//! Timestamps are seconds since the Unix epoch and must fall within ±60 s of
//! the receiver's clock. A community mismatch is reported as `BadSignature`:
//! callers cannot (and must not) distinguish "wrong cluster" from "wrong
//! key".

use crate::crypto::{tag, verify_tag, COMMUNITY_HASH_LEN};
use crate::error::WireError;
use crate::protocol::DISCOVERY_LEN;
use crate::types::{ApiKey, NodeId};

/// Accepted clock skew between sender and receiver, in seconds.
pub const TIMESTAMP_WINDOW_SECS: u32 = 60;

/// Verified contents of a discovery datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub node_id: NodeId,
    /// TCP port where the sender accepts sessions.
    pub port: u16,
    pub timestamp: u32,
    pub challenge: u32,
}

/// Encode a discovery datagram.
pub fn encode_discovery(
    community_hash: &[u8; COMMUNITY_HASH_LEN],
    node_id: NodeId,
    port: u16,
    timestamp: u32,
    challenge: u32,
    api_key: &ApiKey,
) -> [u8; DISCOVERY_LEN] {
    let mut out = [0u8; DISCOVERY_LEN];
    out[..8].copy_from_slice(community_hash);
    out[8..24].copy_from_slice(node_id.as_bytes());
    out[24..26].copy_from_slice(&port.to_be_bytes());
    out[26..30].copy_from_slice(&timestamp.to_be_bytes());
    out[30..34].copy_from_slice(&challenge.to_be_bytes());

    let sig: [u8; 16] = tag(api_key, &[&out[..34]]);
    out[34..50].copy_from_slice(&sig);
    out
}

/// Decode a discovery datagram, verifying community, signature, and
/// freshness against `now` (seconds since the Unix epoch).
pub fn decode_and_verify_discovery(
    buf: &[u8],
    community_hash: &[u8; COMMUNITY_HASH_LEN],
    api_key: &ApiKey,
    now: u32,
) -> Result<Announcement, WireError> {
    if buf.len() < DISCOVERY_LEN {
        return Err(WireError::ShortBuffer {
            need: DISCOVERY_LEN,
            have: buf.len(),
        });
    }
    if buf.len() != DISCOVERY_LEN {
        return Err(WireError::BadLength {
            len: buf.len(),
            max: DISCOVERY_LEN,
        });
    }

    // Community mismatch and MAC failure are deliberately the same error.
    let mut community_ok = 0u8;
    for (a, b) in buf[..8].iter().zip(community_hash.iter()) {
        community_ok |= a ^ b;
    }
    if community_ok != 0 {
        return Err(WireError::BadSignature);
    }

    if !verify_tag(api_key, &[&buf[..34]], &buf[34..50]) {
        return Err(WireError::BadSignature);
    }

    let timestamp = u32::from_be_bytes([buf[26], buf[27], buf[28], buf[29]]);
    if now.abs_diff(timestamp) > TIMESTAMP_WINDOW_SECS {
        return Err(WireError::StaleTimestamp);
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&buf[8..24]);
    Ok(Announcement {
        node_id: NodeId::from_bytes(uuid),
        port: u16::from_be_bytes([buf[24], buf[25]]),
        timestamp,
        challenge: u32::from_be_bytes([buf[30], buf[31], buf[32], buf[33]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::community_hash;

    const NOW: u32 = 1_700_000_000;

    fn key() -> ApiKey {
        ApiKey::from("test-secret-key!")
    }

    fn datagram() -> ([u8; DISCOVERY_LEN], NodeId) {
        let node = NodeId::generate();
        let buf = encode_discovery(
            &community_hash("my-cluster"),
            node,
            9000,
            NOW,
            0xCAFE_F00D,
            &key(),
        );
        (buf, node)
    }

    #[test]
    fn roundtrip() {
        let (buf, node) = datagram();
        assert_eq!(buf.len(), DISCOVERY_LEN);
        let ann =
            decode_and_verify_discovery(&buf, &community_hash("my-cluster"), &key(), NOW).unwrap();
        assert_eq!(ann.node_id, node);
        assert_eq!(ann.port, 9000);
        assert_eq!(ann.timestamp, NOW);
        assert_eq!(ann.challenge, 0xCAFE_F00D);
    }

    #[test]
    fn rejects_flipped_signature_bit() {
        let (mut buf, _) = datagram();
        buf[DISCOVERY_LEN - 1] ^= 0x01;
        assert!(matches!(
            decode_and_verify_discovery(&buf, &community_hash("my-cluster"), &key(), NOW),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn rejects_wrong_community() {
        let (buf, _) = datagram();
        assert!(matches!(
            decode_and_verify_discovery(&buf, &community_hash("other-cluster"), &key(), NOW),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn rejects_wrong_key() {
        let (buf, _) = datagram();
        assert!(matches!(
            decode_and_verify_discovery(
                &buf,
                &community_hash("my-cluster"),
                &ApiKey::from("another-key-here"),
                NOW
            ),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn rejects_short_datagram() {
        let (buf, _) = datagram();
        assert!(matches!(
            decode_and_verify_discovery(&buf[..30], &community_hash("my-cluster"), &key(), NOW),
            Err(WireError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let (buf, _) = datagram();
        let hash = community_hash("my-cluster");
        assert!(matches!(
            decode_and_verify_discovery(&buf, &hash, &key(), NOW + TIMESTAMP_WINDOW_SECS + 1),
            Err(WireError::StaleTimestamp)
        ));
        assert!(matches!(
            decode_and_verify_discovery(&buf, &hash, &key(), NOW - TIMESTAMP_WINDOW_SECS - 1),
            Err(WireError::StaleTimestamp)
        ));
        // Edge of the window is still fresh.
        assert!(
            decode_and_verify_discovery(&buf, &hash, &key(), NOW + TIMESTAMP_WINDOW_SECS).is_ok()
        );
    }
}
