//! HELLO and ACCEPT handshake payloads.
//!
//! ## HELLO (36 bytes)
//!
//! ```text
//! +-----------+----------------+---------------------------------------+
//! | UUID (16B)| Challenge (4B) | HMAC-SHA256(key, uuid‖challenge)[..16]|
//! +-----------+----------------+---------------------------------------+
//! ```
//!
//! ## ACCEPT (16 bytes)
//!
//! ```text
//! +------------+------------------------------+
//! | Token (8B) | HMAC-SHA256(key, token)[..8] |
//! +------------+------------------------------+
//! ```
//!
//! Verification failures are indistinguishable from one another on the wire:
//! the peer closes the transport without writing anything back.

use crate::crypto::{tag, verify_tag};
use crate::error::WireError;
use crate::protocol::{ACCEPT_LEN, HELLO_LEN};
use crate::types::{ApiKey, NodeId, SessionToken};

/// Verified contents of a HELLO payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub node_id: NodeId,
    pub challenge: u32,
}

/// Encode a HELLO payload proving knowledge of the API key.
pub fn encode_hello(node_id: NodeId, challenge: u32, api_key: &ApiKey) -> [u8; HELLO_LEN] {
    let challenge_be = challenge.to_be_bytes();
    let sig: [u8; 16] = tag(api_key, &[node_id.as_bytes(), &challenge_be]);

    let mut out = [0u8; HELLO_LEN];
    out[..16].copy_from_slice(node_id.as_bytes());
    out[16..20].copy_from_slice(&challenge_be);
    out[20..36].copy_from_slice(&sig);
    out
}

/// Decode a HELLO payload and verify its signature.
pub fn decode_and_verify_hello(payload: &[u8], api_key: &ApiKey) -> Result<Hello, WireError> {
    if payload.len() < HELLO_LEN {
        return Err(WireError::ShortBuffer {
            need: HELLO_LEN,
            have: payload.len(),
        });
    }
    if payload.len() != HELLO_LEN {
        return Err(WireError::BadLength {
            len: payload.len(),
            max: HELLO_LEN,
        });
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&payload[..16]);
    let challenge_be = &payload[16..20];
    let sig = &payload[20..36];

    if !verify_tag(api_key, &[&uuid, challenge_be], sig) {
        return Err(WireError::BadSignature);
    }

    let challenge = u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]);
    Ok(Hello {
        node_id: NodeId::from_bytes(uuid),
        challenge,
    })
}

/// Encode an ACCEPT payload for a freshly drawn session token.
pub fn encode_accept(token: SessionToken, api_key: &ApiKey) -> [u8; ACCEPT_LEN] {
    let sig: [u8; 8] = tag(api_key, &[token.as_bytes()]);

    let mut out = [0u8; ACCEPT_LEN];
    out[..8].copy_from_slice(token.as_bytes());
    out[8..16].copy_from_slice(&sig);
    out
}

/// Verify an ACCEPT payload and extract the session token.
pub fn verify_accept(payload: &[u8], api_key: &ApiKey) -> Result<SessionToken, WireError> {
    if payload.len() < ACCEPT_LEN {
        return Err(WireError::ShortBuffer {
            need: ACCEPT_LEN,
            have: payload.len(),
        });
    }
    if payload.len() != ACCEPT_LEN {
        return Err(WireError::BadLength {
            len: payload.len(),
            max: ACCEPT_LEN,
        });
    }

    let mut token = [0u8; 8];
    token.copy_from_slice(&payload[..8]);
    let sig = &payload[8..16];

    if !verify_tag(api_key, &[&token], sig) {
        return Err(WireError::BadSignature);
    }
    Ok(SessionToken::from_bytes(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn key() -> ApiKey {
        ApiKey::from("test-secret-key!")
    }

    #[test]
    fn hello_roundtrip() {
        let node = NodeId::generate();
        let payload = encode_hello(node, 0xDEAD_BEEF, &key());
        let hello = decode_and_verify_hello(&payload, &key()).unwrap();
        assert_eq!(hello.node_id, node);
        assert_eq!(hello.challenge, 0xDEAD_BEEF);
    }

    #[test]
    fn hello_signature_matches_reference_fixture() {
        // key b"test-secret-key", uuid a1b2c3d4e5f607182930a1b2c3d4e5f6,
        // challenge 0x12345678: the signature is the first 16 bytes of
        // HMAC-SHA256(key, uuid || challenge_be).
        let api_key = ApiKey::from("test-secret-key");
        let uuid = [
            0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18, 0x29, 0x30, 0xA1, 0xB2, 0xC3, 0xD4,
            0xE5, 0xF6,
        ];
        let payload = encode_hello(NodeId::from_bytes(uuid), 0x1234_5678, &api_key);

        let mut mac =
            Hmac::<Sha256>::new_from_slice(api_key.as_bytes()).expect("HMAC key of any length");
        mac.update(&uuid);
        mac.update(&0x1234_5678u32.to_be_bytes());
        let reference = mac.finalize().into_bytes();

        assert_eq!(&payload[..16], &uuid);
        assert_eq!(&payload[16..20], &0x1234_5678u32.to_be_bytes());
        assert_eq!(&payload[20..36], &reference[..16]);
    }

    #[test]
    fn hello_rejects_flipped_signature_bit() {
        let mut payload = encode_hello(NodeId::generate(), 1, &key());
        payload[HELLO_LEN - 1] ^= 0x80;
        assert!(matches!(
            decode_and_verify_hello(&payload, &key()),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn hello_rejects_wrong_key() {
        let payload = encode_hello(NodeId::generate(), 1, &key());
        assert!(matches!(
            decode_and_verify_hello(&payload, &ApiKey::from("another-key-here")),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn hello_rejects_short_and_long_payloads() {
        let payload = encode_hello(NodeId::generate(), 1, &key());
        assert!(matches!(
            decode_and_verify_hello(&payload[..20], &key()),
            Err(WireError::ShortBuffer { .. })
        ));
        let mut long = payload.to_vec();
        long.push(0);
        assert!(matches!(
            decode_and_verify_hello(&long, &key()),
            Err(WireError::BadLength { .. })
        ));
    }

    #[test]
    fn accept_roundtrip() {
        let token = SessionToken::generate();
        let payload = encode_accept(token, &key());
        assert_eq!(verify_accept(&payload, &key()).unwrap(), token);
    }

    #[test]
    fn accept_rejects_flipped_token_bit() {
        let token = SessionToken::generate();
        let mut payload = encode_accept(token, &key());
        payload[0] ^= 0x01;
        assert!(matches!(
            verify_accept(&payload, &key()),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn accept_rejects_wrong_key() {
        let payload = encode_accept(SessionToken::generate(), &key());
        assert!(matches!(
            verify_accept(&payload, &ApiKey::from("another-key-here")),
            Err(WireError::BadSignature)
        ));
    }
}
