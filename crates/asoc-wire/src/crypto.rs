//! Community hashing and truncated HMAC-SHA256 tags.
//!
//! All protocol signatures are HMAC-SHA256 outputs truncated to the first
//! `N` bytes. Verification goes through the MAC's own truncated comparison,
//! which is constant-time.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::types::ApiKey;

type HmacSha256 = Hmac<Sha256>;

/// Length of the community hash carried in discovery datagrams.
pub const COMMUNITY_HASH_LEN: usize = 8;

/// Cryptographic projection of a community name: the first 8 bytes of
/// SHA-256 over the UTF-8 string. Namespace isolation, not a secret.
pub fn community_hash(community: &str) -> [u8; COMMUNITY_HASH_LEN] {
    let digest = Sha256::digest(community.as_bytes());
    let mut out = [0u8; COMMUNITY_HASH_LEN];
    out.copy_from_slice(&digest[..COMMUNITY_HASH_LEN]);
    out
}

fn keyed(key: &ApiKey) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC key of any length")
}

/// HMAC-SHA256 over the concatenation of `parts`, truncated to `N` bytes.
pub fn tag<const N: usize>(key: &ApiKey, parts: &[&[u8]]) -> [u8; N] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; N];
    out.copy_from_slice(&full[..N]);
    out
}

/// Constant-time check of a truncated tag against the MAC of `parts`.
pub fn verify_tag(key: &ApiKey, parts: &[&[u8]], expected: &[u8]) -> bool {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_truncated_left(expected).is_ok()
}
