//! Stable short identifiers for bearer tokens in logs and notifications

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 12;

/// Short, non-reversible identifier for a token.
///
/// Log lines carry the fingerprint instead of the raw credential so that a
/// leaked log never leaks a usable token, while the same token still
/// correlates across lines.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter() {
        if out.len() >= FINGERPRINT_LEN {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(FINGERPRINT_LEN);
    out
}
