//! Secret comparison helpers.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare two secrets without leaking content or length through timing.
///
/// Both sides are hashed to SHA-256 first so the `subtle` comparison always
/// runs over 32 bytes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Check an `Authorization` header value against the expected bearer token.
///
/// A missing header, a different scheme, or an empty token never matches.
pub fn bearer_matches(header: Option<&str>, expected: &str) -> bool {
    let Some(token) = header.and_then(|h| h.trim().strip_prefix("Bearer ")) else {
        return false;
    };
    let token = token.trim();
    !token.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}
