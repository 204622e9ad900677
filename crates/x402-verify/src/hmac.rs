use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the facilitator request signature.
pub const FACILITATOR_AUTH_HEADER: &str = "X-Facilitator-Auth";

/// Hex HMAC-SHA256 of a facilitator request body under the shared secret.
pub fn sign_request(secret: &[u8], body: &[u8]) -> String {
    // new_from_slice only rejects keys for fixed-size MACs; HMAC takes any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231, test case 2.
        assert_eq!(
            sign_request(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signature_depends_on_secret_and_body() {
        let body = br#"{"x402Version":1,"paymentPayload":{}}"#;
        let sig = sign_request(b"secret-1", body);
        assert_eq!(sig, sign_request(b"secret-1", body));
        assert_ne!(sig, sign_request(b"secret-2", body));
        assert_ne!(sig, sign_request(b"secret-1", b"tampered"));
    }

    #[test]
    fn test_signature_is_lowercase_hex_sha256() {
        let sig = sign_request(b"k", b"body");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
