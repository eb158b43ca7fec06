//! Challenge/response authentication for tunnel connections.
//!
//! The server sends a random hex nonce in its `Hello`; the client answers
//! with the hex HMAC-SHA256 of that nonce keyed by the shared secret. The
//! digest construction is part of the wire compatibility contract.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CHALLENGE_BYTES: usize = 32;

/// Generate a fresh hex-encoded challenge nonce.
pub fn new_challenge() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compute the response for `challenge` keyed by `secret`.
pub fn answer(secret: &str, challenge: &str) -> String {
    let mut mac = keyed(secret);
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a peer's `response` against `challenge` in constant time.
pub fn verify(secret: &str, challenge: &str, response: &str) -> bool {
    let Ok(raw) = hex::decode(response) else {
        return false;
    };
    let mut mac = keyed(secret);
    mac.update(challenge.as_bytes());
    mac.verify_slice(&raw).is_ok()
}

fn keyed(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_secret_verifies() {
        let c = new_challenge();
        let r = answer("hunter2", &c);
        assert!(verify("hunter2", &c, &r));
    }

    #[test]
    fn wrong_secret_rejected() {
        let c = new_challenge();
        let r = answer("hunter2", &c);
        assert!(!verify("hunter3", &c, &r));
    }

    #[test]
    fn stale_challenge_rejected() {
        let r = answer("hunter2", &new_challenge());
        assert!(!verify("hunter2", &new_challenge(), &r));
    }

    #[test]
    fn malformed_response_rejected() {
        let c = new_challenge();
        assert!(!verify("hunter2", &c, "not hex"));
        assert!(!verify("hunter2", &c, ""));
    }

    #[test]
    fn challenges_are_hex_and_unique() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), CHALLENGE_BYTES * 2);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
