//! HMAC-SHA256 URL token signing.
//!
//! Local artifact URLs carry `token` and `expires` query parameters; the
//! token is the HMAC of `"{key}:{expires}"` under the configured secret and
//! is validated by recomputing it. The same primitive drives the SigV4
//! signing-key chain in the S3 provider.

use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 64;

/// HMAC-SHA256 (RFC 2104) over `message` with `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = Sha256::digest(key);
        key_block[..32].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Hex token over `"{key}:{expires}"` for a signed artifact URL.
pub fn sign_token(secret: &[u8], storage_key: &str, expires_epoch: i64) -> String {
    let message = format!("{storage_key}:{expires_epoch}");
    hex::encode(hmac_sha256(secret, message.as_bytes()))
}

/// Recompute and compare a URL token. Also rejects expired timestamps.
pub fn verify_token(
    secret: &[u8],
    storage_key: &str,
    expires_epoch: i64,
    token: &str,
    now_epoch: i64,
) -> bool {
    if now_epoch > expires_epoch {
        return false;
    }
    let expected = sign_token(secret, storage_key, expires_epoch);
    constant_time_eq(expected.as_bytes(), token.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_rfc4231_case_2() {
        // RFC 4231 test case 2: short key, known digest.
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_long_key_is_hashed_first() {
        let long_key = [0xaa_u8; 131];
        // RFC 4231 test case 6.
        let mac = hmac_sha256(&long_key, b"Test Using Larger Than Block-Size Key - Hash Key First");
        assert_eq!(
            hex::encode(mac),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn test_token_roundtrip() {
        let secret = b"testlane-dev-secret";
        let token = sign_token(secret, "executions/2026/01/01/abc/shot.png", 1_900_000_000);
        assert!(verify_token(
            secret,
            "executions/2026/01/01/abc/shot.png",
            1_900_000_000,
            &token,
            1_899_999_000
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let secret = b"s";
        let token = sign_token(secret, "k", 100);
        assert!(!verify_token(secret, "k", 100, &token, 101));
    }

    #[test]
    fn test_tampered_key_rejected() {
        let secret = b"s";
        let token = sign_token(secret, "executions/a/file.png", 1_900_000_000);
        assert!(!verify_token(
            secret,
            "executions/a/other.png",
            1_900_000_000,
            &token,
            0
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign_token(b"one", "k", 1_900_000_000);
        assert!(!verify_token(b"two", "k", 1_900_000_000, &token, 0));
    }
}
