//! # Secrets and Identity
//!
//! Generation of access tokens, agent keys, and agent IDs, plus the
//! constant-time comparison used everywhere a secret is checked.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use uuid::Uuid;

/// Byte length of a browser access token (128 bits).
pub const ACCESS_TOKEN_BYTES: usize = 16;

/// Byte length of an agent key (256 bits). Encoded as 43 URL-safe
/// characters.
pub const AGENT_KEY_BYTES: usize = 32;

/// Generates a URL-safe secret from `n_bytes` of OS randomness.
pub fn generate_secret(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    getrandom::fill(&mut bytes).expect("OS randomness unavailable");
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generates a short, human-readable agent ID from a UUID.
///
/// Format: "XXXX-XXXX-XXXX" (12 uppercase hex characters split by hyphens).
/// Example: "A3F8-B2C1-7D2E"
pub fn generate_agent_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    let short = &uuid[..12];
    format!(
        "{}-{}-{}",
        short[..4].to_uppercase(),
        short[4..8].to_uppercase(),
        short[8..12].to_uppercase()
    )
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Returns true only if both slices have equal length and identical
/// contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_url_safe_and_long_enough() {
        let key = generate_secret(AGENT_KEY_BYTES);
        assert!(key.len() >= 40);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn secrets_are_unique() {
        assert_ne!(
            generate_secret(ACCESS_TOKEN_BYTES),
            generate_secret(ACCESS_TOKEN_BYTES)
        );
    }

    #[test]
    fn agent_id_shape() {
        let id = generate_agent_id();
        assert_eq!(id.len(), 14);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        for part in parts {
            assert_eq!(part.len(), 4);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"", b""));
    }
}
