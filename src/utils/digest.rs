use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of the UTF-8 bytes, lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compares two hex digests without short-circuiting on the first mismatch.
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Public room handle: digest of the creation instant plus a random nonce.
pub fn room_hashed_id() -> String {
    sha256_hex(&format!("{}{}", Utc::now().timestamp_millis(), nanoid::nanoid!()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn equal_inputs_equal_digests() {
        assert_eq!(sha256_hex("hunter2"), sha256_hex("hunter2"));
        assert_ne!(sha256_hex("hunter2"), sha256_hex("hunter2x"));
        assert!(digest_eq(&sha256_hex("a"), &sha256_hex("a")));
        assert!(!digest_eq(&sha256_hex("a"), &sha256_hex("b")));
        assert!(!digest_eq("ab", "abc"));
    }

    #[test]
    fn hashed_ids_are_unique_hex() {
        let a = room_hashed_id();
        let b = room_hashed_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
