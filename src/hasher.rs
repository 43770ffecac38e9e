use sha2::{Digest, Sha256};

/// `prev_hash` of the first block in every chain.
pub const GENESIS_SENTINEL: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// SHA-256 of `bytes` as 64 lowercase hex characters.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
