use sha2::{Digest, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{SHA256_PREFIX}{:x}", Sha256::digest(data))
}

/// Hex part of a `sha256:` digest, or `None` if `digest` is not a well formed
/// sha256 digest.
pub fn sha256_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix(SHA256_PREFIX)?;
    let valid = hex.len() == 64
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some(hex)
}
