// hasher.rs - SHA-256 helpers.
//
// Idempotency keys are SHA-256 digests encoded as 64 lowercase hex chars.

use sha2::{Digest, Sha256};

/// Hash a sequence of fields into a lowercase hex SHA-256 string.
///
/// Each field is prefixed with its length as a big-endian u64, so field
/// contents (separators included) cannot shift a boundary.
pub fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash the raw bytes of a single UTF-8 string.
pub fn hash_str(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

/// True if `s` looks like the output of [`hash_fields`].
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
