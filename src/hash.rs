//! Content fingerprints for change detection
//!
//! Each field is framed as `u64 little-endian byte length || UTF-8 bytes` before it is
//! fed to BLAKE3, so `["ab", "c"]` and `["a", "bc"]` never collide by construction.

use blake3::Hasher;

/// Compute the content hash of an entry's ordered text fields (64 hex chars)
pub fn content_hash<S: AsRef<str>>(fields: &[S]) -> String {
    let mut hasher = Hasher::new();
    for field in fields {
        let bytes = field.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_hex().to_string()
}

/// Check that a string looks like a hash produced by [`content_hash`]
pub fn is_content_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
