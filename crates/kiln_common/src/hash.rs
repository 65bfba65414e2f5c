//! Content hashing for cache keys and invalidation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 128-bit content hash computed using XXH3.
///
/// Two inputs with the same `ContentHash` are assumed to be identical. Used to
/// key cached build outputs and to detect when sources, options or upstream
/// artifacts have changed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Parses the 32-character lowercase hex form produced by `Display`.
    ///
    /// Returns `None` for anything else, which lets directory scans skip
    /// entries that are not cache keys.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Builds a [`ContentHash`] over a sequence of typed fields.
///
/// Every field is written with a one-byte tag and a length prefix, so that
/// `("ab", "c")` and `("a", "bc")` never collide. Callers are responsible for
/// feeding unordered collections in sorted order.
#[derive(Debug, Default, Clone)]
pub struct ContentHasher {
    buf: Vec<u8>,
}

const TAG_STR: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_HASH: u8 = 3;
const TAG_U64: u8 = 4;
const TAG_BOOL: u8 = 5;

impl ContentHasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a string field.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_tagged(TAG_STR, s.as_bytes())
    }

    /// Appends a raw byte field.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_tagged(TAG_BYTES, bytes)
    }

    /// Appends another hash.
    pub fn write_hash(&mut self, hash: &ContentHash) -> &mut Self {
        self.write_tagged(TAG_HASH, &hash.0)
    }

    /// Appends an integer.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_tagged(TAG_U64, &value.to_le_bytes())
    }

    /// Appends a boolean.
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_tagged(TAG_BOOL, &[value as u8])
    }

    /// Finishes hashing.
    pub fn finish(&self) -> ContentHash {
        ContentHash::from_bytes(&self.buf)
    }

    fn write_tagged(&mut self, tag: u8, bytes: &[u8]) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = ContentHash::from_bytes(b"hello world");
        let b = ContentHash::from_bytes(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = ContentHash::from_bytes(b"hello");
        let b = ContentHash::from_bytes(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn display_format() {
        let h = ContentHash::from_bytes(b"test");
        let s = format!("{h}");
        assert_eq!(s.len(), 32, "Display should be 32 hex chars");
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_parses_back() {
        let h = ContentHash::from_bytes(b"cache key");
        assert_eq!(ContentHash::from_hex(&h.to_string()), Some(h));
    }

    #[test]
    fn hex_rejects_non_keys() {
        assert!(ContentHash::from_hex("manifest.json").is_none());
        assert!(ContentHash::from_hex("zz").is_none());
        assert!(ContentHash::from_hex(&"g".repeat(32)).is_none());
    }

    #[test]
    fn debug_abbreviated() {
        let h = ContentHash::from_bytes(b"test");
        let s = format!("{h:?}");
        assert!(s.starts_with("ContentHash("));
        assert!(s.ends_with(")"));
    }

    #[test]
    fn serde_roundtrip() {
        let h = ContentHash::from_bytes(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn hasher_fields_are_length_prefixed() {
        let a = ContentHasher::new().write_str("ab").write_str("c").finish();
        let b = ContentHasher::new().write_str("a").write_str("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn hasher_field_types_are_tagged() {
        let a = ContentHasher::new().write_str("1").finish();
        let b = ContentHasher::new().write_bytes(b"1").finish();
        assert_ne!(a, b);
    }
}
