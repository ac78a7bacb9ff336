//! Hashing utilities for content-addressed cache keys
//!
//! Unlike `DefaultHasher`, SHA-256 digests are stable across processes and
//! releases, so they can be baked into image tags.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of arbitrary content
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}

/// Shorten a hex digest to `len` characters (never longer than the digest)
pub fn short_hash(digest: &str, len: usize) -> &str {
    &digest[..len.min(digest.len())]
}

/// A cache key combining multiple string components
///
/// Components are length-prefixed before hashing so that `("ab", "c")` and
/// `("a", "bc")` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CompositeKey {
    components: Vec<String>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            components: Vec::with_capacity(capacity),
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.components.push(s.to_string());
    }

    pub fn with(mut self, s: &str) -> Self {
        self.push_str(s);
        self
    }

    /// Build a single hex digest from all components
    pub fn finalize(&self) -> String {
        let mut hasher = Sha256::new();
        for component in &self.components {
            hasher.update((component.len() as u64).to_le_bytes());
            hasher.update(component.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("apt-get install -y git"), content_hash("apt-get install -y git"));
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_content_hash_single_char_change() {
        assert_ne!(content_hash("echo a"), content_hash("echo b"));
    }

    #[test]
    fn test_composite_key_boundaries() {
        let key1 = CompositeKey::new().with("ab").with("c");
        let key2 = CompositeKey::new().with("a").with("bc");

        assert_ne!(key1.finalize(), key2.finalize());
        assert_eq!(key1.finalize(), CompositeKey::new().with("ab").with("c").finalize());
    }

    #[test]
    fn test_short_hash() {
        let digest = content_hash("x");
        assert_eq!(short_hash(&digest, 12).len(), 12);
        assert_eq!(short_hash("abc", 12), "abc");
    }
}
