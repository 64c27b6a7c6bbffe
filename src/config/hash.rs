//! Content hashing for change detection.
//!
//! Every file-like step (files, manifests, chart values) is compared by
//! sha256 of its content, never by existence or substring.

use sha2::{Digest, Sha256};

use crate::error::{ConfigError, Result};

/// Hasher for payload content.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHasher;

impl ContentHasher {
    /// Creates a new content hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hex sha256 of raw bytes.
    #[must_use]
    pub fn hash_bytes(&self, content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Hex sha256 of a string.
    #[must_use]
    pub fn hash_str(&self, content: &str) -> String {
        self.hash_bytes(content.as_bytes())
    }

    /// Hex sha256 of chart values.
    ///
    /// Values are rendered back to YAML first so that formatting differences
    /// in the plan file do not register as changes. A null value hashes like
    /// an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the values cannot be rendered as YAML.
    pub fn hash_values(&self, values: &serde_yaml::Value) -> Result<String> {
        let rendered = if values.is_null() {
            String::from("{}\n")
        } else {
            serde_yaml::to_string(values)
                .map_err(|e| ConfigError::validation(format!("cannot render chart values: {e}"), "values"))?
        };
        Ok(self.hash_str(&rendered))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_known_value() {
        let hasher = ContentHasher::new();
        assert_eq!(
            hasher.hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_values_hash_ignores_formatting() {
        let hasher = ContentHasher::new();
        let a: serde_yaml::Value = serde_yaml::from_str("controller: {replicaCount: 1}").unwrap();
        let b: serde_yaml::Value =
            serde_yaml::from_str("controller:\n    replicaCount:   1\n").unwrap();
        assert_eq!(hasher.hash_values(&a).unwrap(), hasher.hash_values(&b).unwrap());

        let c: serde_yaml::Value = serde_yaml::from_str("controller: {replicaCount: 2}").unwrap();
        assert_ne!(hasher.hash_values(&a).unwrap(), hasher.hash_values(&c).unwrap());
    }

    #[test]
    fn test_null_values_hash_like_empty_mapping() {
        let hasher = ContentHasher::new();
        let empty: serde_yaml::Value = serde_yaml::from_str("{}").unwrap();
        assert_eq!(
            hasher.hash_values(&serde_yaml::Value::Null).unwrap(),
            hasher.hash_values(&empty).unwrap()
        );
    }

    #[test]
    fn test_values_hash_matches_rendered_yaml() {
        let hasher = ContentHasher::new();
        let values: serde_yaml::Value = serde_yaml::from_str("service: {type: NodePort, port: 80}").unwrap();
        let rendered = serde_yaml::to_string(&values).unwrap();
        assert_eq!(hasher.hash_values(&values).unwrap(), hasher.hash_str(&rendered));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ContentHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ContentHasher::hashes_match("abc123", "abc123"));
        assert!(!ContentHasher::hashes_match("abc123", "abc124"));
        assert!(!ContentHasher::hashes_match("abc123", "abc12"));
    }
}
