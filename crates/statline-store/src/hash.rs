use sha2::{Digest, Sha256};

/// Compute a canonical SHA-256 hash of a payload, returned as 64-char hex.
///
/// JSON payloads are re-parsed and re-serialized before hashing so that key
/// order and insignificant whitespace don't produce distinct hashes for the
/// same data. Anything that isn't valid JSON is hashed as raw bytes.
pub fn canonical_hash(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        // serde_json maps are BTreeMap-backed: serialization is key-sorted.
        Ok(value) => hash_bytes(value.to_string().as_bytes()),
        Err(_) => hash_bytes(content.as_bytes()),
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let h1 = canonical_hash("final score: 21-17");
        let h2 = canonical_hash("final score: 21-17");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_different_inputs_differ() {
        assert_ne!(canonical_hash("ravens"), canonical_hash("chiefs"));
    }

    #[test]
    fn test_json_hash_ignores_key_order() {
        let a = r#"{"home": "ravens", "away": "chiefs", "score": [21, 17]}"#;
        let b = r#"{"score": [21, 17], "away": "chiefs", "home": "ravens"}"#;
        assert_eq!(canonical_hash(a), canonical_hash(b));
    }

    #[test]
    fn test_json_hash_ignores_whitespace() {
        let a = r#"{"home":"ravens"}"#;
        let b = "{ \"home\" : \"ravens\" }";
        assert_eq!(canonical_hash(a), canonical_hash(b));
    }

    #[test]
    fn test_array_order_still_matters() {
        let a = r#"[1, 2, 3]"#;
        let b = r#"[3, 2, 1]"#;
        assert_ne!(canonical_hash(a), canonical_hash(b));
    }
}
