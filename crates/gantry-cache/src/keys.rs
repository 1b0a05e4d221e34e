//! Cache key derivation.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Everything that feeds a cache key.
#[derive(Debug, Clone, Default)]
pub struct KeyInputs<'a> {
    pub scope: &'a str,
    /// Interpolated key prefix from the job's cache config.
    pub prefix: &'a str,
    /// Required labels of the job instance (carries the OS label).
    pub labels: Option<&'a BTreeSet<String>>,
    /// `(path, contents)` of each hashed file; `None` when the file is absent.
    pub files: Vec<(String, Option<Vec<u8>>)>,
}

/// Derive a deterministic key: `<scope>-<prefix>-<digest>`.
///
/// Identical inputs always produce the same key; any change to the prefix,
/// labels or file contents produces a different one.
pub fn compute_key(inputs: &KeyInputs<'_>) -> String {
    let mut hasher = Sha256::new();

    update_field(&mut hasher, inputs.scope.as_bytes());
    update_field(&mut hasher, inputs.prefix.as_bytes());

    if let Some(labels) = inputs.labels {
        for label in labels {
            update_field(&mut hasher, label.as_bytes());
        }
    }
    hasher.update(b"\0files\0");

    for (path, contents) in &inputs.files {
        update_field(&mut hasher, path.as_bytes());
        match contents {
            Some(bytes) => {
                hasher.update([1u8]);
                update_field(&mut hasher, bytes);
            }
            None => hasher.update([0u8]),
        }
    }

    let hash = hasher.finalize();
    let hash_str = hex::encode(&hash[..8]);

    format!(
        "{}-{}-{}",
        sanitize_key(inputs.scope),
        sanitize_key(inputs.prefix),
        hash_str
    )
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_is_deterministic() {
        let l = labels(&["os=linux"]);
        let inputs = KeyInputs {
            scope: "cargo",
            prefix: "cargo-linux",
            labels: Some(&l),
            files: vec![("Cargo.lock".into(), Some(b"lock v1".to_vec()))],
        };
        assert_eq!(compute_key(&inputs), compute_key(&inputs.clone()));
        assert!(compute_key(&inputs).starts_with("cargo-cargo-linux-"));
    }

    #[test]
    fn test_changed_inputs_change_key() {
        let linux = labels(&["os=linux"]);
        let macos = labels(&["os=macos"]);
        let base = KeyInputs {
            scope: "cargo",
            prefix: "cargo",
            labels: Some(&linux),
            files: vec![("Cargo.lock".into(), Some(b"lock v1".to_vec()))],
        };

        let mut lock_changed = base.clone();
        lock_changed.files = vec![("Cargo.lock".into(), Some(b"lock v2".to_vec()))];

        let mut os_changed = base.clone();
        os_changed.labels = Some(&macos);

        let mut lock_missing = base.clone();
        lock_missing.files = vec![("Cargo.lock".into(), None)];

        let k = compute_key(&base);
        assert_ne!(k, compute_key(&lock_changed));
        assert_ne!(k, compute_key(&os_changed));
        assert_ne!(k, compute_key(&lock_missing));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("my/cache/key"), "my_cache_key");
        assert_eq!(sanitize_key("cache:key"), "cache_key");
    }
}
