//! Helpers for keeping file system layout out of span fields and audit
//! metadata.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Returns only the filename component of a path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Short deterministic hash of a path, for correlating spans of the same
/// file without exposing where it lives.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(&PathBuf::from("/home/user/imports/customers.csv")),
            "customers.csv"
        );
    }

    #[test]
    fn test_redact_path_root() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_hash_path_deterministic() {
        let a = hash_path(Path::new("/data/a.csv"));
        assert_eq!(a, hash_path(Path::new("/data/a.csv")));
        assert_ne!(a, hash_path(Path::new("/data/b.csv")));
        assert_eq!(a.len(), 16);
    }
}
