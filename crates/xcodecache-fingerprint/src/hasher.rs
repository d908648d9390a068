//! Memoizing file digests.

use crate::FingerprintError;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Per-run digest cache.
///
/// Memoization is keyed by the requested path, not the resolved one; a
/// relative path is retried under the active source root. Fingerprints are
/// computed with one stable source root per target, so the first resolution
/// wins by construction.
#[derive(Debug, Default)]
pub struct FileHasher {
    memo: HashMap<PathBuf, String>,
    src_root: Option<PathBuf>,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root used to retry paths that do not resolve as given.
    pub fn set_src_root(&mut self, src_root: Option<PathBuf>) {
        self.src_root = src_root;
    }

    /// Digest of the file at `path`, retried under the source root.
    pub fn digest(&mut self, path: &Path) -> Result<String, FingerprintError> {
        if let Some(hit) = self.memo.get(path) {
            return Ok(hit.clone());
        }
        let resolved = if path.is_file() {
            path.to_path_buf()
        } else {
            let retried = self.src_root.as_ref().map(|root| root.join(path));
            match retried {
                Some(p) if p.is_file() => p,
                _ => {
                    return Err(FingerprintError::SourceNotFound {
                        path: path.to_path_buf(),
                        src_root: self.src_root.clone(),
                    })
                }
            }
        };
        let digest = hash_file(&resolved).map_err(|source| FingerprintError::Io {
            path: resolved,
            source,
        })?;
        self.memo.insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }
}

/// Streaming digest of one file.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Digest of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn memoizes_by_requested_path() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.swift"), "one").unwrap();

        let mut hasher = FileHasher::new();
        hasher.set_src_root(Some(tmp.path().to_path_buf()));
        let first = hasher.digest(Path::new("a.swift")).unwrap();

        // Content changes are not observed again within a run.
        fs::write(tmp.path().join("a.swift"), "two").unwrap();
        let second = hasher.digest(Path::new("a.swift")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut hasher = FileHasher::new();
        let err = hasher.digest(Path::new("/nonexistent/zz.swift")).unwrap_err();
        assert!(matches!(err, FingerprintError::SourceNotFound { .. }));
    }

    #[test]
    fn bytes_and_file_agree() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        fs::write(&path, b"payload").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"payload"));
    }
}
