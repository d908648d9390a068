//! On-disk cache of built products.
//!
//! Each entry is a directory `{target}-{digest}-{epoch_ms}` holding the
//! product archive, its stripped context and the human-readable fingerprint
//! pre-image. The store self-heals: anything that fails verification is
//! deleted on encounter and the target falls through to a miss.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use xcodecache_fingerprint::hash_file;
use xcodecache_types::{TargetContext, ERROR_TAG};

mod archive;

pub use archive::{create_product_archive, rewrite_modulemaps, unpack_archive};

/// Files every well-formed entry contains.
pub const PRODUCT_FILE: &str = "product.tar";
pub const CONTEXT_FILE: &str = "context.yml";
pub const MESSAGE_FILE: &str = "message.txt";

/// Verified candidates examined per lookup when entries carry
/// inter-target dependencies.
const MAX_CANDIDATES: usize = 10;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache walk failure: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("not a product directory: {0}")]
    InvalidProductDir(PathBuf),
    #[error(transparent)]
    Context(#[from] xcodecache_types::ContextError),
}

/// A verified cache entry usable for a hit.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub dir: PathBuf,
    pub context: TargetContext,
}

/// The cache root directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    capacity: usize,
}

impl CacheStore {
    pub fn new(root: PathBuf, capacity: usize) -> Self {
        Self { root, capacity }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new entry from a finished build: moves `archive_path` into
    /// place, persists the stripped context (with the archive digest) and the
    /// pre-image message. Returns the entry directory.
    pub fn insert(
        &self,
        context: &TargetContext,
        archive_path: &Path,
        message: &str,
    ) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut stamp = epoch_ms();
        let dir = loop {
            let dir = self.root.join(format!(
                "{}-{}-{stamp}",
                context.target_name, context.target_digest
            ));
            match fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(source) => return Err(StoreError::Io { path: dir, source }),
            }
        };

        let product_digest = hash_file(archive_path).map_err(|source| StoreError::Io {
            path: archive_path.to_path_buf(),
            source,
        })?;
        move_file(archive_path, &dir.join(PRODUCT_FILE))?;

        let mut stored = context.stripped();
        stored.product_digest = Some(product_digest);
        stored.save(&dir.join(CONTEXT_FILE))?;

        fs::write(dir.join(MESSAGE_FILE), message).map_err(|source| StoreError::Io {
            path: dir.join(MESSAGE_FILE),
            source,
        })?;

        info!("cached {} -> {}", context.target_name, dir.display());
        Ok(dir)
    }

    /// Verified candidates for `{target_name}, {target_digest}`, newest
    /// first. Corrupt entries encountered along the way are deleted. Stops
    /// after the first candidate that records no inter-target dependencies,
    /// or after [`MAX_CANDIDATES`] otherwise.
    pub fn candidates(&self, target_name: &str, target_digest: &str) -> Vec<Candidate> {
        let prefix = format!("{target_name}-{target_digest}-");
        let mut dirs: Vec<(PathBuf, SystemTime)> = Vec::new();
        let Ok(read) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        for entry in read.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !entry.path().is_dir() {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            dirs.push((entry.path(), mtime));
        }
        dirs.sort_by(|a, b| b.1.cmp(&a.1));

        let mut found = Vec::new();
        for (dir, _) in dirs {
            match self.verify(&dir, target_digest) {
                Ok(candidate) => {
                    let standalone = candidate.context.dependency_targets.is_empty();
                    found.push(candidate);
                    if standalone || found.len() >= MAX_CANDIDATES {
                        break;
                    }
                }
                Err(reason) => {
                    warn!("{ERROR_TAG} removing corrupt cache entry {}: {reason}", dir.display());
                    if let Err(err) = fs::remove_dir_all(&dir) {
                        warn!("{ERROR_TAG} could not remove {}: {err}", dir.display());
                    }
                }
            }
        }
        found
    }

    /// Full verification of one entry; an `Err` describes why it is corrupt.
    fn verify(&self, dir: &Path, target_digest: &str) -> Result<Candidate, String> {
        let context = TargetContext::load(&dir.join(CONTEXT_FILE))
            .map_err(|err| format!("unreadable context: {err}"))?;
        if context.target_digest != target_digest {
            return Err(format!(
                "recorded target digest {} does not match entry name",
                context.target_digest
            ));
        }
        let product = dir.join(PRODUCT_FILE);
        let recorded = context
            .product_digest
            .as_deref()
            .ok_or_else(|| "context records no product digest".to_string())?;
        let actual =
            hash_file(&product).map_err(|err| format!("unreadable {PRODUCT_FILE}: {err}"))?;
        if actual != recorded {
            return Err(format!(
                "product digest mismatch (recorded {recorded}, found {actual})"
            ));
        }
        Ok(Candidate {
            dir: dir.to_path_buf(),
            context,
        })
    }

    /// Refresh an entry's mtime so eviction sees it as recently used.
    pub fn touch(entry_dir: &Path) -> io::Result<()> {
        File::open(entry_dir)?.set_modified(SystemTime::now())
    }

    /// Drop the oldest entries beyond the configured capacity.
    /// Returns how many were removed.
    pub fn evict(&self) -> Result<usize, StoreError> {
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        for entry in read.filter_map(Result::ok) {
            if !entry.path().is_dir() {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            entries.push((entry.path(), mtime));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (dir, _) in entries.into_iter().skip(self.capacity) {
            debug!("evicting {}", dir.display());
            fs::remove_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove the entire cache root.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Rename, falling back to copy+remove for cross-device moves (build
/// products and the cache root commonly live on different volumes).
fn move_file(from: &Path, to: &Path) -> Result<(), StoreError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|source| StoreError::Io {
        path: to.to_path_buf(),
        source,
    })?;
    fs::remove_file(from).map_err(|source| StoreError::Io {
        path: from.to_path_buf(),
        source,
    })
}
