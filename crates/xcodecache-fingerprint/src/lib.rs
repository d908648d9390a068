//! Deterministic target fingerprints.
//!
//! A target's fingerprint digests everything that should invalidate its
//! cached product: build arguments, pod checksums, build configurations,
//! per-file settings and source contents. Equal fingerprints mean a cached
//! product may be substituted for a build.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

mod builder;
mod hasher;
mod lockfile;
mod paths;

pub use builder::{
    build_fingerprint, build_fingerprint_with_sources, filter_build_args, target_source_files,
    Fingerprint, FingerprintInputs, CACHE_VERSION,
};
pub use hasher::{hash_bytes, hash_file, FileHasher};
pub use lockfile::{SpecChecksums, LOCKFILE_NAME};
pub use paths::strip_pwd;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("source file not found: {path} (src root {src_root:?})")]
    SourceNotFound {
        path: PathBuf,
        src_root: Option<PathBuf>,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Project(#[from] xcodecache_pbx::ProjectError),
}
