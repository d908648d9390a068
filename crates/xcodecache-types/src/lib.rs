//! Core types for the xcodecache build cache.
//!
//! Defines the run configuration read from the environment and the per-target
//! context record that carries state between the `pre`, `printenv`, `extract`
//! and `post` stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix for warning diagnostics (a target is skipped, the build continues).
pub const WARN_TAG: &str = "[XcodeCache/W]";
/// Prefix for fatal or corruption diagnostics.
pub const ERROR_TAG: &str = "[XcodeCache/E]";

pub const ENV_CACHE_ROOT: &str = "XcodeCache_CACHE_ROOT";
pub const ENV_CACHE_COUNT: &str = "XcodeCache_CACHE_COUNT";
pub const ENV_MIN_SOURCE_FILE_COUNT: &str = "XcodeCache_MIN_SOURCE_FILE_COUNT";
pub const ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY: &str =
    "XcodeCache_NOT_DETECT_MODULE_MAP_DEPENDENCY";
pub const ENV_CLEAR_ALL: &str = "XcodeCache_CLEAR_ALL";

/// Build-tool environment variables captured by `printenv` for each target.
pub const BUILD_ENV_KEYS: [&str; 9] = [
    "SYMROOT",
    "CONFIGURATION_BUILD_DIR",
    "OBJROOT",
    "TARGET_TEMP_DIR",
    "TARGET_BUILD_DIR",
    "PODS_XCFRAMEWORKS_BUILD_DIR",
    "MODULEMAP_FILE",
    "SRCROOT",
    "FULL_PRODUCT_NAME",
];

/// Keys that must be present before a MISS_READY target may be archived.
pub const REQUIRED_BUILD_ENV_KEYS: [&str; 7] = [
    "SYMROOT",
    "CONFIGURATION_BUILD_DIR",
    "OBJROOT",
    "TARGET_TEMP_DIR",
    "TARGET_BUILD_DIR",
    "SRCROOT",
    "FULL_PRODUCT_NAME",
];

/// Absolute-path variables stripped from a context before it is persisted
/// into a cache entry, so entries stay machine-independent.
pub const STRIPPED_BUILD_ENV_KEYS: [&str; 6] = [
    "SYMROOT",
    "CONFIGURATION_BUILD_DIR",
    "OBJROOT",
    "TARGET_TEMP_DIR",
    "PODS_XCFRAMEWORKS_BUILD_DIR",
    "SRCROOT",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
    #[error("could not determine home directory for the default cache root")]
    NoHomeDir,
}

/// Run configuration, read once per stage from `XcodeCache_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding cache entries.
    pub cache_root: PathBuf,
    /// Maximum number of cache entries kept after eviction.
    pub cache_count: usize,
    /// Targets with fewer source files than this are not cached.
    pub min_source_file_count: usize,
    /// Whether `-fmodule-map-file=` paths participate in the fingerprint.
    pub detect_modulemap_dependency: bool,
    /// Whether `pre` wipes the entire cache root before running.
    pub clear_all: bool,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cache_root = match non_empty_var(ENV_CACHE_ROOT) {
            Some(v) => PathBuf::from(v),
            None => directories::UserDirs::new()
                .map(|d| d.home_dir().join("XcodeCache"))
                .ok_or(ConfigError::NoHomeDir)?,
        };

        let cache_count = parse_count(ENV_CACHE_COUNT, 10_000)?;
        let min_source_file_count = parse_count(ENV_MIN_SOURCE_FILE_COUNT, 1)?;

        Ok(Self {
            cache_root,
            cache_count,
            min_source_file_count,
            detect_modulemap_dependency: non_empty_var(ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY)
                .is_none(),
            clear_all: non_empty_var(ENV_CLEAR_ALL).as_deref() == Some("YES"),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_count(var: &str, default: usize) -> Result<usize, ConfigError> {
    match non_empty_var(var) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: v,
        }),
        None => Ok(default),
    }
}

/// Where a target stands in the cache protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// No usable cache entry was found in `pre`; a `printenv` phase was injected.
    Miss,
    /// The build ran and `printenv` captured the target's environment.
    MissReady,
    /// A verified cache entry was bound and an `extract` phase was injected.
    Hit,
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("failed to read context {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write context {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed context {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize context for {target}: {source}")]
    Serialize {
        target: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("context for {target} is missing field {field}")]
    MissingField {
        target: String,
        field: &'static str,
    },
}

/// Per-target state record.
///
/// The schema is flat: the same record backs the sidecar files that pass
/// state between stages and the `context.yml` persisted into cache entries.
/// Which optional fields are populated depends on [`TargetStatus`]; the
/// in-memory view of that dependency is [`TargetState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetContext {
    pub target_name: String,
    /// Present in sidecars; stripped from persisted cache entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TargetStatus>,
    pub target_digest: String,
    /// Fingerprint pre-image, kept for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_text: Option<String>,
    /// Source files the fingerprint covered, for the `post` recompute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_files: Vec<PathBuf>,
    /// Build-tool variables captured by `printenv`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_env: BTreeMap<String, String>,
    /// Digest of `product.tar`, recorded on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_digest: Option<String>,
    /// `CONFIGURATION_BUILD_DIR` relative to `SYMROOT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_product_dir: Option<String>,
    /// `TARGET_TEMP_DIR` relative to `OBJROOT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_intermediate_dir: Option<String>,
    /// `MODULEMAP_FILE` relative to the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulemap_file: Option<String>,
    /// Digests of other targets this entry was built against.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_targets: BTreeMap<String, String>,
    /// Cache entry bound to this target on a hit. Never persisted into entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_cache_dir: Option<PathBuf>,
}

impl TargetContext {
    /// Fresh MISS context as written by `pre`.
    pub fn miss(
        target_name: impl Into<String>,
        target_digest: impl Into<String>,
        fingerprint_text: impl Into<String>,
        source_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            status: Some(TargetStatus::Miss),
            target_digest: target_digest.into(),
            fingerprint_text: Some(fingerprint_text.into()),
            source_files,
            build_env: BTreeMap::new(),
            product_digest: None,
            build_product_dir: None,
            build_intermediate_dir: None,
            modulemap_file: None,
            dependency_targets: BTreeMap::new(),
            hit_cache_dir: None,
        }
    }

    /// Load a context from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ContextError> {
        let text = fs::read_to_string(path).map_err(|source| ContextError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ContextError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the context to a YAML file.
    pub fn save(&self, path: &Path) -> Result<(), ContextError> {
        let text = serde_yaml::to_string(self).map_err(|source| ContextError::Serialize {
            target: self.target_name.clone(),
            source,
        })?;
        fs::write(path, text).map_err(|source| ContextError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reduce the record to what a cache entry may carry: no status-transient
    /// data and no absolute paths from the machine that produced it.
    pub fn stripped(&self) -> Self {
        let mut build_env = self.build_env.clone();
        for key in STRIPPED_BUILD_ENV_KEYS {
            build_env.remove(key);
        }
        build_env.remove("MODULEMAP_FILE");
        Self {
            target_name: self.target_name.clone(),
            status: None,
            target_digest: self.target_digest.clone(),
            fingerprint_text: None,
            source_files: Vec::new(),
            build_env,
            product_digest: self.product_digest.clone(),
            build_product_dir: self.build_product_dir.clone(),
            build_intermediate_dir: self.build_intermediate_dir.clone(),
            modulemap_file: self.modulemap_file.clone(),
            dependency_targets: self.dependency_targets.clone(),
            hit_cache_dir: None,
        }
    }
}

/// Sidecar file name for a target, placed inside the project directory.
pub fn sidecar_path(project_dir: &Path, target_name: &str) -> PathBuf {
    project_dir.join(format!("{target_name}{SIDECAR_SUFFIX}"))
}

/// Suffix shared by all target-context sidecar files.
pub const SIDECAR_SUFFIX: &str = ".xcodecache_target_context.yml";

/// Status-dependent view of a [`TargetContext`].
///
/// Each variant carries exactly the fields that are meaningful in that
/// state, so stage code can match instead of probing options.
#[derive(Debug, Clone)]
pub enum TargetState {
    Miss {
        target_digest: String,
        fingerprint_text: String,
        source_files: Vec<PathBuf>,
    },
    MissReady {
        target_digest: String,
        fingerprint_text: String,
        source_files: Vec<PathBuf>,
        build_env: BTreeMap<String, String>,
    },
    Hit {
        target_digest: String,
        hit_cache_dir: PathBuf,
        build_product_dir: String,
        build_intermediate_dir: String,
        modulemap_file: Option<String>,
        dependency_targets: BTreeMap<String, String>,
    },
}

impl TargetState {
    pub fn status(&self) -> TargetStatus {
        match self {
            TargetState::Miss { .. } => TargetStatus::Miss,
            TargetState::MissReady { .. } => TargetStatus::MissReady,
            TargetState::Hit { .. } => TargetStatus::Hit,
        }
    }

    /// Interpret a flat record, verifying that the fields its status
    /// promises are actually present.
    pub fn from_context(ctx: TargetContext) -> Result<Self, ContextError> {
        let target = ctx.target_name.clone();
        let missing = move |field| ContextError::MissingField {
            target: target.clone(),
            field,
        };
        let status = ctx.status.ok_or_else(|| missing("status"))?;
        match status {
            TargetStatus::Miss => Ok(TargetState::Miss {
                fingerprint_text: ctx
                    .fingerprint_text
                    .ok_or_else(|| missing("fingerprint_text"))?,
                source_files: ctx.source_files,
                target_digest: ctx.target_digest,
            }),
            TargetStatus::MissReady => Ok(TargetState::MissReady {
                fingerprint_text: ctx
                    .fingerprint_text
                    .ok_or_else(|| missing("fingerprint_text"))?,
                source_files: ctx.source_files,
                build_env: ctx.build_env,
                target_digest: ctx.target_digest,
            }),
            TargetStatus::Hit => Ok(TargetState::Hit {
                hit_cache_dir: ctx.hit_cache_dir.ok_or_else(|| missing("hit_cache_dir"))?,
                build_product_dir: ctx
                    .build_product_dir
                    .ok_or_else(|| missing("build_product_dir"))?,
                build_intermediate_dir: ctx
                    .build_intermediate_dir
                    .ok_or_else(|| missing("build_intermediate_dir"))?,
                modulemap_file: ctx.modulemap_file,
                dependency_targets: ctx.dependency_targets,
                target_digest: ctx.target_digest,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ready_context() -> TargetContext {
        let mut ctx = TargetContext::miss(
            "Alamofire",
            "aa11",
            "line one\nline two",
            vec![PathBuf::from("/repo/Pods/Alamofire/Source/AF.swift")],
        );
        ctx.status = Some(TargetStatus::MissReady);
        ctx.build_env
            .insert("SYMROOT".into(), "/tmp/DerivedData/Build/Products".into());
        ctx.build_env.insert("FULL_PRODUCT_NAME".into(), "Alamofire.framework".into());
        ctx
    }

    #[test]
    fn context_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = sidecar_path(tmp.path(), "Alamofire");
        assert!(path.ends_with("Alamofire.xcodecache_target_context.yml"));

        let ctx = ready_context();
        ctx.save(&path).unwrap();
        let loaded = TargetContext::load(&path).unwrap();
        assert_eq!(loaded.target_name, "Alamofire");
        assert_eq!(loaded.status, Some(TargetStatus::MissReady));
        assert_eq!(loaded.build_env["FULL_PRODUCT_NAME"], "Alamofire.framework");
        assert_eq!(loaded.source_files.len(), 1);
    }

    #[test]
    fn stripped_removes_transient_and_absolute_fields() {
        let mut ctx = ready_context();
        ctx.product_digest = Some("bb22".into());
        ctx.build_product_dir = Some("Debug-iphoneos/Alamofire".into());

        let stripped = ctx.stripped();
        assert!(stripped.fingerprint_text.is_none());
        assert!(stripped.source_files.is_empty());
        assert!(!stripped.build_env.contains_key("SYMROOT"));
        assert_eq!(stripped.build_env["FULL_PRODUCT_NAME"], "Alamofire.framework");
        assert_eq!(stripped.product_digest.as_deref(), Some("bb22"));
        assert_eq!(
            stripped.build_product_dir.as_deref(),
            Some("Debug-iphoneos/Alamofire")
        );
    }

    #[test]
    fn state_requires_status_fields() {
        let mut ctx = ready_context();
        ctx.status = Some(TargetStatus::Hit);
        // A hit context without its cache dir is malformed.
        assert!(TargetState::from_context(ctx).is_err());

        let ok = TargetState::from_context(ready_context()).unwrap();
        assert_eq!(ok.status(), TargetStatus::MissReady);
    }

    #[test]
    fn config_defaults() {
        // Only exercise the parse helpers, not process-global env.
        assert_eq!(parse_count("XcodeCache_TEST_UNSET_COUNT", 7).unwrap(), 7);
    }
}
