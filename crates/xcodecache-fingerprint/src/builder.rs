//! Assembles the fingerprint pre-image for one target.
//!
//! The pre-image is a newline-joined document with a fixed section order;
//! its digest identifies the target's input equivalence class. Anything that
//! can differ between machines building the same checkout (absolute paths,
//! search-path churn) must be normalized out before it reaches the document.

use crate::hasher::{hash_bytes, FileHasher};
use crate::lockfile::SpecChecksums;
use crate::paths::strip_pwd;
use crate::FingerprintError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use xcodecache_pbx::{Project, Value, HEADERS_PHASE, RESOURCES_PHASE, SOURCES_PHASE};
use xcodecache_types::WARN_TAG;

/// Tag invalidating every cache entry when the fingerprint scheme changes.
pub const CACHE_VERSION: &str = "xcodecache-cache-v3";

/// A computed target fingerprint.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// Digest of the pre-image.
    pub digest: String,
    /// The pre-image itself, kept for sidecars and `message.txt`.
    pub text: String,
    /// Files whose contents the pre-image covers, sorted and deduplicated.
    pub source_files: Vec<PathBuf>,
}

/// Everything the builder reads for one target.
pub struct FingerprintInputs<'a> {
    pub project: &'a Project,
    pub target_id: &'a str,
    pub configuration: &'a str,
    pub build_args: &'a [String],
    /// Workspace root; stripped from every path in the pre-image.
    pub workspace_root: &'a Path,
    /// Include `-fmodule-map-file=` digests from `OTHER_CFLAGS`.
    pub detect_modulemap_dependency: bool,
}

/// Compute a fingerprint, enumerating the target's source files.
pub fn build_fingerprint(
    inputs: &FingerprintInputs<'_>,
    hasher: &mut FileHasher,
    checksums: &SpecChecksums,
) -> Result<Fingerprint, FingerprintError> {
    let sources = target_source_files(inputs.project, inputs.target_id);
    assemble(inputs, sources, hasher, checksums)
}

/// Recompute a fingerprint over a previously captured source list, as `post`
/// does to detect drift between `pre` and the finished build.
pub fn build_fingerprint_with_sources(
    inputs: &FingerprintInputs<'_>,
    sources: Vec<PathBuf>,
    hasher: &mut FileHasher,
    checksums: &SpecChecksums,
) -> Result<Fingerprint, FingerprintError> {
    assemble(inputs, sources, hasher, checksums)
}

/// Union of the files referenced by the sources, headers and resources
/// phases, with directory references expanded to contained regular files.
/// Sorted and deduplicated.
pub fn target_source_files(project: &Project, target_id: &str) -> Vec<PathBuf> {
    let mut files = BTreeSet::new();
    for isa in [SOURCES_PHASE, HEADERS_PHASE, RESOURCES_PHASE] {
        let Some(phase) = project.target_build_phase(target_id, isa) else {
            continue;
        };
        for build_file in project.build_phase_file_ids(&phase) {
            let Some(file_ref) = project.build_file_ref(&build_file) else {
                continue;
            };
            for member in project.flatten_file_ref(file_ref) {
                let Some(path) = project.resolve_file_path(&member) else {
                    debug!("unresolvable file reference {member}");
                    continue;
                };
                if path.is_dir() {
                    for entry in WalkDir::new(&path).into_iter().filter_map(Result::ok) {
                        if entry.file_type().is_file() {
                            files.insert(entry.into_path());
                        }
                    }
                } else {
                    files.insert(path);
                }
            }
        }
    }
    files.into_iter().collect()
}

fn assemble(
    inputs: &FingerprintInputs<'_>,
    sources: Vec<PathBuf>,
    hasher: &mut FileHasher,
    checksums: &SpecChecksums,
) -> Result<Fingerprint, FingerprintError> {
    let project = inputs.project;
    let target_id = inputs.target_id;
    let configuration = inputs.configuration;
    let target_name = project.target_name(target_id).unwrap_or(target_id);

    let mut sections: Vec<String> = Vec::new();
    sections.push(CACHE_VERSION.to_string());
    sections.push(filter_build_args(inputs.build_args).join(" "));

    // Spec checksum, keyed by the names this target may be registered under.
    let matches = spec_checksum_matches(inputs, checksums);
    if matches.len() != 1 {
        warn!(
            "{WARN_TAG} {} spec checksum matches for target {target_name}",
            matches.len()
        );
    }
    for (name, checksum) in matches {
        sections.push(format!("{name}: {checksum}"));
    }

    if let Some(basename) = project.xcodeproj_dir().file_name() {
        sections.push(basename.to_string_lossy().into_owned());
    }

    // Project- then target-level configuration and xcconfig.
    let project_config = project.project_configuration(configuration)?;
    let target_config = project.target_configuration(target_id, configuration);
    for config in [project_config, target_config].into_iter().flatten() {
        sections.push(Value::Dict(config.clone()).stable_text());
        if let Some(path) = project.base_configuration_path(config) {
            if let Some(filtered) = filtered_xcconfig(&path) {
                sections.push(filtered);
            }
        }
    }

    if let Some(settings) = per_file_settings(project, target_id) {
        sections.push(settings);
    }

    for path in &sources {
        let digest = hasher.digest(path)?;
        let shown = strip_pwd(&path.to_string_lossy(), inputs.workspace_root);
        sections.push(format!("{shown} : {digest}"));
    }

    if inputs.detect_modulemap_dependency {
        for line in modulemap_dependency_lines(inputs, hasher) {
            sections.push(line);
        }
    }

    let text = sections.join("\n");
    Ok(Fingerprint {
        digest: hash_bytes(text.as_bytes()),
        text,
        source_files: sources,
    })
}

/// Build arguments that never belong in a fingerprint: output-location
/// flags (with their value) and output-location variable assignments.
pub fn filter_build_args(args: &[String]) -> Vec<String> {
    const SKIP_WITH_VALUE: [&str; 5] = [
        "-derivedDataPath",
        "-archivePath",
        "--derived_data_path",
        "--archive_path",
        "--build_path",
    ];
    const SKIP_PREFIXES: [&str; 3] = ["DSTROOT=", "OBJROOT=", "SYMROOT="];

    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if SKIP_WITH_VALUE.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if SKIP_PREFIXES.iter().any(|prefix| arg.starts_with(prefix)) {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Candidate spec names for a target, filtered to those the lockfile knows.
fn spec_checksum_matches(
    inputs: &FingerprintInputs<'_>,
    checksums: &SpecChecksums,
) -> Vec<(String, String)> {
    let mut names = BTreeSet::new();
    for key in ["PRODUCT_NAME", "IBSC_MODULE"] {
        if let Some(value) =
            inputs
                .project
                .resolve_build_setting(inputs.target_id, inputs.configuration, key)
        {
            names.insert(value);
        }
    }
    for key in ["CONFIGURATION_BUILD_DIR", "PODS_TARGET_SRCROOT"] {
        if let Some(value) =
            inputs
                .project
                .resolve_build_setting(inputs.target_id, inputs.configuration, key)
        {
            if let Some(basename) = Path::new(&value).file_name() {
                names.insert(basename.to_string_lossy().into_owned());
            }
        }
    }
    names
        .into_iter()
        .filter_map(|name| {
            checksums
                .get(&name)
                .map(|checksum| (name, checksum.to_string()))
        })
        .collect()
}

/// xcconfig contents with `_SEARCH_PATHS` lines excluded, lexicographically
/// sorted so include-order churn does not shift the digest.
fn filtered_xcconfig(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let mut lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.contains("_SEARCH_PATHS"))
        .collect();
    lines.sort_unstable();
    Some(lines.join("\n"))
}

/// `basename` + stable settings text for every file in the sources phase
/// that carries non-empty per-file settings.
fn per_file_settings(project: &Project, target_id: &str) -> Option<String> {
    let phase = project.target_build_phase(target_id, SOURCES_PHASE)?;
    let mut lines = BTreeSet::new();
    for build_file in project.build_phase_file_ids(&phase) {
        let Some(settings) = project.build_file_settings(&build_file) else {
            continue;
        };
        if settings.is_empty() {
            continue;
        }
        let rendered = Value::Dict(settings.clone()).stable_text();
        let Some(file_ref) = project.build_file_ref(&build_file) else {
            continue;
        };
        for member in project.flatten_file_ref(file_ref) {
            if let Some(basename) = project.file_ref_basename(&member) {
                lines.insert(format!("{basename}\n{rendered}"));
            }
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.into_iter().collect::<Vec<_>>().join("\n"))
    }
}

/// Digest lines for `-fmodule-map-file=` paths in the target's resolved
/// `OTHER_CFLAGS`. Modulemaps of other pods are how one target's interface
/// leaks into another's compilation, so their contents belong in the digest.
fn modulemap_dependency_lines(
    inputs: &FingerprintInputs<'_>,
    hasher: &mut FileHasher,
) -> Vec<String> {
    const FLAG: &str = "-fmodule-map-file=";

    let Some(cflags) =
        inputs
            .project
            .resolve_build_setting(inputs.target_id, inputs.configuration, "OTHER_CFLAGS")
    else {
        return Vec::new();
    };

    let mut lines = BTreeSet::new();
    for token in cflags.split_whitespace() {
        let Some(raw) = token.strip_prefix(FLAG) else {
            continue;
        };
        let path = raw.trim_matches('"');
        if path.contains('$') {
            warn!("{WARN_TAG} unresolvable modulemap reference {path}");
            continue;
        }
        match hasher.digest(Path::new(path)) {
            Ok(digest) => {
                let shown = strip_pwd(path, inputs.workspace_root);
                lines.insert(format!("{shown} : {digest}"));
            }
            Err(err) => warn!("{WARN_TAG} skipping modulemap {path}: {err}"),
        }
    }
    lines.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use xcodecache_pbx::fixtures::write_fixture_project;

    const LOCKFILE: &str = "\
SPEC CHECKSUMS:
  Alamofire: 0123abcd0123abcd0123abcd0123abcd0123abcd
";

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        project: Project,
        target_id: String,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let dir = write_fixture_project(&root);
        fs::write(root.join("Podfile.lock"), LOCKFILE).unwrap();
        let project = Project::open(&dir).unwrap();
        let target_id = project
            .native_target_ids()
            .unwrap()
            .into_iter()
            .find(|id| project.target_name(id) == Some("Alamofire"))
            .unwrap();
        Fixture {
            _tmp: tmp,
            root,
            project,
            target_id,
        }
    }

    fn compute(fx: &Fixture, args: &[String]) -> Fingerprint {
        let inputs = FingerprintInputs {
            project: &fx.project,
            target_id: &fx.target_id,
            configuration: "Debug",
            build_args: args,
            workspace_root: &fx.root,
            detect_modulemap_dependency: true,
        };
        let mut hasher = FileHasher::new();
        let checksums = SpecChecksums::load(&fx.root);
        build_fingerprint(&inputs, &mut hasher, &checksums).unwrap()
    }

    #[test]
    fn deterministic_across_runs() {
        let fx = fixture();
        let first = compute(&fx, &[]);
        let second = compute(&fx, &[]);
        assert_eq!(first.text, second.text);
        assert_eq!(first.digest, second.digest);
        // Sources phase files, headers none, resources folder expanded.
        assert_eq!(first.source_files.len(), 3);
    }

    #[test]
    fn sensitive_to_source_edits() {
        let fx = fixture();
        let before = compute(&fx, &[]);
        fs::write(
            fx.root.join("Alamofire/Source/AF.swift"),
            "public enum AF { case changed }\n",
        )
        .unwrap();
        let after = compute(&fx, &[]);
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn sensitive_to_relevant_args_only() {
        let fx = fixture();
        let plain = compute(&fx, &[]);
        let with_sdk = compute(&fx, &["-sdk".into(), "iphoneos".into()]);
        assert_ne!(plain.digest, with_sdk.digest);

        let with_noise = compute(
            &fx,
            &[
                "-derivedDataPath".into(),
                "/tmp/dd".into(),
                "SYMROOT=/tmp/sym".into(),
            ],
        );
        assert_eq!(plain.digest, with_noise.digest);
    }

    #[test]
    fn insensitive_to_search_paths() {
        let fx = fixture();
        let before = compute(&fx, &[]);
        let xcconfig = fx.root.join("Alamofire.debug.xcconfig");
        let mut text = fs::read_to_string(&xcconfig).unwrap();
        text.push_str("HEADER_SEARCH_PATHS = $(inherited) /opt/include\n");
        fs::write(&xcconfig, text).unwrap();
        let after = compute(&fx, &[]);
        assert_eq!(before.digest, after.digest);
    }

    #[test]
    fn preimage_has_no_workspace_root() {
        let fx = fixture();
        let fp = compute(&fx, &[]);
        assert!(!fp.text.contains(&*fx.root.to_string_lossy()));
        assert!(fp.text.contains("Alamofire/Source/AF.swift : "));
        assert!(fp.text.starts_with(CACHE_VERSION));
        assert!(fp.text.contains("Alamofire: 0123abcd"));
    }

    #[test]
    fn relocating_the_checkout_keeps_the_digest() {
        let fx = fixture();
        let here = compute(&fx, &["-configuration".into(), "Debug".into()]);

        let other = TempDir::new().unwrap();
        let moved_root = other.path().join("elsewhere");
        fs::create_dir_all(&moved_root).unwrap();
        copy_tree(&fx.root, &moved_root);
        let project = Project::open(&moved_root.join("Fixture.xcodeproj")).unwrap();
        let target_id = project
            .native_target_ids()
            .unwrap()
            .into_iter()
            .find(|id| project.target_name(id) == Some("Alamofire"))
            .unwrap();
        let inputs = FingerprintInputs {
            project: &project,
            target_id: &target_id,
            configuration: "Debug",
            build_args: &["-configuration".into(), "Debug".into()],
            workspace_root: &moved_root,
            detect_modulemap_dependency: true,
        };
        let mut hasher = FileHasher::new();
        let checksums = SpecChecksums::load(&moved_root);
        let there = build_fingerprint(&inputs, &mut hasher, &checksums).unwrap();

        assert_eq!(here.digest, there.digest);
    }

    #[test]
    fn filters_noise_arguments() {
        let args: Vec<String> = [
            "-configuration",
            "Debug",
            "-derivedDataPath",
            "/tmp/dd",
            "OBJROOT=/tmp/obj",
            "-sdk",
            "iphoneos",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            filter_build_args(&args),
            vec!["-configuration", "Debug", "-sdk", "iphoneos"]
        );
    }

    fn copy_tree(from: &Path, to: &Path) {
        for entry in WalkDir::new(from).into_iter().filter_map(Result::ok) {
            let rel = entry.path().strip_prefix(from).unwrap();
            if rel.as_os_str().is_empty() {
                continue;
            }
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest).unwrap();
            } else {
                fs::copy(entry.path(), &dest).unwrap();
            }
        }
    }
}
