//! The `post` stage: archive what the build produced, restore the projects,
//! and bound the cache.

use crate::error::StageError;
use crate::workspace::{self, BuildWorkspace};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use xcodecache_fingerprint::{
    build_fingerprint_with_sources, strip_pwd, FileHasher, FingerprintInputs, SpecChecksums,
};
use xcodecache_pbx::{backup, Project, STATIC_LIBRARY_PRODUCT_TYPE};
use xcodecache_store::{create_product_archive, rewrite_modulemaps, CacheStore};
use xcodecache_types::{
    sidecar_path, Config, TargetContext, TargetState, TargetStatus, REQUIRED_BUILD_ENV_KEYS,
    WARN_TAG,
};

#[derive(Debug)]
pub struct PostReport {
    pub archived: usize,
    pub hits: usize,
    pub skipped: usize,
    pub evicted: usize,
}

enum TargetOutcome {
    Archived,
    Skipped(String),
}

pub fn run(config: &Config, cwd: &Path, build_args: &[String]) -> Result<PostReport, StageError> {
    let started = Instant::now();
    let configuration = workspace::parse_configuration(build_args)?;

    let ws = BuildWorkspace::open(cwd)?;
    let store = CacheStore::new(config.cache_root.clone(), config.cache_count);
    let checksums = SpecChecksums::load(cwd);

    let mut archived = 0usize;
    let mut hits = 0usize;
    let mut skipped = 0usize;
    for (project_idx, target_id) in ws.cacheable_targets()? {
        let project = &ws.projects[project_idx];
        let target_name = project
            .target_name(&target_id)
            .unwrap_or(&target_id)
            .to_string();
        let sidecar = sidecar_path(project.xcodeproj_dir(), &target_name);
        if !sidecar.exists() {
            continue;
        }
        let state = match TargetContext::load(&sidecar).and_then(TargetState::from_context) {
            Ok(state) => state,
            Err(err) => {
                warn!("{WARN_TAG} unusable sidecar for {target_name}: {err}");
                skipped += 1;
                continue;
            }
        };
        match state {
            TargetState::Hit { modulemap_file, .. } => {
                hits += 1;
                if let Some(modulemap) = modulemap_file {
                    if !cwd.join(&modulemap).exists() {
                        warn!(
                            "{WARN_TAG} {target_name}: cached modulemap {modulemap} is missing from the working tree"
                        );
                    }
                }
            }
            TargetState::Miss { .. } => {
                warn!("{WARN_TAG} {target_name}: build never captured its environment; not caching");
                skipped += 1;
            }
            TargetState::MissReady {
                target_digest,
                fingerprint_text,
                source_files,
                build_env,
            } => {
                let outcome = archive_target(ArchiveInputs {
                    project,
                    target_id: &target_id,
                    target_name: &target_name,
                    configuration: &configuration,
                    build_args,
                    cwd,
                    config,
                    checksums: &checksums,
                    store: &store,
                    recorded_digest: &target_digest,
                    fingerprint_text: &fingerprint_text,
                    source_files,
                    build_env: &build_env,
                })?;
                match outcome {
                    TargetOutcome::Archived => archived += 1,
                    TargetOutcome::Skipped(reason) => {
                        warn!("{WARN_TAG} not caching {target_name}: {reason}");
                        skipped += 1;
                    }
                }
            }
        }
    }

    for project in &ws.projects {
        let dir = project.xcodeproj_dir();
        backup::restore(dir).map_err(|source| StageError::io(dir, source))?;
        workspace::remove_sidecars(dir)?;
    }
    let evicted = store.evict()?;

    info!(
        "post: {archived} archived, {hits} hits verified, {skipped} skipped, {evicted} evicted in {:.2?}",
        started.elapsed()
    );
    Ok(PostReport {
        archived,
        hits,
        skipped,
        evicted,
    })
}

struct ArchiveInputs<'a> {
    project: &'a Project,
    target_id: &'a str,
    target_name: &'a str,
    configuration: &'a str,
    build_args: &'a [String],
    cwd: &'a Path,
    config: &'a Config,
    checksums: &'a SpecChecksums,
    store: &'a CacheStore,
    recorded_digest: &'a str,
    fingerprint_text: &'a str,
    source_files: Vec<PathBuf>,
    build_env: &'a BTreeMap<String, String>,
}

/// Validate one finished target and archive its product. Validation
/// problems skip the target; filesystem failures abort the stage.
fn archive_target(inputs: ArchiveInputs<'_>) -> Result<TargetOutcome, StageError> {
    for key in REQUIRED_BUILD_ENV_KEYS {
        if inputs.build_env.get(key).is_none_or(|v| v.is_empty()) {
            return Ok(TargetOutcome::Skipped(format!(
                "build did not export {key}"
            )));
        }
    }
    let symroot = Path::new(&inputs.build_env["SYMROOT"]);
    let objroot = Path::new(&inputs.build_env["OBJROOT"]);
    let srcroot = PathBuf::from(&inputs.build_env["SRCROOT"]);
    let configuration_build_dir = Path::new(&inputs.build_env["CONFIGURATION_BUILD_DIR"]);
    let target_temp_dir = Path::new(&inputs.build_env["TARGET_TEMP_DIR"]);

    // The workspace must still fingerprint exactly as it did in pre;
    // anything else means the environment drifted under the build.
    let mut hasher = FileHasher::new();
    hasher.set_src_root(Some(srcroot.clone()));
    let fingerprint_inputs = FingerprintInputs {
        project: inputs.project,
        target_id: inputs.target_id,
        configuration: inputs.configuration,
        build_args: inputs.build_args,
        workspace_root: inputs.cwd,
        detect_modulemap_dependency: inputs.config.detect_modulemap_dependency,
    };
    let recomputed = match build_fingerprint_with_sources(
        &fingerprint_inputs,
        inputs.source_files,
        &mut hasher,
        inputs.checksums,
    ) {
        Ok(fingerprint) => fingerprint,
        Err(err) => {
            return Ok(TargetOutcome::Skipped(format!(
                "cannot recompute fingerprint: {err}"
            )))
        }
    };
    if recomputed.digest != inputs.recorded_digest {
        return Ok(TargetOutcome::Skipped(
            "fingerprint changed between pre and post".to_string(),
        ));
    }

    let modulemap_file = match inputs
        .build_env
        .get("MODULEMAP_FILE")
        .filter(|v| !v.is_empty())
    {
        Some(raw) => {
            let raw = Path::new(raw);
            let rooted = if raw.is_absolute() {
                raw.to_path_buf()
            } else {
                srcroot.join(raw)
            };
            if !rooted.exists() {
                return Ok(TargetOutcome::Skipped(format!(
                    "modulemap {} does not exist",
                    rooted.display()
                )));
            }
            Some(strip_pwd(&rooted.to_string_lossy(), inputs.cwd))
        }
        None => None,
    };

    let Ok(build_product_dir) = configuration_build_dir.strip_prefix(symroot) else {
        return Ok(TargetOutcome::Skipped(format!(
            "{} is not under SYMROOT",
            configuration_build_dir.display()
        )));
    };
    let Ok(build_intermediate_dir) = target_temp_dir.strip_prefix(objroot) else {
        return Ok(TargetOutcome::Skipped(format!(
            "{} is not under OBJROOT",
            target_temp_dir.display()
        )));
    };
    if !configuration_build_dir.is_dir() {
        return Ok(TargetOutcome::Skipped(format!(
            "no build products at {}",
            configuration_build_dir.display()
        )));
    }

    rewrite_modulemaps(configuration_build_dir)?;

    let exclude_wrapped_products =
        inputs.project.target_product_type(inputs.target_id) == Some(STATIC_LIBRARY_PRODUCT_TYPE);
    let archive_path = configuration_build_dir
        .parent()
        .unwrap_or(configuration_build_dir)
        .join(format!("{}.xcodecache.tar", inputs.target_name));
    create_product_archive(configuration_build_dir, &archive_path, exclude_wrapped_products)?;

    let stored = TargetContext {
        target_name: inputs.target_name.to_string(),
        status: Some(TargetStatus::MissReady),
        target_digest: inputs.recorded_digest.to_string(),
        fingerprint_text: None,
        source_files: Vec::new(),
        build_env: inputs.build_env.clone(),
        product_digest: None,
        build_product_dir: Some(build_product_dir.to_string_lossy().into_owned()),
        build_intermediate_dir: Some(build_intermediate_dir.to_string_lossy().into_owned()),
        modulemap_file,
        dependency_targets: BTreeMap::new(),
        hit_cache_dir: None,
    };
    inputs.store.insert(&stored, &archive_path, inputs.fingerprint_text)?;
    Ok(TargetOutcome::Archived)
}
