//! The `pre` stage: fingerprint every cacheable target, bind cache hits,
//! mutate the projects and leave sidecars for the build to fill in.

use crate::error::StageError;
use crate::inject;
use crate::workspace::{self, BuildWorkspace};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};
use xcodecache_fingerprint::{
    build_fingerprint_with_sources, target_source_files, FileHasher, Fingerprint,
    FingerprintInputs, SpecChecksums,
};
use xcodecache_pbx::backup;
use xcodecache_store::{CacheStore, Candidate};
use xcodecache_types::{sidecar_path, Config, TargetContext, TargetStatus, WARN_TAG};

#[derive(Debug)]
pub struct PreReport {
    pub hits: usize,
    pub misses: usize,
    pub skipped: usize,
}

pub(crate) struct PreTarget {
    pub project_idx: usize,
    pub target_id: String,
    pub target_name: String,
    pub fingerprint: Fingerprint,
    pub candidates: Vec<Candidate>,
    pub resolution: Resolution,
}

pub(crate) enum Resolution {
    Unresolved,
    Hit(Candidate),
    Miss,
}

pub fn run(config: &Config, cwd: &Path, build_args: &[String]) -> Result<PreReport, StageError> {
    let started = Instant::now();
    let configuration = workspace::parse_configuration(build_args)?;

    let store = CacheStore::new(config.cache_root.clone(), config.cache_count);
    if config.clear_all {
        info!("clearing cache root {}", store.root().display());
        store.clear_all()?;
    }

    let (restored, stale) = workspace::sweep_stale_state(cwd)?;
    if restored + stale > 0 {
        info!("recovered stale state: {restored} backups restored, {stale} sidecars removed");
    }

    let mut ws = BuildWorkspace::open(cwd)?;
    // Nested sub-projects are reachable only through the graph; drop their
    // stale sidecars too before writing fresh ones.
    for project in &ws.projects {
        workspace::remove_sidecars(project.xcodeproj_dir())?;
    }

    let mut hasher = FileHasher::new();
    let checksums = SpecChecksums::load(cwd);

    let mut targets: Vec<PreTarget> = Vec::new();
    let mut skipped = 0usize;
    for (project_idx, target_id) in ws.cacheable_targets()? {
        let project = &ws.projects[project_idx];
        let target_name = project
            .target_name(&target_id)
            .unwrap_or(&target_id)
            .to_string();

        let sources = target_source_files(project, &target_id);
        if sources.len() < config.min_source_file_count {
            debug!(
                "{target_name}: {} source files, below threshold of {}",
                sources.len(),
                config.min_source_file_count
            );
            continue;
        }

        let inputs = FingerprintInputs {
            project,
            target_id: &target_id,
            configuration: &configuration,
            build_args,
            workspace_root: cwd,
            detect_modulemap_dependency: config.detect_modulemap_dependency,
        };
        let fingerprint =
            match build_fingerprint_with_sources(&inputs, sources, &mut hasher, &checksums) {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    warn!("{WARN_TAG} cannot fingerprint {target_name}: {err}");
                    skipped += 1;
                    continue;
                }
            };

        let candidates = store.candidates(&target_name, &fingerprint.digest);
        targets.push(PreTarget {
            project_idx,
            target_id,
            target_name,
            fingerprint,
            candidates,
            resolution: Resolution::Unresolved,
        });
    }

    resolve_hits(&mut targets);

    let mut hits = 0usize;
    let mut misses = 0usize;
    for target in &targets {
        let project = &mut ws.projects[target.project_idx];
        let sidecar = sidecar_path(project.xcodeproj_dir(), &target.target_name);
        let context = match &target.resolution {
            Resolution::Hit(candidate) => {
                hits += 1;
                let product_dir = candidate
                    .context
                    .build_product_dir
                    .clone()
                    .unwrap_or_default();
                let intermediate_dir = candidate
                    .context
                    .build_intermediate_dir
                    .clone()
                    .unwrap_or_default();
                inject::disable_and_inject_extract(
                    project,
                    &target.target_id,
                    &candidate.dir,
                    &product_dir,
                    &intermediate_dir,
                )?;
                TargetContext {
                    target_name: target.target_name.clone(),
                    status: Some(TargetStatus::Hit),
                    target_digest: target.fingerprint.digest.clone(),
                    fingerprint_text: None,
                    source_files: Vec::new(),
                    build_env: BTreeMap::new(),
                    product_digest: candidate.context.product_digest.clone(),
                    build_product_dir: Some(product_dir),
                    build_intermediate_dir: Some(intermediate_dir),
                    modulemap_file: candidate.context.modulemap_file.clone(),
                    dependency_targets: candidate.context.dependency_targets.clone(),
                    hit_cache_dir: Some(candidate.dir.clone()),
                }
            }
            _ => {
                misses += 1;
                inject::inject_printenv(project, &target.target_id)?;
                TargetContext::miss(
                    target.target_name.clone(),
                    target.fingerprint.digest.clone(),
                    target.fingerprint.text.clone(),
                    target.fingerprint.source_files.clone(),
                )
            }
        };
        context.save(&sidecar)?;
    }

    for project in &mut ws.projects {
        let dir = project.xcodeproj_dir().to_path_buf();
        if project.is_dirty() {
            backup::backup(&dir).map_err(|source| StageError::io(&dir, source))?;
            project.save()?;
        } else {
            backup::clean_backup(&dir).map_err(|source| StageError::io(&dir, source))?;
        }
    }

    info!(
        "pre: {hits} hit, {misses} miss, {skipped} skipped in {:.2?}",
        started.elapsed()
    );
    Ok(PreReport {
        hits,
        misses,
        skipped,
    })
}

/// Fixed-point promotion of misses to hits.
///
/// An entry binds once every inter-target dependency it recorded matches the
/// current run's digest for that target *and* that target is itself bound.
/// Entries without dependencies bind on the first pass, so without
/// dependency tracking the loop stabilizes immediately; with it, HIT status
/// propagates topologically and members of a dependency cycle degrade to
/// misses.
pub(crate) fn resolve_hits(targets: &mut [PreTarget]) {
    let digests: BTreeMap<String, String> = targets
        .iter()
        .map(|t| (t.target_name.clone(), t.fingerprint.digest.clone()))
        .collect();

    let usable = |candidate: &Candidate| {
        candidate.context.build_product_dir.is_some()
            && candidate.context.build_intermediate_dir.is_some()
    };

    loop {
        let hit_names: BTreeSet<String> = targets
            .iter()
            .filter(|t| matches!(t.resolution, Resolution::Hit(_)))
            .map(|t| t.target_name.clone())
            .collect();

        let mut changed = false;
        for target in targets.iter_mut() {
            if !matches!(target.resolution, Resolution::Unresolved) {
                continue;
            }
            let bound = target
                .candidates
                .iter()
                .find(|candidate| {
                    usable(candidate)
                        && candidate.context.dependency_targets.iter().all(|(name, digest)| {
                            digests.get(name) == Some(digest) && hit_names.contains(name)
                        })
                })
                .cloned();
            if let Some(candidate) = bound {
                target.resolution = Resolution::Hit(candidate);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for target in targets.iter_mut() {
        if !matches!(target.resolution, Resolution::Unresolved) {
            continue;
        }
        // Stabilized but unresolved: if some candidate's dependencies all
        // match current digests, only a cycle of unresolved targets can be
        // holding it back.
        let cyclic = target.candidates.iter().any(|candidate| {
            usable(candidate)
                && !candidate.context.dependency_targets.is_empty()
                && candidate
                    .context
                    .dependency_targets
                    .iter()
                    .all(|(name, digest)| digests.get(name) == Some(digest))
        });
        if cyclic {
            warn!(
                "{WARN_TAG} dependency cycle involving {}; treating as miss",
                target.target_name
            );
        }
        target.resolution = Resolution::Miss;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target(name: &str, digest: &str, candidates: Vec<Candidate>) -> PreTarget {
        PreTarget {
            project_idx: 0,
            target_id: format!("ID_{name}"),
            target_name: name.to_string(),
            fingerprint: Fingerprint {
                digest: digest.to_string(),
                text: String::new(),
                source_files: Vec::new(),
            },
            candidates,
            resolution: Resolution::Unresolved,
        }
    }

    fn candidate(name: &str, digest: &str, deps: &[(&str, &str)]) -> Candidate {
        let mut context = TargetContext::miss(name, digest, "", Vec::new());
        context.build_product_dir = Some(format!("Debug/{name}"));
        context.build_intermediate_dir = Some(format!("{name}.build"));
        context.dependency_targets = deps
            .iter()
            .map(|(n, d)| (n.to_string(), d.to_string()))
            .collect();
        Candidate {
            dir: PathBuf::from(format!("/cache/{name}-{digest}-1")),
            context,
        }
    }

    fn is_hit(target: &PreTarget) -> bool {
        matches!(target.resolution, Resolution::Hit(_))
    }

    #[test]
    fn standalone_entries_bind_immediately() {
        let mut targets = vec![
            target("A", "a1", vec![candidate("A", "a1", &[])]),
            target("B", "b1", vec![]),
        ];
        resolve_hits(&mut targets);
        assert!(is_hit(&targets[0]));
        assert!(matches!(targets[1].resolution, Resolution::Miss));
    }

    #[test]
    fn hits_propagate_through_dependencies() {
        // A depends on B; B binds first, then A on the next pass.
        let mut targets = vec![
            target("A", "a1", vec![candidate("A", "a1", &[("B", "b1")])]),
            target("B", "b1", vec![candidate("B", "b1", &[])]),
        ];
        resolve_hits(&mut targets);
        assert!(is_hit(&targets[0]));
        assert!(is_hit(&targets[1]));
    }

    #[test]
    fn stale_dependency_digest_blocks_the_hit() {
        // A was built against B at b1, but B's inputs changed to b2.
        let mut targets = vec![
            target("A", "a1", vec![candidate("A", "a1", &[("B", "b1")])]),
            target("B", "b2", vec![]),
        ];
        resolve_hits(&mut targets);
        assert!(matches!(targets[0].resolution, Resolution::Miss));
    }

    #[test]
    fn dependency_cycles_degrade_to_misses() {
        let mut targets = vec![
            target("A", "a1", vec![candidate("A", "a1", &[("B", "b1")])]),
            target("B", "b1", vec![candidate("B", "b1", &[("A", "a1")])]),
        ];
        resolve_hits(&mut targets);
        assert!(matches!(targets[0].resolution, Resolution::Miss));
        assert!(matches!(targets[1].resolution, Resolution::Miss));
    }
}
