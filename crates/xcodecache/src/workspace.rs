//! The pods workspace: root project, transitive sub-projects, sidecar sweep.

use crate::error::StageError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use xcodecache_pbx::{backup, is_cacheable_target, Project};
use xcodecache_types::{SIDECAR_SUFFIX, WARN_TAG};

pub const PODS_DIR: &str = "Pods";
pub const ROOT_PROJECT: &str = "Pods/Pods.xcodeproj";

/// Every project participating in a build: the root pods project plus each
/// referenced `wrapper.pb-project`, transitively, deduplicated by path.
pub struct BuildWorkspace {
    pub projects: Vec<Project>,
}

impl BuildWorkspace {
    /// Open the workspace. Any project left mutated by a killed pipeline is
    /// restored from its backup before it is read, so every stage sees the
    /// pristine graph; restoring twice is a no-op.
    pub fn open(root: &Path) -> Result<Self, StageError> {
        let root_dir = root.join(ROOT_PROJECT);
        backup::restore(&root_dir).map_err(|source| StageError::io(&root_dir, source))?;
        if !root_dir.join("project.pbxproj").is_file() {
            return Err(StageError::NoPodsProject(root_dir));
        }
        let root_project = Project::open(&root_dir)?;

        let mut seen = BTreeSet::new();
        seen.insert(canonical(&root_dir));
        let mut queue = root_project.subproject_paths()?;
        let mut projects = vec![root_project];

        while let Some(dir) = queue.pop() {
            if !seen.insert(canonical(&dir)) {
                continue;
            }
            backup::restore(&dir).map_err(|source| StageError::io(&dir, source))?;
            if !dir.join("project.pbxproj").is_file() {
                warn!("{WARN_TAG} referenced sub-project {} is missing", dir.display());
                continue;
            }
            let project = Project::open(&dir)?;
            queue.extend(project.subproject_paths()?);
            projects.push(project);
        }

        debug!("opened {} projects under {}", projects.len(), root.display());
        Ok(Self { projects })
    }

    /// `(project index, target id)` for every target eligible for caching.
    pub fn cacheable_targets(&self) -> Result<Vec<(usize, String)>, StageError> {
        let mut out = Vec::new();
        for (idx, project) in self.projects.iter().enumerate() {
            for target_id in project.native_target_ids()? {
                let name = project.target_name(&target_id).unwrap_or_default();
                let product_type = project.target_product_type(&target_id).unwrap_or_default();
                if is_cacheable_target(name, product_type) {
                    out.push((idx, target_id));
                }
            }
        }
        Ok(out)
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The required `-configuration <name>` build argument.
pub fn parse_configuration(args: &[String]) -> Result<String, StageError> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-configuration" || arg == "--configuration" {
            return match iter.next() {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => Err(StageError::MissingConfiguration),
            };
        }
    }
    Err(StageError::MissingConfiguration)
}

/// Roll back whatever a previous pipeline left behind under
/// `Pods/*.xcodeproj`: rename backups over their project files and delete
/// target-context sidecars. Returns `(restored, removed sidecars)`.
pub fn sweep_stale_state(root: &Path) -> Result<(usize, usize), StageError> {
    let pods = root.join(PODS_DIR);
    let mut restored = 0;
    let mut sidecars = 0;
    let entries = match fs::read_dir(&pods) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(source) => return Err(StageError::io(pods, source)),
    };
    for entry in entries.filter_map(Result::ok) {
        let dir = entry.path();
        if !dir.is_dir() || dir.extension().is_none_or(|ext| ext != "xcodeproj") {
            continue;
        }
        if backup::restore(&dir).map_err(|source| StageError::io(&dir, source))? {
            restored += 1;
        }
        sidecars += remove_sidecars(&dir)?;
    }
    Ok((restored, sidecars))
}

/// Delete every sidecar file inside one project directory.
pub fn remove_sidecars(xcodeproj_dir: &Path) -> Result<usize, StageError> {
    let mut removed = 0;
    let entries = fs::read_dir(xcodeproj_dir)
        .map_err(|source| StageError::io(xcodeproj_dir, source))?;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let is_sidecar = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX));
        if is_sidecar {
            fs::remove_file(&path).map_err(|source| StageError::io(&path, source))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn configuration_argument_forms() {
        assert_eq!(
            parse_configuration(&args(&["-configuration", "Debug"])).unwrap(),
            "Debug"
        );
        assert_eq!(
            parse_configuration(&args(&["-sdk", "iphoneos", "--configuration", "Release"]))
                .unwrap(),
            "Release"
        );
        assert!(parse_configuration(&args(&["-configuration", ""])).is_err());
        assert!(parse_configuration(&args(&["-configuration"])).is_err());
        assert!(parse_configuration(&args(&["build"])).is_err());
    }
}
