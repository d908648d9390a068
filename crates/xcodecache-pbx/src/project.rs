//! Typed access to an Xcode project and the mutations the cache needs.

use crate::plist::{self, Dict, PlistError, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const SOURCES_PHASE: &str = "PBXSourcesBuildPhase";
pub const HEADERS_PHASE: &str = "PBXHeadersBuildPhase";
pub const RESOURCES_PHASE: &str = "PBXResourcesBuildPhase";
pub const SHELL_SCRIPT_PHASE: &str = "PBXShellScriptBuildPhase";

/// Phases removed from a target when its product comes from the cache.
pub const DISABLED_PHASES: [&str; 3] = [SOURCES_PHASE, HEADERS_PHASE, RESOURCES_PHASE];

/// Product types the cache is willing to archive.
pub const CACHEABLE_PRODUCT_TYPES: [&str; 3] = [
    "com.apple.product-type.bundle",
    "com.apple.product-type.library.static",
    "com.apple.product-type.framework",
];

pub const STATIC_LIBRARY_PRODUCT_TYPE: &str = "com.apple.product-type.library.static";
pub const SUBPROJECT_FILE_TYPE: &str = "wrapper.pb-project";

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Plist {
        path: PathBuf,
        #[source]
        source: PlistError,
    },
    #[error("{path}: {detail}")]
    Malformed { path: PathBuf, detail: String },
}

/// An open `project.pbxproj` document.
pub struct Project {
    xcodeproj_dir: PathBuf,
    pbxproj_path: PathBuf,
    document: Dict,
    /// Child object id to containing group id, for path resolution.
    parents: HashMap<String, String>,
    dirty: bool,
}

impl Project {
    /// Open `{dir}/project.pbxproj`, where `dir` is the `.xcodeproj` bundle.
    pub fn open(xcodeproj_dir: &Path) -> Result<Self, ProjectError> {
        let pbxproj_path = xcodeproj_dir.join("project.pbxproj");
        let text = fs::read_to_string(&pbxproj_path).map_err(|source| ProjectError::Io {
            path: pbxproj_path.clone(),
            source,
        })?;
        let document = match plist::parse(&text).map_err(|source| ProjectError::Plist {
            path: pbxproj_path.clone(),
            source,
        })? {
            Value::Dict(d) => d,
            _ => {
                return Err(ProjectError::Malformed {
                    path: pbxproj_path,
                    detail: "top-level value is not a dictionary".into(),
                })
            }
        };

        let mut project = Self {
            xcodeproj_dir: xcodeproj_dir.to_path_buf(),
            pbxproj_path,
            document,
            parents: HashMap::new(),
            dirty: false,
        };
        project.objects()?; // validate shape early
        project.index_groups();
        Ok(project)
    }

    fn malformed(&self, detail: impl Into<String>) -> ProjectError {
        ProjectError::Malformed {
            path: self.pbxproj_path.clone(),
            detail: detail.into(),
        }
    }

    fn objects(&self) -> Result<&Dict, ProjectError> {
        self.document
            .get_dict("objects")
            .ok_or_else(|| self.malformed("missing objects table"))
    }

    fn index_groups(&mut self) {
        let mut parents = HashMap::new();
        if let Some(objects) = self.document.get_dict("objects") {
            for (id, value) in objects.iter() {
                let Some(obj) = value.as_dict() else { continue };
                let isa = obj.get_str("isa").unwrap_or_default();
                if !matches!(isa, "PBXGroup" | "PBXVariantGroup" | "XCVersionGroup") {
                    continue;
                }
                for child in obj.get_array("children").unwrap_or_default() {
                    if let Some(child_id) = child.as_str() {
                        parents.insert(child_id.to_string(), id.to_string());
                    }
                }
            }
        }
        self.parents = parents;
    }

    /// The `.xcodeproj` bundle directory.
    pub fn xcodeproj_dir(&self) -> &Path {
        &self.xcodeproj_dir
    }

    pub fn pbxproj_path(&self) -> &Path {
        &self.pbxproj_path
    }

    /// Project name, from the bundle file stem.
    pub fn name(&self) -> &str {
        self.xcodeproj_dir
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("project")
    }

    /// Directory file references resolve against (`SOURCE_ROOT`).
    pub fn source_root(&self) -> PathBuf {
        self.xcodeproj_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn object(&self, id: &str) -> Option<&Dict> {
        self.document.get_dict("objects")?.get_dict(id)
    }

    fn root_project(&self) -> Result<&Dict, ProjectError> {
        let id = self
            .document
            .get_str("rootObject")
            .ok_or_else(|| self.malformed("missing rootObject"))?;
        self.object(id)
            .ok_or_else(|| self.malformed(format!("rootObject {id} not in objects table")))
    }

    /// Ids of every `PBXNativeTarget`, in project order.
    pub fn native_target_ids(&self) -> Result<Vec<String>, ProjectError> {
        let root = self.root_project()?;
        let mut ids = Vec::new();
        for value in root.get_array("targets").unwrap_or_default() {
            let Some(id) = value.as_str() else { continue };
            if let Some(obj) = self.object(id) {
                if obj.get_str("isa") == Some("PBXNativeTarget") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub fn target_name(&self, target_id: &str) -> Option<&str> {
        self.object(target_id)?.get_str("name")
    }

    pub fn target_product_type(&self, target_id: &str) -> Option<&str> {
        self.object(target_id)?.get_str("productType")
    }

    /// Build configuration of the given name from an `XCConfigurationList`.
    fn configuration_from_list(&self, list_id: &str, name: &str) -> Option<&Dict> {
        let list = self.object(list_id)?;
        for value in list.get_array("buildConfigurations").unwrap_or_default() {
            let config = self.object(value.as_str()?)?;
            if config.get_str("name") == Some(name) {
                return Some(config);
            }
        }
        None
    }

    /// Project-level build configuration by name.
    pub fn project_configuration(&self, name: &str) -> Result<Option<&Dict>, ProjectError> {
        let root = self.root_project()?;
        Ok(root
            .get_str("buildConfigurationList")
            .and_then(|list| self.configuration_from_list(list, name)))
    }

    /// Target-level build configuration by name.
    pub fn target_configuration(&self, target_id: &str, name: &str) -> Option<&Dict> {
        let list = self.object(target_id)?.get_str("buildConfigurationList")?;
        self.configuration_from_list(list, name)
    }

    /// Path of the xcconfig backing a build configuration, if any.
    pub fn base_configuration_path(&self, config: &Dict) -> Option<PathBuf> {
        let file_ref = config.get_str("baseConfigurationReference")?;
        self.resolve_file_path(file_ref)
    }

    /// Absolute paths of referenced sub-projects (`wrapper.pb-project`).
    pub fn subproject_paths(&self) -> Result<Vec<PathBuf>, ProjectError> {
        let objects = self.objects()?;
        let mut paths = Vec::new();
        for (id, value) in objects.iter() {
            let Some(obj) = value.as_dict() else { continue };
            if obj.get_str("isa") != Some("PBXFileReference") {
                continue;
            }
            let file_type = obj
                .get_str("lastKnownFileType")
                .or_else(|| obj.get_str("explicitFileType"));
            if file_type != Some(SUBPROJECT_FILE_TYPE) {
                continue;
            }
            match self.resolve_file_path(id) {
                Some(path) => paths.push(path),
                None => debug!("unresolvable sub-project reference {id}"),
            }
        }
        Ok(paths)
    }

    /// Resolve a file reference (or group) to a filesystem path by walking
    /// the group tree. Source trees other than `<group>`, `SOURCE_ROOT` and
    /// `<absolute>` (SDK- or build-relative) do not name checked-in files and
    /// resolve to `None`.
    pub fn resolve_file_path(&self, id: &str) -> Option<PathBuf> {
        let mut components: Vec<String> = Vec::new();
        let mut current = id.to_string();
        loop {
            let obj = self.object(&current)?;
            let tree = obj.get_str("sourceTree").unwrap_or("<group>");
            let path = obj.get_str("path");
            match tree {
                "<absolute>" => {
                    let mut resolved = PathBuf::from(path?);
                    resolved.extend(components.iter().rev());
                    return Some(resolved);
                }
                "SOURCE_ROOT" => {
                    let mut resolved = self.source_root();
                    if let Some(p) = path {
                        resolved.push(p);
                    }
                    resolved.extend(components.iter().rev());
                    return Some(resolved);
                }
                "<group>" => {
                    if let Some(p) = path {
                        components.push(p.to_string());
                    }
                    match self.parents.get(&current) {
                        Some(parent) => current = parent.clone(),
                        None => {
                            let mut resolved = self.source_root();
                            resolved.extend(components.iter().rev());
                            return Some(resolved);
                        }
                    }
                }
                _ => return None,
            }
        }
    }

    /// First build phase of the given `isa` on a target.
    pub fn target_build_phase(&self, target_id: &str, isa: &str) -> Option<String> {
        for value in self.object(target_id)?.get_array("buildPhases").unwrap_or_default() {
            let id = value.as_str()?;
            if self.object(id)?.get_str("isa") == Some(isa) {
                return Some(id.to_string());
            }
        }
        None
    }

    /// `PBXBuildFile` ids listed in a build phase.
    pub fn build_phase_file_ids(&self, phase_id: &str) -> Vec<String> {
        let Some(phase) = self.object(phase_id) else {
            return Vec::new();
        };
        phase
            .get_array("files")
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// The file reference a `PBXBuildFile` points at.
    pub fn build_file_ref(&self, build_file_id: &str) -> Option<&str> {
        self.object(build_file_id)?.get_str("fileRef")
    }

    /// Per-file build settings attached to a `PBXBuildFile`.
    pub fn build_file_settings(&self, build_file_id: &str) -> Option<&Dict> {
        self.object(build_file_id)?.get_dict("settings")
    }

    /// Flatten a file reference into its member files: variant groups and
    /// version groups expand to their children, plain references to
    /// themselves.
    pub fn flatten_file_ref(&self, file_ref_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![file_ref_id.to_string()];
        while let Some(id) = stack.pop() {
            let Some(obj) = self.object(&id) else { continue };
            match obj.get_str("isa") {
                Some("PBXVariantGroup") | Some("XCVersionGroup") => {
                    for child in obj.get_array("children").unwrap_or_default() {
                        if let Some(child_id) = child.as_str() {
                            stack.push(child_id.to_string());
                        }
                    }
                }
                _ => out.push(id),
            }
        }
        out
    }

    /// File name of a file reference (its `path` basename, or `name`).
    pub fn file_ref_basename(&self, file_ref_id: &str) -> Option<String> {
        let obj = self.object(file_ref_id)?;
        let raw = obj.get_str("path").or_else(|| obj.get_str("name"))?;
        Path::new(raw)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Look up a build setting for a target, checking the target
    /// configuration, then its xcconfig, then the project level. `$(VAR)`
    /// references are expanded against the same chain where possible;
    /// unresolvable references are left in place.
    pub fn resolve_build_setting(
        &self,
        target_id: &str,
        configuration: &str,
        key: &str,
    ) -> Option<String> {
        let raw = self.raw_build_setting(target_id, configuration, key)?;
        Some(self.expand_setting(target_id, configuration, &raw, 0))
    }

    fn raw_build_setting(
        &self,
        target_id: &str,
        configuration: &str,
        key: &str,
    ) -> Option<String> {
        if key == "TARGET_NAME" {
            return self.target_name(target_id).map(str::to_string);
        }
        for config in [
            self.target_configuration(target_id, configuration),
            self.project_configuration(configuration).ok().flatten(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(value) = config
                .get_dict("buildSettings")
                .and_then(|settings| settings.get(key))
            {
                return Some(setting_to_string(value));
            }
            if let Some(xcconfig) = self.base_configuration_path(config) {
                if let Some(value) = xcconfig_setting(&xcconfig, key) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn expand_setting(
        &self,
        target_id: &str,
        configuration: &str,
        value: &str,
        depth: usize,
    ) -> String {
        if depth > 8 || !value.contains('$') {
            return value.to_string();
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(idx) = rest.find('$') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            let close = match tail.as_bytes().get(1) {
                Some(b'(') => ')',
                Some(b'{') => '}',
                _ => {
                    out.push('$');
                    rest = &tail[1..];
                    continue;
                }
            };
            let Some(end) = tail.find(close) else {
                out.push_str(tail);
                return out;
            };
            let name = &tail[2..end];
            match self.raw_build_setting(target_id, configuration, name) {
                Some(resolved) => {
                    out.push_str(&self.expand_setting(target_id, configuration, &resolved, depth + 1))
                }
                None => out.push_str(&tail[..=end]),
            }
            rest = &tail[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Remove the sources, headers and resources build phases from a target.
    pub fn remove_build_phases(&mut self, target_id: &str) -> Result<(), ProjectError> {
        let mut removed = Vec::new();
        {
            let objects = self.objects()?;
            for value in self
                .object(target_id)
                .ok_or_else(|| self.malformed(format!("no target {target_id}")))?
                .get_array("buildPhases")
                .unwrap_or_default()
            {
                let Some(id) = value.as_str() else { continue };
                let isa = objects.get_dict(id).and_then(|o| o.get_str("isa"));
                if isa.is_some_and(|isa| DISABLED_PHASES.contains(&isa)) {
                    removed.push(id.to_string());
                }
            }
        }
        let objects = self
            .document
            .get_dict_mut("objects")
            .ok_or_else(|| ProjectError::Malformed {
                path: self.pbxproj_path.clone(),
                detail: "missing objects table".into(),
            })?;
        for id in &removed {
            objects.remove(id);
        }
        if let Some(phases) = objects
            .get_dict_mut(target_id)
            .and_then(|t| t.get_array_mut("buildPhases"))
        {
            phases.retain(|v| match v.as_str() {
                Some(id) => !removed.iter().any(|r| r == id),
                None => true,
            });
        }
        if !removed.is_empty() {
            self.dirty = true;
        }
        Ok(())
    }

    /// Append a shell-script build phase to a target, with environment
    /// variables shown in the build log.
    pub fn append_shell_script_phase(
        &mut self,
        target_id: &str,
        name: &str,
        script: &str,
    ) -> Result<(), ProjectError> {
        let phase_id = object_id(&format!("{target_id}:{name}"));

        let mut phase = Dict::new();
        phase.insert("isa", Value::String(SHELL_SCRIPT_PHASE.into()));
        phase.insert("buildActionMask", Value::String("2147483647".into()));
        phase.insert("files", Value::Array(Vec::new()));
        phase.insert("inputPaths", Value::Array(Vec::new()));
        phase.insert("name", Value::String(name.into()));
        phase.insert("outputPaths", Value::Array(Vec::new()));
        phase.insert(
            "runOnlyForDeploymentPostprocessing",
            Value::String("0".into()),
        );
        phase.insert("shellPath", Value::String("/bin/sh".into()));
        phase.insert("shellScript", Value::String(script.into()));
        phase.insert("showEnvVarsInLog", Value::String("1".into()));

        let objects = self
            .document
            .get_dict_mut("objects")
            .ok_or_else(|| ProjectError::Malformed {
                path: self.pbxproj_path.clone(),
                detail: "missing objects table".into(),
            })?;
        objects.insert(phase_id.clone(), Value::Dict(phase));
        let target = objects
            .get_dict_mut(target_id)
            .ok_or_else(|| ProjectError::Malformed {
                path: self.pbxproj_path.clone(),
                detail: format!("no target {target_id}"),
            })?;
        if target.get_array("buildPhases").is_none() {
            target.insert("buildPhases", Value::Array(Vec::new()));
        }
        if let Some(phases) = target.get_array_mut("buildPhases") {
            phases.push(Value::String(phase_id));
        }
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the document back to `project.pbxproj`.
    pub fn save(&mut self) -> Result<(), ProjectError> {
        let text = plist::to_document_string(&Value::Dict(self.document.clone()));
        fs::write(&self.pbxproj_path, text).map_err(|source| ProjectError::Io {
            path: self.pbxproj_path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}

/// Whether a native target's product is eligible for caching.
pub fn is_cacheable_target(name: &str, product_type: &str) -> bool {
    !name.starts_with("Pods-") && CACHEABLE_PRODUCT_TYPES.contains(&product_type)
}

/// A build-settings value as a single string (arrays are space-joined, the
/// way the build tool itself flattens them).
pub fn setting_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Dict(_) => String::new(),
    }
}

/// `KEY = VALUE` lookup in an xcconfig file. Only the plain assignment form
/// is understood; conditional settings (`KEY[sdk=*]`) are skipped.
fn xcconfig_setting(path: &Path, key: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        let line = line.split("//").next().unwrap_or_default();
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };
        if lhs.trim() == key {
            return Some(rhs.trim().to_string());
        }
    }
    None
}

/// Deterministic 24-hex object id, in the style Xcode uses.
fn object_id(seed: &str) -> String {
    let digest = blake3::hash(seed.as_bytes());
    let mut id = String::with_capacity(24);
    for byte in &digest.as_bytes()[..12] {
        id.push_str(&format!("{byte:02X}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::write_fixture_project;
    use tempfile::TempDir;

    #[test]
    fn enumerates_and_filters_targets() {
        let tmp = TempDir::new().unwrap();
        let dir = write_fixture_project(tmp.path());
        let project = Project::open(&dir).unwrap();

        let ids = project.native_target_ids().unwrap();
        let names: Vec<&str> = ids.iter().filter_map(|id| project.target_name(id)).collect();
        assert_eq!(names, ["Alamofire", "Pods-App"]);

        let cacheable: Vec<&str> = ids
            .iter()
            .filter(|id| {
                let name = project.target_name(id).unwrap();
                let product = project.target_product_type(id).unwrap();
                is_cacheable_target(name, product)
            })
            .filter_map(|id| project.target_name(id))
            .collect();
        assert_eq!(cacheable, ["Alamofire"]);
    }

    #[test]
    fn resolves_group_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let dir = write_fixture_project(tmp.path());
        let project = Project::open(&dir).unwrap();

        let phase = project
            .target_build_phase(&target_id(&project, "Alamofire"), SOURCES_PHASE)
            .unwrap();
        let files = project.build_phase_file_ids(&phase);
        assert_eq!(files.len(), 2);
        let file_ref = project.build_file_ref(&files[0]).unwrap().to_string();
        let path = project.resolve_file_path(&file_ref).unwrap();
        assert!(path.ends_with("Alamofire/Source/AF.swift"), "{path:?}");
        assert!(path.starts_with(project.source_root()));
    }

    #[test]
    fn finds_subprojects_and_settings() {
        let tmp = TempDir::new().unwrap();
        let dir = write_fixture_project(tmp.path());
        let project = Project::open(&dir).unwrap();

        let subs = project.subproject_paths().unwrap();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].ends_with("Local/Local.xcodeproj"), "{subs:?}");

        let id = target_id(&project, "Alamofire");
        assert_eq!(
            project.resolve_build_setting(&id, "Debug", "PRODUCT_NAME"),
            Some("Alamofire".to_string())
        );
        // $(TARGET_NAME) expansion happens through the settings chain.
        assert_eq!(
            project.resolve_build_setting(&id, "Debug", "MODULE_TAG"),
            Some("mod-Alamofire".to_string())
        );
    }

    #[test]
    fn mutation_replaces_phases() {
        let tmp = TempDir::new().unwrap();
        let dir = write_fixture_project(tmp.path());
        let mut project = Project::open(&dir).unwrap();
        let id = target_id(&project, "Alamofire");

        project.remove_build_phases(&id).unwrap();
        project
            .append_shell_script_phase(&id, "xcodecache_extract_Alamofire", "exit 0")
            .unwrap();
        assert!(project.is_dirty());
        project.save().unwrap();

        let reopened = Project::open(&dir).unwrap();
        let id = target_id(&reopened, "Alamofire");
        assert!(reopened.target_build_phase(&id, SOURCES_PHASE).is_none());
        assert!(reopened.target_build_phase(&id, RESOURCES_PHASE).is_none());
        let script_phase = reopened
            .target_build_phase(&id, SHELL_SCRIPT_PHASE)
            .unwrap();
        let phase = reopened.object(&script_phase).unwrap();
        assert_eq!(phase.get_str("name"), Some("xcodecache_extract_Alamofire"));
        assert_eq!(phase.get_str("showEnvVarsInLog"), Some("1"));
    }

    fn target_id(project: &Project, name: &str) -> String {
        project
            .native_target_ids()
            .unwrap()
            .into_iter()
            .find(|id| project.target_name(id) == Some(name))
            .unwrap()
    }
}
