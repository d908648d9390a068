//! Shell-script phases injected into targets by `pre`.
//!
//! The injected command has to find this tool again from inside the build,
//! including when the workspace pins it through a bundler-managed toolchain;
//! in that case the script goes through the bundler shim so the pinned
//! version runs, not whatever is first on `PATH`.

use std::env;
use std::path::Path;
use xcodecache_pbx::{Project, ProjectError};

pub fn printenv_phase_name(target_name: &str) -> String {
    format!("xcodecache_printenv_{target_name}")
}

pub fn extract_phase_name(target_name: &str) -> String {
    format!("xcodecache_extract_{target_name}")
}

/// Append a `printenv` phase so the build captures the target's environment.
pub fn inject_printenv(project: &mut Project, target_id: &str) -> Result<(), ProjectError> {
    let target_name = project
        .target_name(target_id)
        .unwrap_or(target_id)
        .to_string();
    let project_dir = project.xcodeproj_dir().to_path_buf();
    let script = format!(
        "{} printenv \"{}\" \"{}\"\n",
        tool_invocation(),
        target_name,
        project_dir.display()
    );
    project.append_shell_script_phase(target_id, &printenv_phase_name(&target_name), &script)
}

/// Strip a hit target down to a single `extract` phase.
pub fn disable_and_inject_extract(
    project: &mut Project,
    target_id: &str,
    cache_dir: &Path,
    build_product_dir: &str,
    build_intermediate_dir: &str,
) -> Result<(), ProjectError> {
    let target_name = project
        .target_name(target_id)
        .unwrap_or(target_id)
        .to_string();
    let script = format!(
        "{} extract \"{}\" \"{build_product_dir}\" \"{build_intermediate_dir}\"\n",
        tool_invocation(),
        cache_dir.display()
    );
    project.remove_build_phases(target_id)?;
    project.append_shell_script_phase(target_id, &extract_phase_name(&target_name), &script)
}

/// How the injected script invokes this tool.
fn tool_invocation() -> String {
    let bundler_bin = non_empty_env("BUNDLE_BIN_PATH");
    let gemfile = non_empty_env("BUNDLE_GEMFILE");
    if let (Some(_), Some(gemfile)) = (bundler_bin, gemfile) {
        let bundler_root = Path::new(&gemfile)
            .parent()
            .unwrap_or_else(|| Path::new("."));
        return format!(
            "source ~/.bash_profile\ncd \"{}\"\nbundle exec xcodecache",
            bundler_root.display()
        );
    }
    match env::current_exe() {
        Ok(exe) => format!("\"{}\"", exe.display()),
        Err(_) => "xcodecache".to_string(),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xcodecache_pbx::fixtures::write_fixture_project;
    use xcodecache_pbx::{SHELL_SCRIPT_PHASE, SOURCES_PHASE};

    fn open_fixture(tmp: &TempDir) -> (Project, String) {
        let dir = write_fixture_project(tmp.path());
        let project = Project::open(&dir).unwrap();
        let target_id = project
            .native_target_ids()
            .unwrap()
            .into_iter()
            .find(|id| project.target_name(id) == Some("Alamofire"))
            .unwrap();
        (project, target_id)
    }

    #[test]
    fn printenv_phase_carries_target_and_project() {
        let tmp = TempDir::new().unwrap();
        let (mut project, target_id) = open_fixture(&tmp);
        inject_printenv(&mut project, &target_id).unwrap();

        let phase_id = project
            .target_build_phase(&target_id, SHELL_SCRIPT_PHASE)
            .unwrap();
        let phase = project.object(&phase_id).unwrap();
        assert_eq!(phase.get_str("name"), Some("xcodecache_printenv_Alamofire"));
        let script = phase.get_str("shellScript").unwrap();
        assert!(script.contains("printenv \"Alamofire\""));
        assert!(script.contains("Fixture.xcodeproj"));
        // Sources remain; only hits lose their compile phases.
        assert!(project.target_build_phase(&target_id, SOURCES_PHASE).is_some());
    }

    #[test]
    fn extract_phase_replaces_compilation() {
        let tmp = TempDir::new().unwrap();
        let (mut project, target_id) = open_fixture(&tmp);
        disable_and_inject_extract(
            &mut project,
            &target_id,
            Path::new("/cache/Alamofire-aa-1"),
            "Debug-iphoneos/Alamofire",
            "Alamofire.build",
        )
        .unwrap();

        assert!(project.target_build_phase(&target_id, SOURCES_PHASE).is_none());
        let phase_id = project
            .target_build_phase(&target_id, SHELL_SCRIPT_PHASE)
            .unwrap();
        let phase = project.object(&phase_id).unwrap();
        assert_eq!(phase.get_str("name"), Some("xcodecache_extract_Alamofire"));
        let script = phase.get_str("shellScript").unwrap();
        assert!(script.contains("extract \"/cache/Alamofire-aa-1\" \"Debug-iphoneos/Alamofire\" \"Alamofire.build\""));
    }
}
