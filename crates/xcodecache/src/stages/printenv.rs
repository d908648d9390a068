//! The `printenv` stage, run by the build tool inside each miss target:
//! fold the observed build settings into the target's sidecar.

use crate::error::StageError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use xcodecache_types::{sidecar_path, TargetContext, TargetStatus, BUILD_ENV_KEYS};

pub fn run(
    target_name: &str,
    project_path: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<(), StageError> {
    let sidecar = sidecar_path(project_path, target_name);
    let mut context = TargetContext::load(&sidecar)?;
    for key in BUILD_ENV_KEYS {
        if let Some(value) = vars.get(key) {
            context.build_env.insert(key.to_string(), value.clone());
        }
    }
    context.status = Some(TargetStatus::MissReady);
    context.save(&sidecar)?;
    debug!("captured build environment for {target_name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn merges_observed_variables() {
        let tmp = TempDir::new().unwrap();
        let ctx = TargetContext::miss("AF", "aa11", "pre-image", Vec::new());
        ctx.save(&sidecar_path(tmp.path(), "AF")).unwrap();

        let mut vars = BTreeMap::new();
        vars.insert("SYMROOT".to_string(), "/dd/Products".to_string());
        vars.insert("FULL_PRODUCT_NAME".to_string(), "AF.framework".to_string());
        vars.insert("UNRELATED".to_string(), "ignored".to_string());

        run("AF", tmp.path(), &vars).unwrap();

        let loaded = TargetContext::load(&sidecar_path(tmp.path(), "AF")).unwrap();
        assert_eq!(loaded.status, Some(TargetStatus::MissReady));
        assert_eq!(loaded.build_env["SYMROOT"], "/dd/Products");
        assert_eq!(loaded.build_env["FULL_PRODUCT_NAME"], "AF.framework");
        assert!(!loaded.build_env.contains_key("UNRELATED"));
        // The pre-image captured by pre survives for post.
        assert!(loaded.fingerprint_text.is_some());
    }

    #[test]
    fn missing_sidecar_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(run("AF", tmp.path(), &BTreeMap::new()).is_err());
    }
}
