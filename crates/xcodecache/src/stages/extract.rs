//! The `extract` stage, run by the build tool inside each hit target:
//! unpack the cached product where the compiler would have put it.

use crate::error::StageError;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xcodecache_store::{unpack_archive, CacheStore, PRODUCT_FILE};
use xcodecache_types::WARN_TAG;

pub fn run(
    cache_dir: &Path,
    build_product_dir: &str,
    build_intermediate_dir: &str,
    vars: &BTreeMap<String, String>,
) -> Result<(), StageError> {
    let required = |key: &'static str| {
        vars.get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or(StageError::MissingEnv(key))
    };
    required("SYMROOT")?;
    required("OBJROOT")?;
    required("TARGET_TEMP_DIR")?;
    required("SRCROOT")?;
    let configuration_build_dir = PathBuf::from(required("CONFIGURATION_BUILD_DIR")?);
    let full_product_name = required("FULL_PRODUCT_NAME")?;
    let target_build_dir = vars
        .get("TARGET_BUILD_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| configuration_build_dir.clone());

    // LRU refresh; a failed touch costs eviction order, not correctness.
    if let Err(err) = CacheStore::touch(cache_dir) {
        warn!("{WARN_TAG} could not refresh {}: {err}", cache_dir.display());
    }

    let dest_parent = configuration_build_dir.parent().ok_or_else(|| {
        StageError::io(
            &configuration_build_dir,
            io::Error::other("CONFIGURATION_BUILD_DIR has no parent"),
        )
    })?;
    debug!(
        "unpacking {build_product_dir} (intermediates {build_intermediate_dir}) into {}",
        dest_parent.display()
    );
    unpack_archive(&cache_dir.join(PRODUCT_FILE), dest_parent)?;

    if target_build_dir != configuration_build_dir {
        // The build expects the product under TARGET_BUILD_DIR; leave a
        // symlink where the archive put it so both paths resolve.
        let unpacked = configuration_build_dir.join(&full_product_name);
        let destination = target_build_dir.join(&full_product_name);
        remove_path(&destination)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| StageError::io(parent, source))?;
        }
        fs::rename(&unpacked, &destination)
            .map_err(|source| StageError::io(&destination, source))?;
        std::os::unix::fs::symlink(&destination, &unpacked)
            .map_err(|source| StageError::io(&unpacked, source))?;
    }

    info!("extracted {full_product_name} from cache");
    Ok(())
}

fn remove_path(path: &Path) -> Result<(), StageError> {
    let result = match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(StageError::io(path, source)),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    };
    result.map_err(|source| StageError::io(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xcodecache_store::create_product_archive;

    fn cache_entry_with_product(tmp: &Path) -> PathBuf {
        let staging = tmp.join("staging/Alamofire");
        fs::create_dir_all(staging.join("Alamofire.framework")).unwrap();
        fs::write(staging.join("Alamofire.framework/Alamofire"), "binary").unwrap();
        fs::write(staging.join("Alamofire.swiftmodule"), "module").unwrap();

        let entry = tmp.join("cache/Alamofire-aa11-1");
        fs::create_dir_all(&entry).unwrap();
        create_product_archive(&staging, &entry.join(PRODUCT_FILE), false).unwrap();
        entry
    }

    fn build_vars(build: &Path) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "SYMROOT".into(),
            build.join("Products").display().to_string(),
        );
        vars.insert(
            "CONFIGURATION_BUILD_DIR".into(),
            build.join("Products/Debug-iphoneos/Alamofire").display().to_string(),
        );
        vars.insert("OBJROOT".into(), build.join("Intermediates").display().to_string(),
        );
        vars.insert(
            "TARGET_TEMP_DIR".into(),
            build.join("Intermediates/Alamofire.build").display().to_string(),
        );
        vars.insert(
            "TARGET_BUILD_DIR".into(),
            build.join("Products/Debug-iphoneos/Alamofire").display().to_string(),
        );
        vars.insert("SRCROOT".into(), build.join("src").display().to_string());
        vars.insert("FULL_PRODUCT_NAME".into(), "Alamofire.framework".into());
        vars
    }

    #[test]
    fn unpacks_into_the_build_dir_parent() {
        let tmp = TempDir::new().unwrap();
        let entry = cache_entry_with_product(tmp.path());
        let build = tmp.path().join("dd");
        let vars = build_vars(&build);

        run(&entry, "Debug-iphoneos/Alamofire", "Alamofire.build", &vars).unwrap();

        let product = build.join("Products/Debug-iphoneos/Alamofire/Alamofire.framework");
        assert!(product.join("Alamofire").is_file());
    }

    #[test]
    fn relocates_and_symlinks_when_target_dir_differs() {
        let tmp = TempDir::new().unwrap();
        let entry = cache_entry_with_product(tmp.path());
        let build = tmp.path().join("dd");
        let mut vars = build_vars(&build);
        let target_dir = build.join("Products/Debug-iphoneos");
        vars.insert("TARGET_BUILD_DIR".into(), target_dir.display().to_string());
        // Something stale sits where the product must land.
        fs::create_dir_all(target_dir.join("Alamofire.framework")).unwrap();
        fs::write(target_dir.join("Alamofire.framework/stale"), "old").unwrap();

        run(&entry, "Debug-iphoneos/Alamofire", "Alamofire.build", &vars).unwrap();

        let relocated = target_dir.join("Alamofire.framework");
        assert!(relocated.join("Alamofire").is_file());
        assert!(!relocated.join("stale").exists());

        let link = build.join("Products/Debug-iphoneos/Alamofire/Alamofire.framework");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), relocated);
    }

    #[test]
    fn missing_required_env_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let entry = cache_entry_with_product(tmp.path());
        let mut vars = build_vars(&tmp.path().join("dd"));
        vars.remove("FULL_PRODUCT_NAME");
        let err = run(&entry, "p", "i", &vars).unwrap_err();
        assert!(matches!(err, StageError::MissingEnv("FULL_PRODUCT_NAME")));
    }
}
