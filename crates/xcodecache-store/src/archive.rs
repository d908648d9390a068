//! Product archives.
//!
//! Archives are plain POSIX tar, created following symlinks, rooted at the
//! basename of the product directory so unpacking in any parent directory
//! reproduces the layout.

use crate::StoreError;
use std::fs::{self, File};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Archive `product_dir` into the tar file at `dest`.
///
/// Static-library targets ask for `exclude_wrapped_products`: resource
/// bundles and frameworks found inside their build dir belong to other
/// targets and are skipped.
pub fn create_product_archive(
    product_dir: &Path,
    dest: &Path,
    exclude_wrapped_products: bool,
) -> Result<(), StoreError> {
    let base = product_dir
        .file_name()
        .ok_or_else(|| StoreError::InvalidProductDir(product_dir.to_path_buf()))?
        .to_owned();

    let file = File::create(dest).map_err(|source| StoreError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(true);

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    };

    let mut walker = WalkDir::new(product_dir).follow_links(true).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(StoreError::Walk)?;
        let rel = entry
            .path()
            .strip_prefix(product_dir)
            .expect("walk stays under product dir");
        if entry.file_type().is_dir() {
            if exclude_wrapped_products && is_wrapped_product(rel) {
                debug!("excluding {} from archive", rel.display());
                walker.skip_current_dir();
                continue;
            }
            if !rel.as_os_str().is_empty() {
                builder
                    .append_dir(Path::new(&base).join(rel), entry.path())
                    .map_err(io_err(entry.path()))?;
            }
        } else {
            builder
                .append_path_with_name(entry.path(), Path::new(&base).join(rel))
                .map_err(io_err(entry.path()))?;
        }
    }
    builder.finish().map_err(|source| StoreError::Io {
        path: dest.to_path_buf(),
        source,
    })
}

fn is_wrapped_product(rel: &Path) -> bool {
    rel.extension()
        .is_some_and(|ext| ext == "bundle" || ext == "framework")
}

/// Unpack a product archive into `dest_parent`.
pub fn unpack_archive(tar_path: &Path, dest_parent: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dest_parent).map_err(|source| StoreError::Io {
        path: dest_parent.to_path_buf(),
        source,
    })?;
    let file = File::open(tar_path).map_err(|source| StoreError::Io {
        path: tar_path.to_path_buf(),
        source,
    })?;
    tar::Archive::new(file)
        .unpack(dest_parent)
        .map_err(|source| StoreError::Io {
            path: tar_path.to_path_buf(),
            source,
        })
}

/// Rewrite every `*.modulemap` under `product_dir` so references to its own
/// on-disk location become relative. Run before archival; cached modulemaps
/// must not pin the directory they were built in.
pub fn rewrite_modulemaps(product_dir: &Path) -> Result<usize, StoreError> {
    let mut rewritten = 0;
    for entry in WalkDir::new(product_dir).follow_links(true) {
        let entry = entry.map_err(StoreError::Walk)?;
        if !entry.file_type().is_file()
            || entry.path().extension().is_none_or(|ext| ext != "modulemap")
        {
            continue;
        }
        let Some(parent) = entry.path().parent() else {
            continue;
        };
        let parent = parent.to_string_lossy();
        let text = fs::read_to_string(entry.path()).map_err(|source| StoreError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        if !text.contains(parent.as_ref()) {
            continue;
        }
        let replaced = text
            .replace(&format!("{parent}/"), "")
            .replace(parent.as_ref(), "");
        fs::write(entry.path(), replaced).map_err(|source| StoreError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        rewritten += 1;
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_product_tree(root: &Path) -> std::path::PathBuf {
        let product = root.join("Alamofire");
        fs::create_dir_all(product.join("Alamofire.framework/Modules")).unwrap();
        fs::write(
            product.join("Alamofire.framework/Alamofire"),
            b"\xfe\xed\xfa\xce binary",
        )
        .unwrap();
        fs::write(
            product.join("Alamofire.framework/Modules/module.modulemap"),
            "framework module Alamofire {}\n",
        )
        .unwrap();
        fs::create_dir_all(product.join("Extras.bundle")).unwrap();
        fs::write(product.join("Extras.bundle/strings.txt"), "hello").unwrap();
        fs::write(product.join("libAlamofire.a"), "archive").unwrap();
        product
    }

    #[test]
    fn archive_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let product = build_product_tree(tmp.path());
        let tar_path = tmp.path().join("product.tar");
        create_product_archive(&product, &tar_path, false).unwrap();

        let out = TempDir::new().unwrap();
        unpack_archive(&tar_path, out.path()).unwrap();
        assert!(out
            .path()
            .join("Alamofire/Alamofire.framework/Alamofire")
            .is_file());
        assert!(out.path().join("Alamofire/Extras.bundle/strings.txt").is_file());
    }

    #[test]
    fn static_library_archives_exclude_wrapped_products() {
        let tmp = TempDir::new().unwrap();
        let product = build_product_tree(tmp.path());
        let tar_path = tmp.path().join("product.tar");
        create_product_archive(&product, &tar_path, true).unwrap();

        let out = TempDir::new().unwrap();
        unpack_archive(&tar_path, out.path()).unwrap();
        assert!(out.path().join("Alamofire/libAlamofire.a").is_file());
        assert!(!out.path().join("Alamofire/Extras.bundle").exists());
        assert!(!out.path().join("Alamofire/Alamofire.framework").exists());
    }

    #[test]
    fn archives_follow_symlinks() {
        let tmp = TempDir::new().unwrap();
        let product = tmp.path().join("P");
        fs::create_dir_all(&product).unwrap();
        fs::write(tmp.path().join("real.txt"), "content").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), product.join("link.txt")).unwrap();

        let tar_path = tmp.path().join("product.tar");
        create_product_archive(&product, &tar_path, false).unwrap();

        let out = TempDir::new().unwrap();
        unpack_archive(&tar_path, out.path()).unwrap();
        let restored = out.path().join("P/link.txt");
        assert!(restored.is_file());
        assert!(fs::symlink_metadata(&restored).unwrap().is_file());
        assert_eq!(fs::read_to_string(&restored).unwrap(), "content");
    }

    #[test]
    fn modulemap_rewrite_drops_own_directory() {
        let tmp = TempDir::new().unwrap();
        let modules = tmp.path().join("AF.framework/Modules");
        fs::create_dir_all(&modules).unwrap();
        let map = modules.join("module.modulemap");
        fs::write(
            &map,
            format!(
                "framework module AF {{\n  header \"{}/AF.h\"\n}}\n",
                modules.display()
            ),
        )
        .unwrap();

        assert_eq!(rewrite_modulemaps(tmp.path()).unwrap(), 1);
        let text = fs::read_to_string(&map).unwrap();
        assert_eq!(text, "framework module AF {\n  header \"AF.h\"\n}\n");
    }
}
