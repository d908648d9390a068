//! Xcode project model for xcodecache.
//!
//! Reads `project.pbxproj` documents, resolves file references through the
//! group tree, and applies the two mutations the cache protocol needs:
//! stripping compile phases from hit targets and injecting shell-script
//! phases. Restoration is handled by the [`backup`] protocol, never by
//! re-serializing.

pub mod backup;
pub mod fixtures;
pub mod plist;
pub mod project;

pub use backup::{backup_path, clean_backup, restore, BACKUP_FILE_NAME};
pub use plist::{Dict, PlistError, Value};
pub use project::{
    is_cacheable_target, setting_to_string, Project, ProjectError, CACHEABLE_PRODUCT_TYPES,
    DISABLED_PHASES, HEADERS_PHASE, RESOURCES_PHASE, SHELL_SCRIPT_PHASE, SOURCES_PHASE,
    STATIC_LIBRARY_PRODUCT_TYPE, SUBPROJECT_FILE_TYPE,
};
