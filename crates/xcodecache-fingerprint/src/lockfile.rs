//! `Podfile.lock` spec checksums.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const LOCKFILE_NAME: &str = "Podfile.lock";
const CHECKSUMS_KEY: &str = "SPEC CHECKSUMS";

/// The `SPEC CHECKSUMS` mapping from the workspace lockfile, parsed once
/// per run.
#[derive(Debug, Default, Clone)]
pub struct SpecChecksums {
    map: BTreeMap<String, String>,
}

impl SpecChecksums {
    /// Load `Podfile.lock` from the workspace root. A missing or malformed
    /// lockfile yields an empty map; the fingerprint then simply carries no
    /// checksum section.
    pub fn load(workspace_root: &Path) -> Self {
        let path = workspace_root.join(LOCKFILE_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                debug!("no lockfile at {}: {err}", path.display());
                return Self::default();
            }
        };
        match Self::parse(&text) {
            Ok(checksums) => checksums,
            Err(err) => {
                debug!("unparseable lockfile {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        let mut map = BTreeMap::new();
        if let Some(checksums) = doc.get(CHECKSUMS_KEY).and_then(|v| v.as_mapping()) {
            for (name, value) in checksums {
                let Some(name) = name.as_str() else { continue };
                // Checksums are hex strings, but all-digit ones parse as
                // numbers under YAML rules.
                let value = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => continue,
                };
                map.insert(name.to_string(), value);
            }
        }
        Ok(Self { map })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
