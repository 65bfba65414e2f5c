//! The `manifest.json` index of committed units.
//!
//! The results tree is the source of truth for what is cached; the manifest
//! only remembers which fingerprint each unit last committed, so that
//! `status` can list units and `gc` knows which results are still referenced.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

/// Name of the manifest file within the cache directory.
const MANIFEST_FILE: &str = "manifest.json";

/// Index of the last committed result per unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Kiln version that produced this index. Invalidate on version change.
    pub kiln_version: String,

    /// Entries keyed by unit address.
    pub units: BTreeMap<String, UnitEntry>,
}

/// Last committed result of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEntry {
    /// Fingerprint of the committed result.
    pub fingerprint: Fingerprint,
    /// Task that produced it.
    pub task: String,
    /// Output files relative to the results directory.
    pub files: Vec<String>,
    /// Whether the result carries a placeholder artifact.
    #[serde(default)]
    pub synthetic_marker: bool,
}

impl CacheManifest {
    /// Creates an empty manifest for the given kiln version.
    pub fn new(kiln_version: &str) -> Self {
        Self {
            kiln_version: kiln_version.to_string(),
            units: BTreeMap::new(),
        }
    }

    /// Loads the manifest from the cache directory, returning `None` if
    /// the file doesn't exist or can't be parsed.
    pub fn load(cache_dir: &Path) -> Option<Self> {
        let path = cache_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Saves the manifest to the cache directory, creating it if needed.
    ///
    /// The file is written next to its final location and renamed into
    /// place.
    pub fn save(&self, cache_dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(cache_dir).map_err(|e| CacheError::io(cache_dir, e))?;
        let path = cache_dir.join(MANIFEST_FILE);
        let tmp = cache_dir.join(format!("{MANIFEST_FILE}.tmp"));
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        std::fs::write(&tmp, json).map_err(|e| CacheError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CacheError::io(path, e))
    }

    /// Returns `true` if this manifest was produced by a compatible version.
    pub fn is_compatible(&self, current_version: &str) -> bool {
        self.kiln_version == current_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::ContentHash;

    fn entry(seed: &str) -> UnitEntry {
        UnitEntry {
            fingerprint: Fingerprint::from_hash(ContentHash::from_bytes(seed.as_bytes())),
            task: "cythonize".to_string(),
            files: vec!["pkg/fast.c".to_string()],
            synthetic_marker: false,
        }
    }

    #[test]
    fn new_manifest_is_empty() {
        let m = CacheManifest::new("0.1.0");
        assert_eq!(m.kiln_version, "0.1.0");
        assert!(m.units.is_empty());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = CacheManifest::new("0.1.0");
        m.units.insert("src/pkg:fast".to_string(), entry("a"));
        m.save(dir.path()).unwrap();

        let loaded = CacheManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.units["src/pkg:fast"], entry("a"));
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn fingerprints_are_stored_as_hex() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = CacheManifest::new("0.1.0");
        let e = entry("a");
        let hex = e.fingerprint.to_string();
        m.units.insert("u".to_string(), e);
        m.save(dir.path()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(raw.contains(&hex));
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CacheManifest::load(dir.path()).is_none());
    }

    #[test]
    fn load_corrupt_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        assert!(CacheManifest::load(dir.path()).is_none());
    }

    #[test]
    fn compatibility_check() {
        let m = CacheManifest::new("0.1.0");
        assert!(m.is_compatible("0.1.0"));
        assert!(!m.is_compatible("0.2.0"));
    }
}
