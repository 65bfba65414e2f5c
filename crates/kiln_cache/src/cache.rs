//! High-level cache orchestrator.
//!
//! `BuildCache` ties together the isolated workspace, the per-directory
//! artifact records and the manifest index. Lookups are fail-safe: a results
//! directory with a missing or damaged record, or with missing files, is a
//! cache miss.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::ArtifactRecord;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::manifest::{CacheManifest, UnitEntry};
use crate::workspace::{IsolatedWorkspace, ScratchDir};

/// A valid cached result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The fingerprint the result belongs to.
    pub fingerprint: Fingerprint,
    /// Where the files are.
    pub results_dir: PathBuf,
    /// What the files are.
    pub record: ArtifactRecord,
}

/// What [`BuildCache::gc`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Results directories no unit references any more.
    pub results_removed: usize,
    /// Orphaned scratch and trash directories.
    pub scratch_removed: usize,
}

/// Cache of build results for one project.
#[derive(Debug)]
pub struct BuildCache {
    /// Root directory for all cache files.
    cache_dir: PathBuf,

    /// Index of the last committed result per unit.
    manifest: CacheManifest,

    /// Scratch allocation and commit.
    workspace: IsolatedWorkspace,

    /// Version string written into records and the manifest.
    kiln_version: String,
}

impl BuildCache {
    /// Loads an existing cache or creates a fresh one.
    ///
    /// A manifest from a different version is discarded. Results directories
    /// stay where they are; their records decide whether they are usable.
    pub fn load_or_create(cache_dir: &Path, kiln_version: &str) -> Self {
        let manifest = CacheManifest::load(cache_dir)
            .filter(|m| m.is_compatible(kiln_version))
            .unwrap_or_else(|| CacheManifest::new(kiln_version));

        Self {
            cache_dir: cache_dir.to_path_buf(),
            manifest,
            workspace: IsolatedWorkspace::new(cache_dir),
            kiln_version: kiln_version.to_string(),
        }
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.cache_dir
    }

    /// The version this cache writes.
    pub fn kiln_version(&self) -> &str {
        &self.kiln_version
    }

    /// Scratch allocation for builders.
    pub fn workspace(&self) -> &IsolatedWorkspace {
        &self.workspace
    }

    /// Returns the committed result for `fingerprint`, if it is intact.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let results_dir = self.workspace.results_dir(fingerprint);
        if !results_dir.is_dir() {
            return None;
        }
        let record = ArtifactRecord::load(&results_dir)?;
        if record.fingerprint != *fingerprint || !record.files_present(&results_dir) {
            tracing::debug!(%fingerprint, "results directory does not match its record");
            return None;
        }
        Some(CacheEntry {
            fingerprint: *fingerprint,
            results_dir,
            record,
        })
    }

    /// Returns `true` if an intact result for `fingerprint` is committed.
    pub fn is_valid(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).is_some()
    }

    /// Records the scratch directory's contents, writes the artifact record
    /// and commits the directory.
    pub fn store(
        &self,
        scratch: ScratchDir<'_>,
        unit: &str,
        synthetic_marker: bool,
        metadata: BTreeMap<String, String>,
    ) -> Result<CacheEntry, CacheError> {
        let fingerprint = scratch.fingerprint();
        let mut record = ArtifactRecord::scan(unit, fingerprint, scratch.path())?;
        record.synthetic_marker = synthetic_marker;
        record.metadata = metadata;
        record.write(scratch.path(), &self.kiln_version)?;
        let results_dir = scratch.commit()?;
        Ok(CacheEntry {
            fingerprint,
            results_dir,
            record,
        })
    }

    /// Marks `unit` as valid at the results in `results_dir` in the index.
    pub fn record_valid(
        &mut self,
        unit: &str,
        task: &str,
        results_dir: &Path,
    ) -> Result<(), CacheError> {
        let record = ArtifactRecord::read(results_dir)?;
        if record.unit != unit {
            return Err(CacheError::InvalidHeader {
                path: results_dir.to_path_buf(),
                reason: format!("record belongs to {}, not {unit}", record.unit),
            });
        }
        self.manifest.units.insert(
            unit.to_string(),
            UnitEntry {
                fingerprint: record.fingerprint,
                task: task.to_string(),
                files: record.files.iter().map(|f| f.path.clone()).collect(),
                synthetic_marker: record.synthetic_marker,
            },
        );
        Ok(())
    }

    /// Drops `unit` from the index.
    pub fn forget(&mut self, unit: &str) -> Option<UnitEntry> {
        self.manifest.units.remove(unit)
    }

    /// Returns a reference to the current index.
    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    /// Persists the index to disk.
    pub fn save(&self) -> Result<(), CacheError> {
        self.manifest.save(&self.cache_dir)
    }

    /// Removes results directories that no indexed unit references, and
    /// orphaned scratch directories.
    pub fn gc(&self) -> Result<GcReport, CacheError> {
        let live: Vec<Fingerprint> = self
            .manifest
            .units
            .values()
            .map(|e| e.fingerprint)
            .collect();
        let mut report = GcReport::default();
        for fingerprint in self.workspace.committed()? {
            if !live.contains(&fingerprint) && self.workspace.remove_results(&fingerprint)? {
                report.results_removed += 1;
            }
        }
        report.scratch_removed = self.workspace.clear_scratch()?;
        tracing::info!(
            results = report.results_removed,
            scratch = report.scratch_removed,
            "garbage collected cache"
        );
        Ok(report)
    }
}
