//! Per-fingerprint scratch directories with atomic promotion.
//!
//! Layout under the cache root:
//!
//! ```text
//! results/<fingerprint>/   committed results, one directory per fingerprint
//! scratch/<fingerprint>/   in-progress builds
//! trash/                   results being replaced, removed after the swap
//! ```
//!
//! At most one scratch directory exists per fingerprint at a time. A
//! [`ScratchDir`] that is dropped without being committed is deleted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

const RESULTS_DIR: &str = "results";
const SCRATCH_DIR: &str = "scratch";
const TRASH_DIR: &str = "trash";

static TRASH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hands out scratch directories and commits them into the results tree.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    root: PathBuf,
    in_flight: Mutex<HashSet<Fingerprint>>,
}

impl IsolatedWorkspace {
    /// Creates a workspace rooted at the cache root. Nothing is created on
    /// disk until the first [`acquire`](Self::acquire).
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The directory committed results for `fingerprint` live in.
    pub fn results_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(RESULTS_DIR).join(fingerprint.to_string())
    }

    /// Returns `true` if results for `fingerprint` have been committed.
    pub fn has_results(&self, fingerprint: &Fingerprint) -> bool {
        self.results_dir(fingerprint).is_dir()
    }

    /// Fingerprints with committed results, sorted. Directory entries that
    /// are not fingerprints are ignored.
    pub fn committed(&self) -> Result<Vec<Fingerprint>, CacheError> {
        let mut out: Vec<Fingerprint> = list_dir(&self.root.join(RESULTS_DIR))?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(Fingerprint::from_hex)
            })
            .collect();
        out.sort();
        Ok(out)
    }

    /// Allocates a fresh, empty scratch directory for `fingerprint`.
    ///
    /// Fails with [`CacheError::WorkspaceConflict`] if another scratch
    /// directory for the same fingerprint is still live. Leftovers from an
    /// earlier, interrupted process are wiped first.
    pub fn acquire(&self, fingerprint: Fingerprint) -> Result<ScratchDir<'_>, CacheError> {
        if !self.in_flight.lock().insert(fingerprint) {
            return Err(CacheError::WorkspaceConflict {
                fingerprint: fingerprint.to_string(),
            });
        }
        let scratch = ScratchDir {
            workspace: self,
            fingerprint,
            path: self.root.join(SCRATCH_DIR).join(fingerprint.to_string()),
            finished: false,
        };
        if scratch.path.exists() {
            tracing::debug!(path = %scratch.path.display(), "removing stale scratch directory");
            remove_dir_all(&scratch.path)?;
        }
        std::fs::create_dir_all(&scratch.path).map_err(|e| CacheError::io(&scratch.path, e))?;
        Ok(scratch)
    }

    /// Deletes committed results for `fingerprint`. Returns `false` if there
    /// were none.
    pub fn remove_results(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let dir = self.results_dir(fingerprint);
        if !dir.exists() {
            return Ok(false);
        }
        remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Deletes scratch and trash directories not owned by a live
    /// [`ScratchDir`]. Returns how many were removed.
    pub fn clear_scratch(&self) -> Result<usize, CacheError> {
        let live = self.in_flight.lock().clone();
        let mut removed = 0;
        for path in list_dir(&self.root.join(SCRATCH_DIR))? {
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Fingerprint::from_hex)
                .is_some_and(|fp| live.contains(&fp));
            if !owned {
                remove_path(&path)?;
                removed += 1;
            }
        }
        for path in list_dir(&self.root.join(TRASH_DIR))? {
            remove_path(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn release(&self, fingerprint: &Fingerprint) {
        self.in_flight.lock().remove(fingerprint);
    }
}

/// A private, exclusively owned build directory for one fingerprint.
#[derive(Debug)]
pub struct ScratchDir<'a> {
    workspace: &'a IsolatedWorkspace,
    fingerprint: Fingerprint,
    path: PathBuf,
    finished: bool,
}

impl ScratchDir<'_> {
    /// The directory builders write into.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The fingerprint this directory belongs to.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Atomically promotes the scratch directory to the results directory
    /// and returns its final path.
    ///
    /// Existing results for the same fingerprint are moved aside first and
    /// deleted after the swap, so a reader sees either the old directory or
    /// the new one, never a mix.
    pub fn commit(mut self) -> Result<PathBuf, CacheError> {
        let dest = self.workspace.results_dir(&self.fingerprint);
        let results_root = self.workspace.root.join(RESULTS_DIR);
        std::fs::create_dir_all(&results_root).map_err(|e| CacheError::io(&results_root, e))?;

        let mut displaced = None;
        if dest.exists() {
            let trash_root = self.workspace.root.join(TRASH_DIR);
            std::fs::create_dir_all(&trash_root).map_err(|e| CacheError::io(&trash_root, e))?;
            let trash = trash_root.join(format!(
                "{}.{}.{}",
                self.fingerprint,
                std::process::id(),
                TRASH_COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::rename(&dest, &trash).map_err(|e| CacheError::io(&dest, e))?;
            displaced = Some(trash);
        }

        if let Err(e) = std::fs::rename(&self.path, &dest) {
            if let Some(trash) = &displaced {
                if let Err(restore) = std::fs::rename(trash, &dest) {
                    tracing::warn!(
                        path = %trash.display(),
                        error = %restore,
                        "could not restore replaced results"
                    );
                }
            }
            return Err(CacheError::io(&dest, e));
        }
        self.finished = true;

        if let Some(trash) = displaced {
            if let Err(e) = std::fs::remove_dir_all(&trash) {
                tracing::warn!(path = %trash.display(), error = %e, "could not remove replaced results");
            }
        }
        tracing::debug!(fingerprint = %self.fingerprint, "committed results");
        Ok(dest)
    }

    /// Deletes the scratch directory. Dropping a `ScratchDir` does the same;
    /// this variant reports failures.
    pub fn discard(mut self) -> Result<(), CacheError> {
        self.finished = true;
        if self.path.exists() {
            remove_dir_all(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for ScratchDir<'_> {
    fn drop(&mut self) {
        if !self.finished && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "could not discard scratch directory");
            }
        }
        self.workspace.release(&self.fingerprint);
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        out.push(entry.path());
    }
    Ok(out)
}

fn remove_dir_all(path: &Path) -> Result<(), CacheError> {
    std::fs::remove_dir_all(path).map_err(|e| CacheError::io(path, e))
}

fn remove_path(path: &Path) -> Result<(), CacheError> {
    if path.is_dir() {
        remove_dir_all(path)
    } else {
        std::fs::remove_file(path).map_err(|e| CacheError::io(path, e))
    }
}
