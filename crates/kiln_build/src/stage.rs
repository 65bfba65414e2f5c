//! Filesystem helpers shared by the builders.

use std::path::{Path, PathBuf};

use kiln_cache::RECORD_FILE;

use crate::error::BuildError;

/// Marker file of a Python package directory.
pub const PACKAGE_INIT: &str = "__init__.py";

/// Creates the directories leading to `rel` under `workdir`, copying each
/// `__init__.py` found along the way under `source_root`.
///
/// Returns where `rel` belongs in `workdir`. The file itself is not copied.
pub fn copy_package_structure(
    workdir: &Path,
    source_root: &Path,
    rel: &Path,
) -> Result<PathBuf, BuildError> {
    let mut prefix = PathBuf::new();
    if let Some(parent) = rel.parent() {
        for component in parent.components() {
            prefix.push(component);
            let dest = workdir.join(&prefix);
            std::fs::create_dir_all(&dest).map_err(|e| BuildError::io(&dest, e))?;
            let init = source_root.join(&prefix).join(PACKAGE_INIT);
            let dest_init = dest.join(PACKAGE_INIT);
            if init.is_file() && !dest_init.exists() {
                std::fs::copy(&init, &dest_init).map_err(|e| BuildError::io(&init, e))?;
            }
        }
    }
    Ok(workdir.join(rel))
}

/// Copies `from` to `to`, creating parent directories.
pub fn copy_file(from: &Path, to: &Path) -> Result<(), BuildError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    std::fs::copy(from, to).map_err(|e| BuildError::io(from, e))?;
    Ok(())
}

/// Lists files under `dir` relative to it, sorted.
///
/// With `extensions`, only files whose extension (without the dot) is listed
/// are returned. Artifact records are never listed.
pub fn find_files(dir: &Path, extensions: Option<&[&str]>) -> Result<Vec<PathBuf>, BuildError> {
    let mut out = Vec::new();
    if dir.is_dir() {
        walk(dir, dir, extensions, &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn walk(
    root: &Path,
    dir: &Path,
    extensions: Option<&[&str]>,
    out: &mut Vec<PathBuf>,
) -> Result<(), BuildError> {
    let entries = std::fs::read_dir(dir).map_err(|e| BuildError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, extensions, out)?;
            continue;
        }
        if path.file_name().is_some_and(|n| n == RECORD_FILE) {
            continue;
        }
        if let Some(exts) = extensions {
            if !crate::unit::has_extension(&path, exts) {
                continue;
            }
        }
        if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Returns `true` if `dir` is a Python package.
pub fn is_package(dir: &Path) -> bool {
    dir.join(PACKAGE_INIT).is_file()
}

/// Removes `dir` and everything in it, if it exists.
pub fn remove_dir(dir: &Path) -> Result<(), BuildError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(dir, e)),
    }
}

/// Removes `dir` once the tool that used it has finished with `result`.
///
/// A tool failure is returned even when the removal fails too; the removal
/// error is only logged then.
pub fn remove_after<T>(dir: &Path, result: Result<T, BuildError>) -> Result<T, BuildError> {
    let cleanup = remove_dir(dir);
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            tracing::warn!(path = %dir.display(), error = %cleanup, "could not remove tool directory");
            Err(e)
        }
    }
}

/// `/`-separated form of a relative path, as written into generated scripts
/// and archives.
pub fn portable(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
