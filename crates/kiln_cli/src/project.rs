//! Locating and opening the project and its cache.

use std::path::{Path, PathBuf};

use kiln_build::{Project, Task};
use kiln_cache::BuildCache;
use kiln_config::CONFIG_FILE;

use crate::{GlobalArgs, KILN_VERSION};

/// Walks up from `start` to find the directory containing `kiln.toml`.
pub fn find_project_root(start: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(CONFIG_FILE).exists() {
            return Ok(current);
        }
        if !current.pop() {
            return Err(format!(
                "could not find {CONFIG_FILE} in {} or any parent directory",
                start.display()
            )
            .into());
        }
    }
}

/// Resolves the project root from global CLI args.
///
/// `--config` may name the file or its directory. Otherwise the root is
/// found by walking up from the current directory.
pub fn resolve_project_root(global: &GlobalArgs) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match global.config {
        Some(ref config_path) => {
            let p = PathBuf::from(config_path);
            if p.is_file() {
                Ok(p.parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")))
            } else {
                Ok(p)
            }
        }
        None => find_project_root(&std::env::current_dir()?),
    }
}

/// Loads the project and opens its cache.
pub fn open(global: &GlobalArgs) -> Result<(Project, BuildCache), Box<dyn std::error::Error>> {
    let root = resolve_project_root(global)?;
    let project = Project::load(&root)?;
    let cache = BuildCache::load_or_create(&project.cache_root(), KILN_VERSION);
    tracing::debug!(root = %root.display(), cache = %cache.root().display(), "opened project");
    Ok((project, cache))
}

/// The tasks to run: the whole pipeline, or the pipeline up to `last`.
pub fn tasks_through(last: Option<&str>) -> Result<Vec<Task>, Box<dyn std::error::Error>> {
    let Some(name) = last else {
        return Ok(Task::ALL.to_vec());
    };
    let last = Task::parse(name).ok_or_else(|| {
        let known: Vec<&str> = Task::ALL.iter().map(|t| t.name()).collect();
        format!("unknown task '{name}' (expected one of: {})", known.join(", "))
    })?;
    Ok(Task::ALL.into_iter().take_while(|t| *t != last).chain([last]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn find_project_root_in_current_dir() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            "[project]\nname=\"t\"\nversion=\"0.1.0\"\n",
        )
        .unwrap();
        assert_eq!(find_project_root(tmp.path()).unwrap(), tmp.path());
    }

    #[test]
    fn find_project_root_from_subdirectory() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "").unwrap();
        let nested = tmp.path().join("src/pkg");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested).unwrap(), tmp.path());
    }

    #[test]
    fn config_file_resolves_to_its_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join(CONFIG_FILE);
        fs::write(&file, "").unwrap();
        let global = GlobalArgs {
            quiet: false,
            verbose: false,
            color: false,
            config: Some(file.to_string_lossy().into_owned()),
        };
        assert_eq!(resolve_project_root(&global).unwrap(), tmp.path());
    }

    #[test]
    fn tasks_run_up_to_the_named_one() {
        assert_eq!(tasks_through(None).unwrap(), Task::ALL.to_vec());
        assert_eq!(
            tasks_through(Some("build-ext")).unwrap(),
            vec![Task::Cythonize, Task::BuildExt]
        );
        assert!(tasks_through(Some("link")).is_err());
    }
}
