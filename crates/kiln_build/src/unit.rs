//! Build units: one graph node prepared for one task.
//!
//! A [`BuildUnit`] is an immutable snapshot of everything a builder needs.
//! It owns its data, so the graph can be mutated by grafts while units are
//! being built. Transformations such as the placeholder-extension policy
//! return a new unit instead of editing shared state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_cache::FingerprintInput;
use kiln_common::{Address, ContentHash};
use kiln_graph::{ExtModule, Provides};

use crate::task::Task;

/// One node prepared for one task.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    /// Cache identity: `<original address>#<task>`.
    pub id: String,
    /// The task that builds this unit.
    pub task: Task,
    /// Address of the graph node the unit was created from. This node is
    /// what the results are grafted onto.
    pub address: Address,
    /// Address of the user-declared node at the root of the derivation chain.
    pub original: Address,
    /// Directory `sources` are relative to.
    pub source_root: PathBuf,
    /// Input files relative to `source_root`.
    pub sources: Vec<PathBuf>,
    /// Fingerprint-sensitive options, including target attributes.
    pub options: BTreeMap<String, String>,
    /// Ids of other units in the same batch that must be built first.
    pub dependencies: Vec<String>,
    /// Hashes of inputs that are not units of the batch, keyed by address.
    pub external: BTreeMap<String, ContentHash>,
    /// Builder-specific instructions.
    pub spec: UnitSpec,
    /// Distribution identity handed to the synthetic node.
    pub provides: Option<Provides>,
    /// Set when the unit's artifact will contain a placeholder.
    pub synthetic_marker: bool,
}

/// What to build, by builder family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSpec {
    /// Source translation and native compilation.
    Compile(CompileSpec),
    /// Distribution packaging.
    Package(PackageSpec),
    /// Container images.
    Image(ImageSpec),
}

/// Compile builder instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileSpec {
    /// Translate Cython sources to C.
    Cythonize {
        /// Also compile plain `.py` modules instead of copying them.
        compile_python: bool,
    },
    /// Compile C/C++ sources into extension modules.
    BuildExt {
        /// Extension modules to build, sources relative to the source root.
        extensions: Vec<ExtModule>,
        /// Extensions live outside any package and are left to the wheel
        /// stage: sources are copied instead of compiled.
        deferred: bool,
        /// Files copied verbatim into the output.
        copy_sources: Vec<PathBuf>,
    },
}

/// Package builder instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSpec {
    /// Build an exploded wheel from staged files.
    Wheel {
        /// Files making up the distribution.
        staged: Vec<StagedFile>,
        /// A placeholder extension was added to force a platform wheel.
        using_dummy: bool,
    },
    /// Zip an exploded wheel into a `.whl`.
    Archive {
        /// Wheel file name without the `.whl` suffix.
        wheel_name: String,
    },
}

/// A file copied into a staging directory at `path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagedFile {
    /// Directory the file is read from.
    pub root: PathBuf,
    /// Path relative to `root`, and to the staging directory.
    pub path: PathBuf,
}

impl StagedFile {
    /// Absolute location of the file.
    pub fn source(&self) -> PathBuf {
        self.root.join(&self.path)
    }
}

/// Image builder instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// The Dockerfile, relative to the unit's source root.
    pub dockerfile: PathBuf,
    /// `[repository/]image_name[:tag]`.
    pub full_tag: String,
    /// `--build-arg` values.
    pub build_args: BTreeMap<String, String>,
    /// Push after building.
    pub push: bool,
    /// Files copied flat into the build context, absolute.
    pub context: Vec<PathBuf>,
}

impl BuildUnit {
    /// The unit's cache identity for `original` under `task`.
    pub fn unit_id(original: &Address, task: Task) -> String {
        format!("{original}#{}", task.name())
    }

    /// Returns a copy of this unit whose distribution carries a placeholder
    /// extension named `name`, flagged as synthetic.
    ///
    /// Units without `provides` are returned unchanged.
    pub fn with_placeholder_extension(&self, name: &str) -> BuildUnit {
        let Some(provides) = &self.provides else {
            return self.clone();
        };
        let mut unit = self.clone();
        unit.provides = Some(provides.with_placeholder_extension(name));
        unit.synthetic_marker = true;
        if let UnitSpec::Package(PackageSpec::Wheel { using_dummy, .. }) = &mut unit.spec {
            *using_dummy = true;
        }
        unit
    }

    /// Absolute paths of the unit's sources.
    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.sources.iter().map(|s| self.source_root.join(s)).collect()
    }

    /// Sources whose extension is one of `extensions` (without the dot).
    pub fn sources_with_extension<'a>(
        &'a self,
        extensions: &'a [&str],
    ) -> impl Iterator<Item = &'a Path> + 'a {
        self.sources
            .iter()
            .map(PathBuf::as_path)
            .filter(move |p| has_extension(p, extensions))
    }

    /// The fingerprint input describing this unit.
    pub fn fingerprint_input(&self) -> FingerprintInput {
        FingerprintInput {
            id: self.id.clone(),
            kind: self.task.name().to_string(),
            source_root: self.source_root.clone(),
            sources: self.sources.clone(),
            options: self.options.clone(),
            dependencies: self.dependencies.clone(),
            external: self.external.clone(),
        }
    }
}

/// Returns `true` if `path` has one of `extensions` (without the dot).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.contains(&e))
}
