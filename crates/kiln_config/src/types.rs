//! Configuration types deserialized from `kiln.toml`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// The top-level project configuration parsed from `kiln.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Core project metadata.
    pub project: ProjectMeta,
    /// Cache location.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Scheduling and output settings.
    #[serde(default)]
    pub build: BuildConfig,
    /// External tool executables.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Fingerprint-sensitive task options, keyed by task name then option name.
    #[serde(default)]
    pub options: BTreeMap<String, BTreeMap<String, toml::Value>>,
    /// Targets keyed by address (`path/to:name`).
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// Core project metadata required in every `kiln.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectMeta {
    /// The project name.
    pub name: String,
    /// The project version string.
    pub version: String,
    /// A brief description of the project.
    #[serde(default)]
    pub description: String,
}

/// Where build results are cached.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache root, relative to the project root unless absolute.
    #[serde(default = "default_cache_root")]
    pub root: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

fn default_cache_root() -> String {
    ".kiln-cache".to_string()
}

/// Scheduling and output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Worker pool size. `None` means the available CPU parallelism.
    pub jobs: Option<usize>,
    /// Stop scheduling new builds after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Directory packaged distributions are copied into.
    #[serde(default = "default_dist_dir")]
    pub dist_dir: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            fail_fast: false,
            dist_dir: default_dist_dir(),
        }
    }
}

fn default_dist_dir() -> String {
    "dist".to_string()
}

/// Executables invoked by the builders.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// The Cython compiler.
    #[serde(default = "default_cython")]
    pub cython: String,
    /// The Python interpreter used to run generated `setup.py` scripts.
    #[serde(default = "default_python")]
    pub python: String,
    /// The Docker client.
    #[serde(default = "default_docker")]
    pub docker: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cython: default_cython(),
            python: default_python(),
            docker: default_docker(),
        }
    }
}

fn default_cython() -> String {
    "cython".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_docker() -> String {
    "docker".to_string()
}

/// A target declaration, discriminated by its `kind` field.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConfig {
    /// Plain Python sources, consumed but never built.
    PythonLibrary(LibraryTarget),
    /// Loose resource files.
    Resources(LibraryTarget),
    /// `.pyx`/`.pxd` sources to be translated to C.
    CythonLibrary(LibraryTarget),
    /// C/C++ sources to be compiled into extension modules.
    ExtensionModule(ExtensionTarget),
    /// Sources to be packaged as a wheel. Requires `provides`.
    WheelLibrary(LibraryTarget),
    /// A Docker image built from a Dockerfile.
    DockerImage(DockerTarget),
}

impl TargetConfig {
    /// The `kind` string this target was declared with.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TargetConfig::PythonLibrary(_) => "python_library",
            TargetConfig::Resources(_) => "resources",
            TargetConfig::CythonLibrary(_) => "cython_library",
            TargetConfig::ExtensionModule(_) => "extension_module",
            TargetConfig::WheelLibrary(_) => "wheel_library",
            TargetConfig::DockerImage(_) => "docker_image",
        }
    }

    /// Declared dependency addresses.
    pub fn dependencies(&self) -> &[String] {
        match self {
            TargetConfig::PythonLibrary(t)
            | TargetConfig::Resources(t)
            | TargetConfig::CythonLibrary(t)
            | TargetConfig::WheelLibrary(t) => &t.dependencies,
            TargetConfig::ExtensionModule(t) => &t.library.dependencies,
            TargetConfig::DockerImage(t) => &t.dependencies,
        }
    }

    /// Source paths, relative to the project root.
    pub fn sources(&self) -> Vec<String> {
        match self {
            TargetConfig::PythonLibrary(t)
            | TargetConfig::Resources(t)
            | TargetConfig::CythonLibrary(t)
            | TargetConfig::WheelLibrary(t) => t.sources.clone(),
            TargetConfig::ExtensionModule(t) => t.library.sources.clone(),
            TargetConfig::DockerImage(t) => vec![t.source.clone()],
        }
    }

    /// The library fields shared by every non-image kind.
    pub fn library(&self) -> Option<&LibraryTarget> {
        match self {
            TargetConfig::PythonLibrary(t)
            | TargetConfig::Resources(t)
            | TargetConfig::CythonLibrary(t)
            | TargetConfig::WheelLibrary(t) => Some(t),
            TargetConfig::ExtensionModule(t) => Some(&t.library),
            TargetConfig::DockerImage(_) => None,
        }
    }
}

/// Fields common to source-carrying targets.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LibraryTarget {
    /// Source paths relative to the project root. Accepts a string or a list.
    #[serde(default, deserialize_with = "deserialize_string_or_vec")]
    pub sources: Vec<String>,
    /// Source root that package structure is computed against. Defaults to
    /// the target's directory.
    pub base: Option<String>,
    /// Addresses of targets this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Distribution metadata.
    pub provides: Option<ProvidesConfig>,
    /// Free-form tags carried onto derived targets.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An extension module target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtensionTarget {
    /// Common library fields.
    #[serde(flatten)]
    pub library: LibraryTarget,
    /// Compile all sources into a single module with this dotted name.
    pub module_name: Option<String>,
    /// Preprocessor macros, `NAME` or `NAME=VALUE`.
    #[serde(default)]
    pub define_macros: Vec<String>,
    /// Libraries to link against.
    #[serde(default)]
    pub libraries: Vec<String>,
}

/// Distribution metadata (the `setup.py` keywords that matter here).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvidesConfig {
    /// Distribution name.
    pub name: String,
    /// Distribution version.
    pub version: String,
    /// Extension modules built as part of the distribution.
    #[serde(default)]
    pub ext_modules: Vec<ExtModuleConfig>,
}

/// One extension module declared inside a `provides` block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtModuleConfig {
    /// Dotted module name.
    pub name: String,
    /// Sources relative to the target's base.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Extra include directories relative to the target's base.
    #[serde(default)]
    pub include_dirs: Vec<String>,
    /// Preprocessor macros, `NAME` or `NAME=VALUE`.
    #[serde(default)]
    pub define_macros: Vec<String>,
    /// Libraries to link against.
    #[serde(default)]
    pub libraries: Vec<String>,
}

/// A Docker image target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerTarget {
    /// Path to the Dockerfile. Its file name must be `Dockerfile`.
    pub source: String,
    /// Image tag (the part after `:`).
    pub tag: Option<String>,
    /// Registry/repository prefix.
    pub repository: Option<String>,
    /// Image name. Defaults to the target name.
    pub image_name: Option<String>,
    /// Build arguments, each `name=value`.
    #[serde(default)]
    pub build_args: Vec<String>,
    /// Push the image after a successful build.
    #[serde(default)]
    pub push: bool,
    /// Targets whose files make up the build context.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Deserializes a field that can be either a single string or a list of strings.
///
/// Allows TOML config to accept both `sources = "a.pyx"` (string) and
/// `sources = ["a.pyx", "b.pyx"]` (array of strings).
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut vec = Vec::new();
            while let Some(val) = seq.next_element::<String>()? {
                vec.push(val);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}
