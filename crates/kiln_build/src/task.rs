//! The build tasks.
//!
//! Each task selects graph nodes by kind, turns each node into a
//! [`BuildUnit`] and, once the unit has results, describes the synthetic
//! node that stands in for them. Tasks run in [`Task::ALL`] order, so later
//! tasks select the nodes earlier tasks grafted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_cache::CacheEntry;
use kiln_common::{Address, ContentHasher};
use kiln_config::{parse_build_args, parse_define_macro, resolve_task_options, TargetConfig};
use kiln_graph::{
    effective_dependencies, exported_targets, resolve_original, BuildGraph, Companion,
    GraftRequest, GraphError, NodeId, Provides, TargetNode,
};

use crate::compile::{deferred_copy_sources, plan_extensions, ExtensionSettings};
use crate::error::BuildError;
use crate::image::full_tag;
use crate::package::{WHEEL_MODULE_EXTENSIONS, WHEEL_NAME};
use crate::project::Project;
use crate::stage::{self, PACKAGE_INIT};
use crate::unit::{
    has_extension, BuildUnit, CompileSpec, ImageSpec, PackageSpec, StagedFile, UnitSpec,
};

/// Plain Python sources.
pub const PYTHON_LIBRARY: &str = "python_library";
/// Loose files.
pub const RESOURCES: &str = "resources";
/// Cython sources.
pub const CYTHON_LIBRARY: &str = "cython_library";
/// C sources waiting to be compiled.
pub const EXTENSION_MODULE: &str = "extension_module";
/// Sources ready to be packaged.
pub const WHEEL_LIBRARY: &str = "wheel_library";
/// A packaged `.whl`.
pub const PYTHON_DIST: &str = "python_dist";
/// A Docker image declaration.
pub const DOCKER_IMAGE: &str = "docker_image";
/// A built Docker image.
pub const DOCKER_IMAGE_BUILT: &str = "docker_image_built";

/// Tag marking the synthetic node of an exploded wheel.
pub const EXPLODED_WHEEL_TAG: &str = "exploded_wheel";

const PLACEHOLDER_FALLBACK: &str = "dummy";

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {
    /// Translate Cython sources to C.
    Cythonize,
    /// Compile C sources into extension modules.
    BuildExt,
    /// Build exploded wheels.
    BuildWheel,
    /// Zip exploded wheels into `.whl` files.
    PackageWheel,
    /// Build Docker images.
    Docker,
}

impl Task {
    /// Every task, in pipeline order.
    pub const ALL: [Task; 5] = [
        Task::Cythonize,
        Task::BuildExt,
        Task::BuildWheel,
        Task::PackageWheel,
        Task::Docker,
    ];

    /// The task's command-line name, also used as its options section.
    pub fn name(self) -> &'static str {
        match self {
            Task::Cythonize => "cythonize",
            Task::BuildExt => "build-ext",
            Task::BuildWheel => "build-wheel",
            Task::PackageWheel => "package-wheel",
            Task::Docker => "docker",
        }
    }

    /// Looks a task up by name.
    pub fn parse(name: &str) -> Option<Task> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Kind label of the nodes this task grafts.
    pub fn synthetic_kind(self) -> &'static str {
        match self {
            Task::Cythonize => EXTENSION_MODULE,
            Task::BuildExt => WHEEL_LIBRARY,
            Task::BuildWheel => PYTHON_LIBRARY,
            Task::PackageWheel => PYTHON_DIST,
            Task::Docker => DOCKER_IMAGE_BUILT,
        }
    }

    /// The task that selects this task's synthetic nodes. Wheel libraries
    /// are only picked up when they are exported.
    pub fn picked_up_by(self, exported: bool) -> Option<Task> {
        match self {
            Task::Cythonize => Some(Task::BuildExt),
            Task::BuildExt if exported => Some(Task::BuildWheel),
            Task::BuildWheel => Some(Task::PackageWheel),
            _ => None,
        }
    }

    /// The nodes this task builds in the current graph, sorted by address.
    pub fn select(self, graph: &BuildGraph) -> Vec<NodeId> {
        let mut ids = match self {
            Task::Cythonize => graph.nodes_of_kind(CYTHON_LIBRARY),
            Task::BuildExt => graph.nodes_of_kind(EXTENSION_MODULE),
            Task::BuildWheel => exported_targets(graph, |n| {
                n.provides.is_some()
                    && !n.tags.contains(EXPLODED_WHEEL_TAG)
                    && !matches!(n.kind.as_str(), PYTHON_DIST | DOCKER_IMAGE | DOCKER_IMAGE_BUILT)
            }),
            Task::PackageWheel => graph
                .nodes()
                .filter(|(_, n)| n.kind == PYTHON_LIBRARY && n.tags.contains(EXPLODED_WHEEL_TAG))
                .map(|(id, _)| id)
                .collect(),
            Task::Docker => graph.nodes_of_kind(DOCKER_IMAGE),
        };
        sort_by_address(graph, &mut ids);
        ids
    }

    /// Id of the unit this task would create for `node`.
    pub fn unit_id_for(self, graph: &BuildGraph, node: NodeId) -> String {
        BuildUnit::unit_id(&original_address(graph, node), self)
    }

    /// Prepares the unit that builds `node` under this task.
    pub fn prepare(self, project: &mut Project, node: NodeId) -> Result<BuildUnit, BuildError> {
        let target = project
            .graph()
            .node(node)
            .cloned()
            .ok_or(GraphError::StaleHandle(node))?;
        let original = original_address(project.graph(), node);
        let id = BuildUnit::unit_id(&original, self);

        let mut options = resolve_task_options(project.config(), self.name());
        options.insert("target.kind".to_string(), target.kind.clone());
        if let Some(provides) = &target.provides {
            options.insert("target.provides".to_string(), provides_digest(provides));
        }

        let mut sources = target.sources.clone();
        let mut provides = target.provides.clone();
        let mut placeholder = None;

        let spec = match self {
            Task::Cythonize => UnitSpec::Compile(CompileSpec::Cythonize {
                compile_python: options.get("compile_python").is_some_and(|v| v == "true"),
            }),
            Task::BuildExt => {
                let settings = match project.target_of(node) {
                    Some(TargetConfig::ExtensionModule(ext)) => ExtensionSettings {
                        module_name: ext.module_name.clone(),
                        define_macros: ext
                            .define_macros
                            .iter()
                            .map(|m| parse_define_macro(m))
                            .collect::<Result<_, _>>()?,
                        libraries: ext.libraries.clone(),
                    },
                    _ => ExtensionSettings::default(),
                };
                if let Some(module_name) = &settings.module_name {
                    options.insert("target.module_name".to_string(), module_name.clone());
                }
                let macros: Vec<String> = settings
                    .define_macros
                    .iter()
                    .map(|(n, v)| v.as_ref().map_or_else(|| n.clone(), |v| format!("{n}={v}")))
                    .collect();
                options.insert("target.define_macros".to_string(), macros.join(","));
                options.insert("target.libraries".to_string(), settings.libraries.join(","));

                let declared = target
                    .provides
                    .as_ref()
                    .map(|p| p.ext_modules.clone())
                    .unwrap_or_default();
                let plan = plan_extensions(&target.source_root, &target.sources, &settings, &declared);
                let mut copy_sources = Vec::new();
                if plan.deferred {
                    let Some(declared_provides) = &target.provides else {
                        return Err(BuildError::InvalidModuleExtension { unit: id });
                    };
                    copy_sources = deferred_copy_sources(&target.source_root, &target.sources, &plan)?;
                    sources.extend(copy_sources.iter().cloned());
                    provides = Some(declared_provides.with_ext_modules(plan.extensions.clone()));
                } else {
                    provides = provides.map(|p| p.with_ext_modules(Vec::new()));
                }
                UnitSpec::Compile(CompileSpec::BuildExt {
                    extensions: plan.extensions,
                    deferred: plan.deferred,
                    copy_sources,
                })
            }
            Task::BuildWheel => {
                let staged = staged_files(project.graph(), node, &target);
                let has_native = staged.iter().any(|f| has_extension(&f.path, &["so", "a"]));
                if has_native && provides.as_ref().is_some_and(|p| p.ext_modules.is_empty()) {
                    placeholder = Some(placeholder_name(&staged));
                }
                UnitSpec::Package(PackageSpec::Wheel {
                    staged,
                    using_dummy: false,
                })
            }
            Task::PackageWheel => {
                sources = stage::find_files(&target.source_root, None)?;
                let wheel_name = target
                    .source_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                UnitSpec::Package(PackageSpec::Archive { wheel_name })
            }
            Task::Docker => {
                let Some(TargetConfig::DockerImage(image)) = project.target_of(node) else {
                    return Err(BuildError::Unsupported {
                        unit: id,
                        builder: "image",
                    });
                };
                let image_name = image
                    .image_name
                    .clone()
                    .unwrap_or_else(|| original.name().to_string());
                let tag = full_tag(image.repository.as_deref(), &image_name, image.tag.as_deref());
                let build_args = parse_build_args(&image.build_args)?;
                let push = image.push;
                options.insert("target.full_tag".to_string(), tag.clone());
                options.insert(
                    "target.build_args".to_string(),
                    build_args
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(","),
                );
                options.insert("target.push".to_string(), push.to_string());
                UnitSpec::Image(ImageSpec {
                    dockerfile: target
                        .sources
                        .first()
                        .cloned()
                        .unwrap_or_else(|| PathBuf::from("Dockerfile")),
                    full_tag: tag,
                    build_args,
                    push,
                    context: docker_context(project.graph(), node),
                })
            }
        };
        sources.sort();
        sources.dedup();

        let inputs = input_nodes(project.graph(), node);
        let graph = project.graph_mut();
        let mut external = BTreeMap::new();
        for input in inputs {
            let Some(address) = graph.node(input).map(|n| n.address.to_string()) else {
                continue;
            };
            external.insert(address, graph.invalidation_hash(input));
        }

        let unit = BuildUnit {
            id,
            task: self,
            address: target.address.clone(),
            original,
            source_root: target.source_root.clone(),
            sources,
            options,
            dependencies: Vec::new(),
            external,
            spec,
            provides,
            synthetic_marker: false,
        };
        Ok(match placeholder {
            Some(name) => {
                tracing::warn!(
                    unit = %unit.id,
                    extension = %name,
                    "native files but no extension modules; adding a placeholder extension"
                );
                unit.with_placeholder_extension(&name)
            }
            None => unit,
        })
    }

    /// Describes the synthetic node for `unit`'s committed results.
    pub fn graft_request(
        self,
        project: &Project,
        unit: &BuildUnit,
        entry: &CacheEntry,
    ) -> Result<GraftRequest, BuildError> {
        let spec_path = entry
            .results_dir
            .strip_prefix(project.root())
            .map(stage::portable)
            .unwrap_or_else(|_| format!("results/{}", entry.fingerprint));
        let mut request = GraftRequest {
            original: unit.address.clone(),
            synthetic_address: Address::new(spec_path.clone(), unit.original.id()),
            kind: self.synthetic_kind().to_string(),
            source_root: entry.results_dir.clone(),
            sources: entry.record.file_paths(),
            provides: unit.provides.clone(),
            payload_hash: entry.fingerprint.hash(),
            companions: Vec::new(),
            tags: BTreeSet::new(),
        };

        if self == Task::BuildWheel {
            let wheel_name = entry.record.metadata.get(WHEEL_NAME).ok_or_else(|| {
                BuildError::MissingOutput {
                    unit: unit.id.clone(),
                    reason: "artifact record names no wheel".to_string(),
                }
            })?;
            let mut modules = Vec::new();
            let mut dist_info = Vec::new();
            for path in std::mem::take(&mut request.sources) {
                let Ok(rel) = path.strip_prefix(wheel_name) else {
                    continue;
                };
                if is_dist_info(rel) {
                    dist_info.push(rel.to_path_buf());
                } else if has_extension(rel, WHEEL_MODULE_EXTENSIONS) {
                    modules.push(rel.to_path_buf());
                }
            }
            let payload_hash = ContentHasher::new()
                .write_hash(&entry.fingerprint.hash())
                .write_str("dist_info")
                .finish();
            request.companions.push(Companion {
                address: Address::new(spec_path, format!("{}_dist_info", unit.original.id())),
                kind: RESOURCES.to_string(),
                sources: dist_info,
                payload_hash,
            });
            request.source_root = entry.results_dir.join(wheel_name);
            request.sources = modules;
            request.tags.insert(EXPLODED_WHEEL_TAG.to_string());
        }
        Ok(request)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn sort_by_address(graph: &BuildGraph, ids: &mut [NodeId]) {
    ids.sort_by(|a, b| {
        let a = graph.node(*a).map(|n| &n.address);
        let b = graph.node(*b).map(|n| &n.address);
        a.cmp(&b)
    });
}

fn original_address(graph: &BuildGraph, node: NodeId) -> Address {
    let original = resolve_original(graph, node);
    graph
        .node(original)
        .or_else(|| graph.node(node))
        .map(|n| n.address.clone())
        .unwrap_or_else(|| Address::new("", "unknown"))
}

fn provides_digest(provides: &Provides) -> String {
    let mut hasher = ContentHasher::new();
    provides.hash_into(&mut hasher);
    hasher.finish().to_string()
}

/// Effective dependencies of `id` and of the node it was derived from.
fn input_dependencies(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let mut deps = effective_dependencies(graph, id);
    let original = resolve_original(graph, id);
    if original != id {
        for dep in effective_dependencies(graph, original) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }
    deps
}

/// The nodes whose invalidation hashes enter a unit's fingerprint: its
/// inputs, minus anything on its own derivation chain.
fn input_nodes(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let origin = resolve_original(graph, id);
    let mut out: Vec<NodeId> = input_dependencies(graph, id)
        .into_iter()
        .filter(|d| resolve_original(graph, *d) != origin)
        .collect();
    sort_by_address(graph, &mut out);
    out
}

/// Nodes whose files are bundled into the distribution built from `id`.
///
/// The walk stops at other distributions and at images.
fn bundled_closure(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let origin = resolve_original(graph, id);
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut queue = input_dependencies(graph, id);
    while let Some(dep) = queue.pop() {
        if !seen.insert(dep) {
            continue;
        }
        let Some(node) = graph.node(dep) else {
            continue;
        };
        if resolve_original(graph, dep) == origin
            || node.provides.is_some()
            || matches!(node.kind.as_str(), DOCKER_IMAGE | DOCKER_IMAGE_BUILT)
        {
            continue;
        }
        out.push(dep);
        queue.extend(input_dependencies(graph, dep));
    }
    sort_by_address(graph, &mut out);
    out
}

/// The files a wheel is built from: the node's own sources first, then the
/// bundled closure. The first file claiming a path wins.
fn staged_files(graph: &BuildGraph, id: NodeId, target: &TargetNode) -> Vec<StagedFile> {
    let mut staged: BTreeMap<PathBuf, StagedFile> = BTreeMap::new();
    let mut add = |node: &TargetNode| {
        for rel in &node.sources {
            staged.entry(rel.clone()).or_insert_with(|| StagedFile {
                root: node.source_root.clone(),
                path: rel.clone(),
            });
        }
    };
    add(target);
    for dep in bundled_closure(graph, id) {
        if let Some(node) = graph.node(dep) {
            add(node);
        }
    }
    staged.into_values().collect()
}

/// Top-level package of the shallowest `__init__.py`, or a fixed fallback.
fn placeholder_name(staged: &[StagedFile]) -> String {
    staged
        .iter()
        .filter(|f| f.path.file_name().is_some_and(|n| n == PACKAGE_INIT))
        .min_by_key(|f| (f.path.components().count(), f.path.clone()))
        .and_then(|f| f.path.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|name| name != PACKAGE_INIT)
        .unwrap_or_else(|| PLACEHOLDER_FALLBACK.to_string())
}

/// Absolute paths of the resources and packaged wheels an image depends on.
fn docker_context(graph: &BuildGraph, id: NodeId) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut files = BTreeSet::new();
    let mut queue = effective_dependencies(graph, id);
    while let Some(dep) = queue.pop() {
        if !seen.insert(dep) {
            continue;
        }
        let Some(node) = graph.node(dep) else {
            continue;
        };
        if matches!(node.kind.as_str(), RESOURCES | PYTHON_DIST) {
            files.extend(node.source_paths());
        }
        queue.extend(effective_dependencies(graph, dep));
    }
    files.into_iter().collect()
}

fn is_dist_info(rel: &Path) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| c.as_os_str().to_string_lossy().ends_with(".dist-info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cache::{ArtifactFile, ArtifactRecord, Fingerprint};
    use kiln_common::ContentHash;
    use kiln_config::load_config_from_str;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rel).unwrap();
    }

    fn project(dir: &Path, config: &str) -> Project {
        Project::from_config(dir, load_config_from_str(config).unwrap()).unwrap()
    }

    fn node(project: &Project, address: &str) -> NodeId {
        project
            .graph()
            .lookup(&Address::parse(address).unwrap())
            .unwrap()
    }

    #[test]
    fn names_round_trip() {
        for task in Task::ALL {
            assert_eq!(Task::parse(task.name()), Some(task));
        }
        assert_eq!(Task::parse("compile"), None);
        assert_eq!(Task::BuildExt.to_string(), "build-ext");
    }

    #[test]
    fn synthetic_nodes_are_picked_up_downstream() {
        assert_eq!(Task::Cythonize.picked_up_by(false), Some(Task::BuildExt));
        assert_eq!(Task::BuildExt.picked_up_by(false), None);
        assert_eq!(Task::BuildExt.picked_up_by(true), Some(Task::BuildWheel));
        assert_eq!(Task::BuildWheel.picked_up_by(true), Some(Task::PackageWheel));
        assert_eq!(Task::PackageWheel.picked_up_by(true), None);
        assert_eq!(Task::Docker.picked_up_by(false), None);
    }

    #[test]
    fn cythonize_reads_its_options() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/pkg/__init__.py");
        touch(dir.path(), "src/pkg/fast.pyx");
        let mut project = project(
            dir.path(),
            r#"
[project]
name = "demo"
version = "0.1.0"

[options.cythonize]
compile_python = true

[targets."src/pkg:fast"]
kind = "cython_library"
sources = ["src/pkg/__init__.py", "src/pkg/fast.pyx"]
base = "src"
"#,
        );
        let id = node(&project, "src/pkg:fast");
        assert_eq!(Task::Cythonize.select(project.graph()), vec![id]);
        assert!(Task::BuildExt.select(project.graph()).is_empty());

        let unit = Task::Cythonize.prepare(&mut project, id).unwrap();
        assert_eq!(unit.id, "src/pkg:fast#cythonize");
        assert_eq!(
            unit.spec,
            UnitSpec::Compile(CompileSpec::Cythonize {
                compile_python: true
            })
        );
        assert_eq!(unit.options["compile_python"], "true");
        assert_eq!(unit.options["target.kind"], CYTHON_LIBRARY);
    }

    #[test]
    fn top_level_extension_without_provides_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/speedup.c");
        let mut project = project(
            dir.path(),
            r#"
[project]
name = "demo"
version = "0.1.0"

[targets."src:speedup"]
kind = "extension_module"
sources = ["src/speedup.c"]
"#,
        );
        let id = node(&project, "src:speedup");
        let err = Task::BuildExt.prepare(&mut project, id).unwrap_err();
        assert!(matches!(err, BuildError::InvalidModuleExtension { .. }));
    }

    #[test]
    fn top_level_extension_is_deferred_to_the_wheel() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/speedup.c");
        touch(dir.path(), "src/speedup.h");
        let mut project = project(
            dir.path(),
            r#"
[project]
name = "demo"
version = "0.1.0"

[targets."src:speedup"]
kind = "extension_module"
sources = ["src/speedup.c"]
define_macros = ["NDEBUG"]

[targets."src:speedup".provides]
name = "speedup"
version = "1.0"
"#,
        );
        let id = node(&project, "src:speedup");
        let unit = Task::BuildExt.prepare(&mut project, id).unwrap();
        let UnitSpec::Compile(CompileSpec::BuildExt { deferred, .. }) = &unit.spec else {
            panic!("not a build-ext unit");
        };
        assert!(*deferred);
        let provides = unit.provides.as_ref().unwrap();
        assert_eq!(provides.ext_modules.len(), 1);
        assert_eq!(provides.ext_modules[0].name, "speedup");
        assert_eq!(unit.options["target.define_macros"], "NDEBUG");
    }

    #[test]
    fn wheel_with_native_files_gets_a_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/pkg/__init__.py");
        touch(dir.path(), "src/pkg/sub/__init__.py");
        touch(dir.path(), "src/pkg/fast.so");
        let mut project = project(
            dir.path(),
            r#"
[project]
name = "demo"
version = "0.1.0"

[targets."src/pkg:dist"]
kind = "wheel_library"
sources = ["src/pkg/__init__.py", "src/pkg/sub/__init__.py", "src/pkg/fast.so"]
base = "src"

[targets."src/pkg:dist".provides]
name = "demo"
version = "0.1.0"
"#,
        );
        let id = node(&project, "src/pkg:dist");
        assert_eq!(Task::BuildWheel.select(project.graph()), vec![id]);
        let unit = Task::BuildWheel.prepare(&mut project, id).unwrap();
        assert!(unit.synthetic_marker);
        assert_eq!(unit.provides.as_ref().unwrap().ext_modules[0].name, "pkg");
        assert!(project.graph().node(id).unwrap().provides.as_ref().unwrap().ext_modules.is_empty());
    }

    #[test]
    fn placeholder_falls_back_without_packages() {
        let staged = vec![StagedFile {
            root: PathBuf::from("/r"),
            path: PathBuf::from("lib.so"),
        }];
        assert_eq!(placeholder_name(&staged), "dummy");
    }

    #[test]
    fn wheel_graft_splits_dist_info_into_a_companion() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/pkg/__init__.py");
        let project = project(
            dir.path(),
            r#"
[project]
name = "demo"
version = "0.1.0"

[targets."src/pkg:dist"]
kind = "wheel_library"
sources = ["src/pkg/__init__.py"]
base = "src"

[targets."src/pkg:dist".provides]
name = "demo"
version = "0.1.0"
"#,
        );
        let fingerprint = Fingerprint::from_hash(ContentHash::from_bytes(b"wheel"));
        let results_dir = dir.path().join(".kiln-cache/results").join(fingerprint.to_string());
        let file = |path: &str| ArtifactFile {
            path: path.to_string(),
            hash: ContentHash::from_bytes(path.as_bytes()),
            size: 1,
        };
        let mut metadata = BTreeMap::new();
        metadata.insert(WHEEL_NAME.to_string(), "demo-0.1.0-py3-none-any".to_string());
        let entry = CacheEntry {
            fingerprint,
            results_dir: results_dir.clone(),
            record: ArtifactRecord {
                unit: "src/pkg:dist#build-wheel".to_string(),
                fingerprint,
                files: vec![
                    file("demo-0.1.0-py3-none-any/demo-0.1.0.dist-info/METADATA"),
                    file("demo-0.1.0-py3-none-any/pkg/__init__.py"),
                    file("demo-0.1.0-py3-none-any/pkg/notes.txt"),
                ],
                synthetic_marker: false,
                metadata,
            },
        };
        let address = Address::new("src/pkg", "dist");
        let unit = BuildUnit {
            id: BuildUnit::unit_id(&address, Task::BuildWheel),
            task: Task::BuildWheel,
            address: address.clone(),
            original: address,
            source_root: dir.path().join("src"),
            sources: Vec::new(),
            options: BTreeMap::new(),
            dependencies: Vec::new(),
            external: BTreeMap::new(),
            spec: UnitSpec::Package(PackageSpec::Archive {
                wheel_name: String::new(),
            }),
            provides: Some(Provides::new("demo", "0.1.0")),
            synthetic_marker: false,
        };

        let request = Task::BuildWheel.graft_request(&project, &unit, &entry).unwrap();
        assert_eq!(request.kind, PYTHON_LIBRARY);
        assert_eq!(
            request.synthetic_address.spec_path(),
            format!(".kiln-cache/results/{fingerprint}")
        );
        assert_eq!(request.source_root, results_dir.join("demo-0.1.0-py3-none-any"));
        assert_eq!(request.sources, vec![PathBuf::from("pkg/__init__.py")]);
        assert!(request.tags.contains(EXPLODED_WHEEL_TAG));
        assert_eq!(request.companions.len(), 1);
        assert_eq!(request.companions[0].kind, RESOURCES);
        assert_eq!(
            request.companions[0].sources,
            vec![PathBuf::from("demo-0.1.0.dist-info/METADATA")]
        );
        assert_eq!(request.companions[0].address.name(), "src.pkg.dist_dist_info");
    }
}
