//! The compile builder: Cython translation and native extension builds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_config::ToolsConfig;
use kiln_graph::ExtModule;
use rayon::prelude::*;

use crate::builder::{ArtifactBuilder, BuildOutput};
use crate::error::BuildError;
use crate::setup_py::{SetupScript, EXTRA_COMPILE_ARGS};
use crate::stage::{self, PACKAGE_INIT};
use crate::tool::{Invocation, ToolInvoker};
use crate::unit::{has_extension, BuildUnit, CompileSpec, UnitSpec};

/// Compiler directives passed to every Cython run.
pub const CYTHON_DIRECTIVES: &[&str] = &["always_allow_keywords=True"];

/// Scratch directory for `setup.py build_ext`, removed before commit.
const BUILD_TEMP: &str = ".kiln-build";

/// Extensions of sources handed to the C compiler.
const C_SOURCES: &[&str] = &["c", "cpp"];

/// Extensions of built native modules.
const NATIVE_MODULES: &[&str] = &["so", "pyd"];

/// Builds [`CompileSpec`] units.
pub struct CompileBuilder {
    cython: String,
    python: String,
    invoker: Arc<dyn ToolInvoker>,
}

impl CompileBuilder {
    /// Creates a builder using the configured executables.
    pub fn new(tools: &ToolsConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            cython: tools.cython.clone(),
            python: tools.python.clone(),
            invoker,
        }
    }

    fn cythonize(
        &self,
        unit: &BuildUnit,
        compile_python: bool,
        workspace: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let mut jobs = Vec::new();
        for rel in &unit.sources {
            let is_init = rel.file_name().is_some_and(|n| n == PACKAGE_INIT);
            let compile = !is_init
                && (has_extension(rel, &["pyx"]) || (compile_python && has_extension(rel, &["py"])));
            let dest = stage::copy_package_structure(workspace, &unit.source_root, rel)?;
            if compile {
                jobs.push((unit.source_root.join(rel), dest.with_extension("c")));
            } else if has_extension(rel, &["py", "pxd"]) {
                stage::copy_file(&unit.source_root.join(rel), &dest)?;
            }
        }

        tracing::debug!(unit = %unit.id, files = jobs.len(), "cythonizing");
        jobs.par_iter()
            .map(|(source, dest)| {
                let invocation = Invocation::new(&unit.id, &self.cython, &unit.source_root)
                    .args(CYTHON_DIRECTIVES.iter().flat_map(|d| ["-X", *d]))
                    .arg("-o")
                    .arg(dest.to_string_lossy())
                    .arg(source.to_string_lossy());
                self.invoker.invoke(&invocation)?;
                if dest.is_file() {
                    Ok(())
                } else {
                    Err(BuildError::MissingOutput {
                        unit: unit.id.clone(),
                        reason: format!("cython wrote no {}", dest.display()),
                    })
                }
            })
            .collect::<Result<Vec<()>, BuildError>>()?;
        Ok(BuildOutput::default())
    }

    fn build_ext(
        &self,
        unit: &BuildUnit,
        extensions: &[ExtModule],
        deferred: bool,
        copy_sources: &[PathBuf],
        workspace: &Path,
    ) -> Result<BuildOutput, BuildError> {
        if deferred {
            tracing::info!(unit = %unit.id, "deferring extensions to the wheel stage");
            for rel in copy_sources {
                stage::copy_file(&unit.source_root.join(rel), &workspace.join(rel))?;
            }
            return Ok(BuildOutput::default().with("deferred", "true"));
        }

        for ext in extensions {
            for source in &ext.sources {
                stage::copy_package_structure(workspace, &unit.source_root, Path::new(source))?;
            }
        }
        let build_dir = workspace.join(BUILD_TEMP);
        std::fs::create_dir_all(&build_dir).map_err(|e| BuildError::io(&build_dir, e))?;
        let script = build_dir.join("setup.py");
        let setup = SetupScript {
            ext_modules: extensions.to_vec(),
            ..SetupScript::default()
        };
        std::fs::write(&script, setup.render()).map_err(|e| BuildError::io(&script, e))?;

        let invocation = Invocation::new(&unit.id, &self.python, &unit.source_root)
            .arg(script.to_string_lossy())
            .arg("build_ext")
            .arg("--build-temp")
            .arg(build_dir.join("tmp").to_string_lossy())
            .arg("--build-lib")
            .arg(workspace.to_string_lossy());
        let result = self.invoker.invoke(&invocation);
        stage::remove_after(&build_dir, result)?;

        if !extensions.is_empty() && stage::find_files(workspace, Some(NATIVE_MODULES))?.is_empty() {
            return Err(BuildError::MissingOutput {
                unit: unit.id.clone(),
                reason: "build_ext produced no extension module".to_string(),
            });
        }

        for rel in unit.sources_with_extension(&["py"]) {
            let dest = stage::copy_package_structure(workspace, &unit.source_root, rel)?;
            stage::copy_file(&unit.source_root.join(rel), &dest)?;
        }
        Ok(BuildOutput::default())
    }
}

impl ArtifactBuilder for CompileBuilder {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn build(&self, unit: &BuildUnit, workspace: &Path) -> Result<BuildOutput, BuildError> {
        match &unit.spec {
            UnitSpec::Compile(CompileSpec::Cythonize { compile_python }) => {
                self.cythonize(unit, *compile_python, workspace)
            }
            UnitSpec::Compile(CompileSpec::BuildExt {
                extensions,
                deferred,
                copy_sources,
            }) => self.build_ext(unit, extensions, *deferred, copy_sources, workspace),
            _ => Err(BuildError::Unsupported {
                unit: unit.id.clone(),
                builder: self.name(),
            }),
        }
    }
}

/// Per-target settings applied to generated extensions.
#[derive(Debug, Clone, Default)]
pub struct ExtensionSettings {
    /// Compile all sources into one module with this dotted name.
    pub module_name: Option<String>,
    /// Preprocessor macros.
    pub define_macros: Vec<(String, Option<String>)>,
    /// Libraries to link against.
    pub libraries: Vec<String>,
}

/// The extensions a build-ext unit will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPlan {
    /// Every extension, in build order.
    pub extensions: Vec<ExtModule>,
    /// Directories holding C sources, relative to the source root.
    pub include_dirs: BTreeSet<String>,
    /// At least one extension is outside any package.
    pub deferred: bool,
}

/// Works out which extensions to build from a target's sources.
///
/// `declared` extensions (from a `provides` block) win. Otherwise a
/// `module_name` collects every C source into one module, and without one
/// each source becomes a module named after its enclosing package.
pub fn plan_extensions(
    source_root: &Path,
    sources: &[PathBuf],
    settings: &ExtensionSettings,
    declared: &[ExtModule],
) -> ExtensionPlan {
    let c_sources: Vec<&Path> = sources
        .iter()
        .map(PathBuf::as_path)
        .filter(|p| has_extension(p, C_SOURCES))
        .collect();
    let include_dirs: BTreeSet<String> = c_sources
        .iter()
        .filter_map(|p| p.parent())
        .map(stage::portable)
        .filter(|d| !d.is_empty())
        .collect();

    let make = |name: String, sources: Vec<String>| ExtModule {
        name,
        sources,
        include_dirs: include_dirs.iter().cloned().collect(),
        define_macros: settings.define_macros.clone(),
        libraries: settings.libraries.clone(),
        extra_compile_args: EXTRA_COMPILE_ARGS.iter().map(|s| s.to_string()).collect(),
    };

    let extensions = if !declared.is_empty() {
        declared.to_vec()
    } else if let Some(module_name) = &settings.module_name {
        vec![make(
            module_name.clone(),
            c_sources.iter().map(|p| stage::portable(p)).collect(),
        )]
    } else {
        c_sources
            .iter()
            .map(|p| make(module_name_for(source_root, p), vec![stage::portable(p)]))
            .collect()
    };
    let deferred = extensions.iter().any(|e| !e.name.contains('.'));
    ExtensionPlan {
        extensions,
        include_dirs,
        deferred,
    }
}

/// Dotted module name of `rel`: the nearest enclosing package plus the file
/// stem. A file outside any package gets a bare name.
pub fn module_name_for(source_root: &Path, rel: &Path) -> String {
    let stem = rel
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut package = rel.parent().map(Path::to_path_buf).unwrap_or_default();
    while !package.as_os_str().is_empty() && !stage::is_package(&source_root.join(&package)) {
        package = package.parent().map(Path::to_path_buf).unwrap_or_default();
    }
    if package.as_os_str().is_empty() {
        stem
    } else {
        format!("{}.{stem}", stage::portable(&package).replace('/', "."))
    }
}

/// Files copied verbatim when extensions are deferred: the unit's sources,
/// every declared extension source, and everything under the include
/// directories.
pub fn deferred_copy_sources(
    source_root: &Path,
    sources: &[PathBuf],
    plan: &ExtensionPlan,
) -> Result<Vec<PathBuf>, BuildError> {
    let mut files: BTreeSet<PathBuf> = sources.iter().cloned().collect();
    let mut include_dirs = plan.include_dirs.clone();
    for ext in &plan.extensions {
        files.extend(ext.sources.iter().map(PathBuf::from));
        include_dirs.extend(ext.include_dirs.iter().cloned());
    }
    for dir in include_dirs {
        for rel in stage::find_files(&source_root.join(&dir), None)? {
            files.insert(Path::new(&dir).join(rel));
        }
    }
    Ok(files.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kiln_common::Address;
    use parking_lot::Mutex;

    use crate::task::Task;
    use crate::tool::ToolOutput;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rel).unwrap();
    }

    /// Pretends to be cython and setup.py: writes whatever output the
    /// command line asks for.
    #[derive(Default)]
    struct FakeTools {
        calls: Mutex<Vec<Invocation>>,
        fail: bool,
    }

    impl ToolInvoker for FakeTools {
        fn invoke(&self, inv: &Invocation) -> Result<ToolOutput, BuildError> {
            self.calls.lock().push(inv.clone());
            if self.fail {
                return Err(BuildError::BuildFailed {
                    unit: inv.unit.clone(),
                    exit_code: Some(1),
                    log: "compile error".to_string(),
                });
            }
            if let Some(out) = inv.flag_value("-o") {
                std::fs::write(out, "/* generated */").unwrap();
            }
            if let Some(lib) = inv.flag_value("--build-lib") {
                touch(Path::new(lib), "pkg/fast.cpython-311-x86_64-linux-gnu.so");
            }
            Ok(ToolOutput::default())
        }
    }

    fn unit(root: &Path, task: Task, sources: &[&str], spec: CompileSpec) -> BuildUnit {
        let address = Address::new("src", "fast");
        BuildUnit {
            id: BuildUnit::unit_id(&address, task),
            task,
            address: address.clone(),
            original: address,
            source_root: root.to_path_buf(),
            sources: sources.iter().map(PathBuf::from).collect(),
            options: BTreeMap::new(),
            dependencies: Vec::new(),
            external: BTreeMap::new(),
            spec: UnitSpec::Compile(spec),
            provides: None,
            synthetic_marker: false,
        }
    }

    fn builder(tools: Arc<FakeTools>) -> CompileBuilder {
        CompileBuilder::new(&ToolsConfig::default(), tools)
    }

    #[test]
    fn cythonize_translates_pyx_and_copies_python() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        for f in ["pkg/__init__.py", "pkg/fast.pyx", "pkg/fast.pxd", "pkg/util.py"] {
            touch(src.path(), f);
        }
        let tools = Arc::new(FakeTools::default());
        let u = unit(
            src.path(),
            Task::Cythonize,
            &["pkg/__init__.py", "pkg/fast.pyx", "pkg/fast.pxd", "pkg/util.py"],
            CompileSpec::Cythonize {
                compile_python: false,
            },
        );
        builder(Arc::clone(&tools)).build(&u, ws.path()).unwrap();

        let files = stage::find_files(ws.path(), None).unwrap();
        let files: Vec<_> = files.iter().map(|p| stage::portable(p)).collect();
        assert_eq!(
            files,
            vec!["pkg/__init__.py", "pkg/fast.c", "pkg/fast.pxd", "pkg/util.py"]
        );
        let calls = tools.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[..2], ["-X", "always_allow_keywords=True"]);
    }

    #[test]
    fn compile_python_translates_modules_but_not_init() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        for f in ["pkg/__init__.py", "pkg/util.py"] {
            touch(src.path(), f);
        }
        let tools = Arc::new(FakeTools::default());
        let u = unit(
            src.path(),
            Task::Cythonize,
            &["pkg/__init__.py", "pkg/util.py"],
            CompileSpec::Cythonize {
                compile_python: true,
            },
        );
        builder(Arc::clone(&tools)).build(&u, ws.path()).unwrap();
        assert!(ws.path().join("pkg/util.c").is_file());
        assert!(!ws.path().join("pkg/util.py").exists());
        assert!(ws.path().join("pkg/__init__.py").is_file());
        assert_eq!(tools.calls.lock().len(), 1);
    }

    #[test]
    fn tool_failure_propagates() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        touch(src.path(), "pkg/fast.pyx");
        let tools = Arc::new(FakeTools {
            fail: true,
            ..FakeTools::default()
        });
        let u = unit(
            src.path(),
            Task::Cythonize,
            &["pkg/fast.pyx"],
            CompileSpec::Cythonize {
                compile_python: false,
            },
        );
        let err = builder(tools).build(&u, ws.path()).unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed { .. }));
    }

    #[test]
    fn module_names_follow_packages() {
        let src = tempfile::tempdir().unwrap();
        touch(src.path(), "pkg/__init__.py");
        touch(src.path(), "pkg/sub/fast.c");
        touch(src.path(), "loose/mod.c");
        assert_eq!(
            module_name_for(src.path(), Path::new("pkg/sub/fast.c")),
            "pkg.fast"
        );
        assert_eq!(module_name_for(src.path(), Path::new("loose/mod.c")), "mod");
    }

    #[test]
    fn plan_one_extension_per_source() {
        let src = tempfile::tempdir().unwrap();
        touch(src.path(), "pkg/__init__.py");
        let sources = vec![
            PathBuf::from("pkg/__init__.py"),
            PathBuf::from("pkg/a.c"),
            PathBuf::from("pkg/b.cpp"),
        ];
        let settings = ExtensionSettings {
            libraries: vec!["m".to_string()],
            ..ExtensionSettings::default()
        };
        let plan = plan_extensions(src.path(), &sources, &settings, &[]);
        let names: Vec<_> = plan.extensions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["pkg.a", "pkg.b"]);
        assert!(!plan.deferred);
        assert_eq!(plan.extensions[0].include_dirs, vec!["pkg"]);
        assert_eq!(plan.extensions[0].extra_compile_args, vec!["-Os"]);
        assert_eq!(plan.extensions[1].libraries, vec!["m"]);
    }

    #[test]
    fn plan_with_module_name_collects_sources() {
        let src = tempfile::tempdir().unwrap();
        let sources = vec![PathBuf::from("native/a.c"), PathBuf::from("native/b.c")];
        let settings = ExtensionSettings {
            module_name: Some("_speedups".to_string()),
            ..ExtensionSettings::default()
        };
        let plan = plan_extensions(src.path(), &sources, &settings, &[]);
        assert_eq!(plan.extensions.len(), 1);
        assert_eq!(plan.extensions[0].sources, vec!["native/a.c", "native/b.c"]);
        assert!(plan.deferred);
    }

    #[test]
    fn declared_extensions_win() {
        let src = tempfile::tempdir().unwrap();
        let declared = vec![ExtModule::named("pkg.declared")];
        let plan = plan_extensions(
            src.path(),
            &[PathBuf::from("pkg/a.c")],
            &ExtensionSettings::default(),
            &declared,
        );
        assert_eq!(plan.extensions, declared);
    }

    #[test]
    fn deferred_copy_includes_header_dirs() {
        let src = tempfile::tempdir().unwrap();
        touch(src.path(), "native/a.c");
        touch(src.path(), "native/a.h");
        touch(src.path(), "native/inc/b.h");
        let sources = vec![PathBuf::from("native/a.c")];
        let plan = plan_extensions(src.path(), &sources, &ExtensionSettings::default(), &[]);
        let files = deferred_copy_sources(src.path(), &sources, &plan).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("native/a.c"),
                PathBuf::from("native/a.h"),
                PathBuf::from("native/inc/b.h")
            ]
        );
    }

    #[test]
    fn build_ext_runs_setup_and_copies_python() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        for f in ["pkg/__init__.py", "pkg/fast.c", "pkg/helpers.py"] {
            touch(src.path(), f);
        }
        let sources = ["pkg/__init__.py", "pkg/fast.c", "pkg/helpers.py"];
        let source_paths: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
        let plan = plan_extensions(
            src.path(),
            &source_paths,
            &ExtensionSettings::default(),
            &[],
        );
        let tools = Arc::new(FakeTools::default());
        let u = unit(
            src.path(),
            Task::BuildExt,
            &sources,
            CompileSpec::BuildExt {
                extensions: plan.extensions,
                deferred: false,
                copy_sources: Vec::new(),
            },
        );
        builder(Arc::clone(&tools)).build(&u, ws.path()).unwrap();

        assert!(ws
            .path()
            .join("pkg/fast.cpython-311-x86_64-linux-gnu.so")
            .is_file());
        assert!(ws.path().join("pkg/helpers.py").is_file());
        assert!(ws.path().join("pkg/__init__.py").is_file());
        assert!(!ws.path().join(BUILD_TEMP).exists());
        let calls = tools.calls.lock();
        assert_eq!(calls[0].args[1], "build_ext");
        assert_eq!(calls[0].cwd, src.path());
    }

    /// Fails like a compiler and leaves a file where its build directory
    /// was, so the directory cannot be removed afterwards.
    struct FailsAndLeavesDebris;

    impl ToolInvoker for FailsAndLeavesDebris {
        fn invoke(&self, inv: &Invocation) -> Result<ToolOutput, BuildError> {
            let build_dir = Path::new(inv.flag_value("--build-temp").unwrap()).parent().unwrap();
            std::fs::remove_dir_all(build_dir).unwrap();
            std::fs::write(build_dir, "core dump").unwrap();
            Err(BuildError::BuildFailed {
                unit: inv.unit.clone(),
                exit_code: Some(1),
                log: "fast.c:1: error: expected ';'".to_string(),
            })
        }
    }

    #[test]
    fn build_ext_failure_survives_cleanup_failure() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        touch(src.path(), "pkg/__init__.py");
        touch(src.path(), "pkg/fast.c");
        let u = unit(
            src.path(),
            Task::BuildExt,
            &["pkg/__init__.py", "pkg/fast.c"],
            CompileSpec::BuildExt {
                extensions: vec![ExtModule::named("pkg.fast")],
                deferred: false,
                copy_sources: Vec::new(),
            },
        );
        let builder = CompileBuilder::new(&ToolsConfig::default(), Arc::new(FailsAndLeavesDebris));
        let err = builder.build(&u, ws.path()).unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed { .. }));
        assert_eq!(err.log(), Some("fast.c:1: error: expected ';'"));
    }

    #[test]
    fn deferred_build_ext_only_copies() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        touch(src.path(), "native/a.c");
        let tools = Arc::new(FakeTools::default());
        let u = unit(
            src.path(),
            Task::BuildExt,
            &["native/a.c"],
            CompileSpec::BuildExt {
                extensions: vec![ExtModule::named("a")],
                deferred: true,
                copy_sources: vec![PathBuf::from("native/a.c")],
            },
        );
        let out = builder(Arc::clone(&tools)).build(&u, ws.path()).unwrap();
        assert!(ws.path().join("native/a.c").is_file());
        assert!(tools.calls.lock().is_empty());
        assert_eq!(out.metadata["deferred"], "true");
    }
}
