//! Incremental behaviour of whole passes: cache hits, invalidation, failure
//! isolation and grafting, against a scripted tool invoker.

use std::path::Path;
use std::sync::Arc;

use kiln_build::{
    run_pipeline, BuildError, Invocation, Mode, PipelineOptions, Project, Task, ToolInvoker,
    ToolOutput, UnitOutcome,
};
use kiln_cache::{BuildCache, CacheError};
use kiln_common::Address;
use kiln_graph::derived_from;
use parking_lot::Mutex;

const CONFIG: &str = r#"
[project]
name = "demo"
version = "0.1.0"

[targets."src/pkg:fast"]
kind = "cython_library"
sources = ["src/pkg/__init__.py", "src/pkg/fast.pyx"]
base = "src"

[targets."src/other:slow"]
kind = "cython_library"
sources = ["src/other/__init__.py", "src/other/slow.pyx"]
base = "src"
"#;

const FAST: &str = "src/pkg:fast#cythonize";
const SLOW: &str = "src/other:slow#cythonize";

/// Stands in for cython: writes the `-o` file from the source, or fails
/// when the source contains `syntax error`.
#[derive(Default)]
struct FakeCython {
    calls: Mutex<Vec<Invocation>>,
}

impl FakeCython {
    fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ToolInvoker for FakeCython {
    fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput, BuildError> {
        self.calls.lock().push(invocation.clone());
        let source = invocation.args.last().cloned().unwrap_or_default();
        let content = std::fs::read_to_string(&source).unwrap();
        if content.contains("syntax error") {
            return Err(BuildError::BuildFailed {
                unit: invocation.unit.clone(),
                exit_code: Some(1),
                log: format!("{source}:1:0: syntax error\n"),
            });
        }
        let dest = invocation.flag_value("-o").unwrap();
        std::fs::write(dest, format!("/* from {source} */\n{content}")).unwrap();
        Ok(ToolOutput::default())
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn setup(root: &Path) {
    write(root, "kiln.toml", CONFIG);
    write(root, "src/pkg/__init__.py", "");
    write(root, "src/pkg/fast.pyx", "def fast(): return 1\n");
    write(root, "src/other/__init__.py", "");
    write(root, "src/other/slow.pyx", "def slow(): return 2\n");
}

fn options(mode: Mode) -> PipelineOptions {
    PipelineOptions {
        mode,
        tasks: vec![Task::Cythonize],
        jobs: 2,
        fail_fast: false,
    }
}

/// Loads the project and runs one pass.
fn pass(root: &Path, tools: &Arc<FakeCython>, mode: Mode) -> (Project, BuildCache, kiln_build::PassReport) {
    let mut project = Project::load(root).unwrap();
    let mut cache = BuildCache::load_or_create(&project.cache_root(), "test");
    let report = run_pipeline(&mut project, &mut cache, tools.clone(), &options(mode)).unwrap();
    (project, cache, report)
}

fn fingerprint(report: &kiln_build::PassReport, unit: &str) -> String {
    report
        .units
        .iter()
        .find(|u| u.unit == unit)
        .and_then(|u| u.fingerprint)
        .map(|f| f.to_string())
        .unwrap()
}

#[test]
fn second_pass_is_served_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());

    let (_, _, first) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(first.outcome(FAST), Some(UnitOutcome::Built)));
    assert!(matches!(first.outcome(SLOW), Some(UnitOutcome::Built)));
    assert_eq!(tools.calls(), 2);

    let (_, _, second) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(second.outcome(FAST), Some(UnitOutcome::Cached)));
    assert!(matches!(second.outcome(SLOW), Some(UnitOutcome::Cached)));
    assert_eq!(tools.calls(), 2);
    assert_eq!(fingerprint(&first, FAST), fingerprint(&second, FAST));
}

#[test]
fn source_change_rebuilds_only_the_changed_unit() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());
    let (_, _, first) = pass(dir.path(), &tools, Mode::Build);

    write(dir.path(), "src/pkg/fast.pyx", "def fast(): return 10\n");
    let (_, _, second) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(second.outcome(FAST), Some(UnitOutcome::Built)));
    assert!(matches!(second.outcome(SLOW), Some(UnitOutcome::Cached)));
    assert_ne!(fingerprint(&first, FAST), fingerprint(&second, FAST));
    assert_eq!(tools.calls(), 3);
}

#[test]
fn option_change_makes_units_stale() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());
    pass(dir.path(), &tools, Mode::Build);

    write(
        dir.path(),
        "kiln.toml",
        &format!("{CONFIG}\n[options.cythonize]\ncompile_python = true\n"),
    );
    let (_, _, plan) = pass(dir.path(), &tools, Mode::Plan);
    assert!(matches!(plan.outcome(FAST), Some(UnitOutcome::Stale)));
    assert!(matches!(plan.outcome(SLOW), Some(UnitOutcome::Stale)));
    assert_eq!(tools.calls(), 2);
}

#[test]
fn failed_build_commits_nothing_and_stays_stale() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write(dir.path(), "src/pkg/fast.pyx", "def fast(: syntax error\n");
    let tools = Arc::new(FakeCython::default());

    let (_, cache, report) = pass(dir.path(), &tools, Mode::Build);
    assert!(report.has_failures());
    match report.outcome(FAST) {
        Some(UnitOutcome::Failed(e)) => assert!(e.log().unwrap().contains("syntax error")),
        other => panic!("expected a failure, got {other:?}"),
    }
    assert!(matches!(report.outcome(SLOW), Some(UnitOutcome::Built)));
    assert_eq!(cache.workspace().committed().unwrap().len(), 1);
    assert!(!cache.manifest().units.contains_key(FAST));

    let (_, _, plan) = pass(dir.path(), &tools, Mode::Plan);
    assert!(matches!(plan.outcome(FAST), Some(UnitOutcome::Stale)));
    assert!(matches!(plan.outcome(SLOW), Some(UnitOutcome::Cached)));
}

#[test]
fn grafted_node_lists_exactly_the_committed_files() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());
    let (project, cache, _) = pass(dir.path(), &tools, Mode::Build);

    let graph = project.graph();
    let original = graph.lookup(&Address::new("src/pkg", "fast")).unwrap();
    let derived = derived_from(graph, original);
    assert_eq!(derived.len(), 1);
    let node = graph.node(derived[0]).unwrap();
    assert_eq!(
        node.sources,
        vec![
            std::path::PathBuf::from("pkg/__init__.py"),
            std::path::PathBuf::from("pkg/fast.c"),
        ]
    );
    assert!(node.source_root.starts_with(cache.root()));
    for file in node.source_paths() {
        assert!(file.is_file(), "{} missing", file.display());
    }

    let entry = &cache.manifest().units[FAST];
    assert_eq!(entry.task, "cythonize");
    assert_eq!(entry.files, vec!["pkg/__init__.py", "pkg/fast.c"]);
}

#[test]
fn units_build_in_isolated_directories() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());
    let (_, cache, _) = pass(dir.path(), &tools, Mode::Build);

    let fast = &cache.manifest().units[FAST];
    let slow = &cache.manifest().units[SLOW];
    assert_ne!(fast.fingerprint, slow.fingerprint);
    assert!(fast.files.iter().all(|f| f.starts_with("pkg/")));
    assert!(slow.files.iter().all(|f| f.starts_with("other/")));
}

#[test]
fn repeated_passes_on_one_project_regraft_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    let tools = Arc::new(FakeCython::default());
    let mut project = Project::load(dir.path()).unwrap();
    let mut cache = BuildCache::load_or_create(&project.cache_root(), "test");

    run_pipeline(&mut project, &mut cache, tools.clone(), &options(Mode::Build)).unwrap();
    let nodes = project.graph().len();
    let report = run_pipeline(&mut project, &mut cache, tools.clone(), &options(Mode::Build)).unwrap();
    assert!(!report.has_failures());
    assert_eq!(project.graph().len(), nodes);
    assert_eq!(tools.calls(), 2);
}

/// Makes `fast` depend on `slow`.
fn write_dependent_config(root: &Path) {
    let config = CONFIG.replace(
        "sources = [\"src/pkg/__init__.py\", \"src/pkg/fast.pyx\"]\n",
        "sources = [\"src/pkg/__init__.py\", \"src/pkg/fast.pyx\"]\ndependencies = [\"src/other:slow\"]\n",
    );
    assert_ne!(config, CONFIG);
    write(root, "kiln.toml", &config);
}

fn position(report: &kiln_build::PassReport, unit: &str) -> usize {
    report.units.iter().position(|u| u.unit == unit).unwrap()
}

#[test]
fn dependency_change_invalidates_dependent_units() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_dependent_config(dir.path());
    let tools = Arc::new(FakeCython::default());

    let (_, _, first) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(first.outcome(SLOW), Some(UnitOutcome::Built)));
    assert!(matches!(first.outcome(FAST), Some(UnitOutcome::Built)));
    assert!(position(&first, SLOW) < position(&first, FAST));

    write(dir.path(), "src/other/slow.pyx", "def slow(): return 20\n");
    let (_, _, second) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(second.outcome(SLOW), Some(UnitOutcome::Built)));
    assert!(matches!(second.outcome(FAST), Some(UnitOutcome::Built)));
    assert_ne!(fingerprint(&first, FAST), fingerprint(&second, FAST));
    assert_eq!(tools.calls(), 4);
}

#[test]
fn dependent_units_wait_and_skip_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_dependent_config(dir.path());
    write(dir.path(), "src/other/slow.pyx", "def slow(: syntax error\n");
    let tools = Arc::new(FakeCython::default());

    let (_, cache, report) = pass(dir.path(), &tools, Mode::Build);
    assert!(matches!(report.outcome(SLOW), Some(UnitOutcome::Failed(_))));
    match report.outcome(FAST) {
        Some(UnitOutcome::Skipped(reason)) => assert!(reason.contains("src/other:slow"), "{reason}"),
        other => panic!("expected a skip, got {other:?}"),
    }
    assert_eq!(tools.calls(), 1);
    assert!(cache.workspace().committed().unwrap().is_empty());
}

#[test]
fn unfingerprintable_dependency_fails_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_dependent_config(dir.path());
    std::fs::remove_file(dir.path().join("src/other/slow.pyx")).unwrap();
    let tools = Arc::new(FakeCython::default());

    let (_, _, report) = pass(dir.path(), &tools, Mode::Plan);
    assert!(matches!(
        report.outcome(SLOW),
        Some(UnitOutcome::Unfingerprintable(CacheError::MissingSource { .. }))
    ));
    match report.outcome(FAST) {
        Some(UnitOutcome::Unfingerprintable(CacheError::UpstreamUnavailable { dependency, .. })) => {
            assert_eq!(dependency, SLOW)
        }
        other => panic!("expected an upstream error, got {other:?}"),
    }
    assert_eq!(tools.calls(), 0);
}
