//! The task pipeline: every task, in order, over one project graph.
//!
//! Each task runs as one batch. Its units are prepared in dependency order
//! and carry the ids of the units they depend on inside the batch, so a
//! consumer's fingerprint covers its dependencies' fingerprints and its
//! build waits for theirs. All builds run first, then results are grafted
//! one by one in dependency order.
//!
//! A planning run grafts nothing new. Units that would pick up a stale
//! unit's results are reported as stale too, with the unit they wait on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kiln_cache::{BuildCache, CacheEntry, FingerprintStore};
use kiln_config::{resolve_jobs, ProjectConfig};
use kiln_graph::{resolve_original, BuildGraph, NodeId};

use crate::builder::Builders;
use crate::error::BuildError;
use crate::package::{publish_wheel, WHEEL_NAME};
use crate::pass::{BuildPass, BuildResults};
use crate::project::Project;
use crate::report::{PassReport, UnitOutcome};
use crate::scheduler::WorkerPool;
use crate::task::Task;
use crate::tool::ToolInvoker;
use crate::unit::BuildUnit;

/// Whether stale units are built or only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fingerprint and graft cached results; report stale units.
    Plan,
    /// Build stale units.
    Build,
}

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Plan or build.
    pub mode: Mode,
    /// Tasks to run. They always run in pipeline order.
    pub tasks: Vec<Task>,
    /// Worker pool size.
    pub jobs: usize,
    /// Stop scheduling after the first failure.
    pub fail_fast: bool,
}

impl PipelineOptions {
    /// All tasks with the configured scheduling settings.
    pub fn from_config(config: &ProjectConfig, mode: Mode) -> Self {
        Self {
            mode,
            tasks: Task::ALL.to_vec(),
            jobs: resolve_jobs(config),
            fail_fast: config.build.fail_fast,
        }
    }
}

/// Runs the pipeline over `project`, using `cache` for results and
/// `invoker` for every external tool.
///
/// Per-unit problems end up in the report. Only structural errors abort.
pub fn run_pipeline(
    project: &mut Project,
    cache: &mut BuildCache,
    invoker: Arc<dyn ToolInvoker>,
    options: &PipelineOptions,
) -> Result<PassReport, BuildError> {
    let store = FingerprintStore::new(cache.kiln_version().to_string());
    let builders = Builders::new(&project.config().tools, invoker);
    let pool = WorkerPool::new(options.jobs, options.fail_fast)?;
    project.begin_pass();

    let mut run = Run {
        mode: options.mode,
        report: PassReport::default(),
        blocked: BTreeSet::new(),
        stale: BTreeMap::new(),
        projected: BTreeMap::new(),
    };

    for task in Task::ALL.into_iter().filter(|t| options.tasks.contains(t)) {
        let _span = tracing::info_span!("task", task = task.name()).entered();
        run.report_projected(project.graph(), task);
        let selected = task.select(project.graph());
        tracing::debug!(units = selected.len(), "selected");

        let units = run.prepare_batch(project, &pool, task, &selected);
        if units.is_empty() {
            continue;
        }
        let batch: Vec<BuildUnit> = units.iter().map(|(_, u)| u.clone()).collect();
        let pass = BuildPass::new(cache, &store, &builders, &pool);
        let mut plan = pass.plan(&batch);
        let mut built = match options.mode {
            Mode::Build if !plan.stale.is_empty() => Some(pass.build(&plan.stale, &batch)?),
            _ => None,
        };

        for (node, unit) in units {
            if let Some(e) = plan.errors.remove(&unit.id) {
                run.fail(&pool, node, task, &unit.id, None, UnitOutcome::Unfingerprintable(e));
                continue;
            }
            let fingerprint = plan.stale.get(&unit.id).copied();
            let entry = match plan.valid.remove(&unit.id) {
                Some(entry) => Some((entry, UnitOutcome::Cached)),
                None => match built.as_mut() {
                    None => {
                        run.mark_stale(project.graph(), task, node, &unit.id);
                        run.report.push(task, &unit.id, fingerprint, UnitOutcome::Stale);
                        continue;
                    }
                    Some(BuildResults {
                        succeeded, failed, ..
                    }) => {
                        if let Some(e) = failed.remove(&unit.id) {
                            run.fail(&pool, node, task, &unit.id, fingerprint, UnitOutcome::Failed(e));
                            continue;
                        }
                        succeeded.remove(&unit.id).map(|entry| (entry, UnitOutcome::Built))
                    }
                },
            };
            let reason = blocker(project.graph(), node, &run.blocked)
                .map(|b| format!("{b} has no results"));
            match (entry, reason) {
                (Some((entry, outcome)), None) => {
                    run.finish(project, cache, &pool, task, node, &unit, entry, outcome)
                }
                (_, reason) => {
                    let reason =
                        reason.unwrap_or_else(|| "stopped after an earlier failure".to_string());
                    run.blocked.insert(node);
                    run.report
                        .push(task, &unit.id, fingerprint, UnitOutcome::Skipped(reason));
                }
            }
        }
    }

    if options.mode == Mode::Build {
        cache.save()?;
    }
    Ok(run.report)
}

struct Run {
    mode: Mode,
    report: PassReport,
    /// Nodes whose unit did not produce grafted results this pass.
    blocked: BTreeSet<NodeId>,
    /// Nodes with a stale unit in a planning run, with that unit's id.
    stale: BTreeMap<NodeId, String>,
    /// Units a later task would build from a stale unit's results: the
    /// node they derive from and the unit they wait on.
    projected: BTreeMap<Task, Vec<(NodeId, String)>>,
}

impl Run {
    /// Prepares the units for `selected`, dependencies first, and fills in
    /// each unit's dependencies on other units of the batch.
    fn prepare_batch(
        &mut self,
        project: &mut Project,
        pool: &WorkerPool,
        task: Task,
        selected: &[NodeId],
    ) -> Vec<(NodeId, BuildUnit)> {
        let deps = batch_dependencies(project.graph(), selected);
        let mut units: Vec<(NodeId, BuildUnit)> = Vec::new();
        let mut unit_of: BTreeMap<NodeId, String> = BTreeMap::new();
        for node in waves(project.graph(), selected).into_iter().flatten() {
            let id = task.unit_id_for(project.graph(), node);
            if self.report.outcome(&id).is_some() {
                continue;
            }
            if pool.stopped() {
                tracing::warn!(unit = %id, "skipping after an earlier failure");
                self.skip(node, task, id, "stopped after an earlier failure".to_string());
                continue;
            }
            if let Some(blocker) = blocker(project.graph(), node, &self.blocked) {
                let reason = format!("{blocker} has no results");
                tracing::warn!(unit = %id, %reason, "skipping");
                self.skip(node, task, id, reason);
                continue;
            }
            if let Some(upstream) = stale_upstream(project.graph(), node, &self.stale) {
                tracing::debug!(unit = %id, %upstream, "stale upstream");
                self.mark_stale(project.graph(), task, node, &id);
                self.report
                    .push(task, id, None, UnitOutcome::StaleUpstream(upstream));
                continue;
            }
            if unit_of.values().any(|u| *u == id) {
                unit_of.insert(node, id);
                continue;
            }
            match task.prepare(project, node) {
                Ok(unit) => {
                    unit_of.insert(node, id);
                    units.push((node, unit));
                }
                Err(e) => self.fail(pool, node, task, &id, None, UnitOutcome::Failed(e)),
            }
        }

        for (node, unit) in &mut units {
            let mut ids: Vec<String> = deps
                .get(node)
                .into_iter()
                .flatten()
                .filter_map(|d| unit_of.get(d))
                .filter(|d| **d != unit.id)
                .cloned()
                .collect();
            ids.sort();
            ids.dedup();
            unit.dependencies = ids;
        }
        units
    }

    fn skip(&mut self, node: NodeId, task: Task, unit: String, reason: String) {
        self.blocked.insert(node);
        self.report.push(task, unit, None, UnitOutcome::Skipped(reason));
    }

    fn fail(
        &mut self,
        pool: &WorkerPool,
        node: NodeId,
        task: Task,
        unit: &str,
        fingerprint: Option<kiln_cache::Fingerprint>,
        outcome: UnitOutcome,
    ) {
        tracing::warn!(unit, outcome = outcome.label(), "unit did not produce results");
        pool.note_failure();
        self.blocked.insert(node);
        self.report.push(task, unit, fingerprint, outcome);
    }

    /// Records that `node`'s unit is stale and queues the unit the next
    /// task would build from its results.
    fn mark_stale(&mut self, graph: &BuildGraph, task: Task, node: NodeId, unit: &str) {
        self.stale.insert(node, unit.to_string());
        let exported = graph.node(node).is_some_and(|n| n.provides.is_some());
        if let Some(next) = task.picked_up_by(exported) {
            self.projected
                .entry(next)
                .or_default()
                .push((node, unit.to_string()));
        }
    }

    /// Reports the units `task` would build from stale results of earlier
    /// tasks.
    fn report_projected(&mut self, graph: &BuildGraph, task: Task) {
        for (node, upstream) in self.projected.remove(&task).unwrap_or_default() {
            let id = task.unit_id_for(graph, node);
            if self.report.outcome(&id).is_some() {
                continue;
            }
            self.mark_stale(graph, task, node, &id);
            self.report
                .push(task, id, None, UnitOutcome::StaleUpstream(upstream));
        }
    }

    /// Grafts a unit's results and records the outcome.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        project: &mut Project,
        cache: &mut BuildCache,
        pool: &WorkerPool,
        task: Task,
        node: NodeId,
        unit: &BuildUnit,
        entry: CacheEntry,
        outcome: UnitOutcome,
    ) {
        let fingerprint = Some(entry.fingerprint);
        match self.graft(project, cache, task, unit, &entry) {
            Ok(()) => self.report.push(task, &unit.id, fingerprint, outcome),
            Err(e) => self.fail(pool, node, task, &unit.id, fingerprint, UnitOutcome::Failed(e)),
        }
    }

    fn graft(
        &mut self,
        project: &mut Project,
        cache: &mut BuildCache,
        task: Task,
        unit: &BuildUnit,
        entry: &CacheEntry,
    ) -> Result<(), BuildError> {
        let request = task.graft_request(project, unit, entry)?;
        let outcome = project.graft(request)?;
        cache.record_valid(&unit.id, task.name(), &entry.results_dir)?;
        tracing::info!(
            unit = %unit.id,
            consumers = outcome.consumers_rewired,
            dirtied = outcome.nodes_dirtied,
            "grafted"
        );

        if task == Task::PackageWheel && self.mode == Mode::Build {
            if let Some(wheel_name) = entry.record.metadata.get(WHEEL_NAME) {
                let published = publish_wheel(&entry.results_dir, wheel_name, &project.dist_dir())?;
                self.report.published.push(published);
            }
        }
        Ok(())
    }
}

/// Nodes `node` depends on, directly, transitively or through the node it
/// was derived from. Includes `node` itself.
fn upstream(graph: &BuildGraph, node: NodeId) -> impl Iterator<Item = NodeId> {
    let original = resolve_original(graph, node);
    graph
        .transitive_dependencies(node)
        .into_iter()
        .chain(graph.transitive_dependencies(original))
}

/// The first blocked node upstream of `node`. A blocked node blocks itself.
fn blocker(graph: &BuildGraph, node: NodeId, blocked: &BTreeSet<NodeId>) -> Option<String> {
    if blocked.is_empty() {
        return None;
    }
    upstream(graph, node)
        .find(|n| blocked.contains(n))
        .and_then(|n| graph.node(n))
        .map(|n| n.address.to_string())
}

/// The id of the first stale unit upstream of `node`.
fn stale_upstream(
    graph: &BuildGraph,
    node: NodeId,
    stale: &BTreeMap<NodeId, String>,
) -> Option<String> {
    if stale.is_empty() {
        return None;
    }
    upstream(graph, node).find_map(|n| stale.get(&n).cloned())
}

/// For each selected node, the other selected nodes upstream of it.
fn batch_dependencies(graph: &BuildGraph, selected: &[NodeId]) -> BTreeMap<NodeId, Vec<NodeId>> {
    let set: BTreeSet<NodeId> = selected.iter().copied().collect();
    selected
        .iter()
        .map(|&n| {
            let mut d: Vec<NodeId> = upstream(graph, n)
                .filter(|x| *x != n && set.contains(x))
                .collect();
            d.sort();
            d.dedup();
            (n, d)
        })
        .collect()
}

/// Splits `selected` into waves: a node lands one wave after the last
/// selected node it depends on. Order within a wave follows `selected`.
fn waves(graph: &BuildGraph, selected: &[NodeId]) -> Vec<Vec<NodeId>> {
    let deps = batch_dependencies(graph, selected);

    fn level(
        n: NodeId,
        deps: &BTreeMap<NodeId, Vec<NodeId>>,
        memo: &mut BTreeMap<NodeId, usize>,
    ) -> usize {
        if let Some(l) = memo.get(&n) {
            return *l;
        }
        memo.insert(n, 0);
        let l = deps
            .get(&n)
            .map(|ds| ds.iter().map(|d| level(*d, deps, memo) + 1).max().unwrap_or(0))
            .unwrap_or(0);
        memo.insert(n, l);
        l
    }

    let mut memo = BTreeMap::new();
    let mut out: Vec<Vec<NodeId>> = Vec::new();
    for &n in selected {
        let l = level(n, &deps, &mut memo);
        if out.len() <= l {
            out.resize_with(l + 1, Vec::new);
        }
        out[l].push(n);
    }
    out.retain(|w| !w.is_empty());
    out
}
