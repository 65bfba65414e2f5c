//! Planning and building one batch of units against the cache.
//!
//! [`BuildPass::plan`] splits a batch into units with valid cached results
//! and stale units. [`BuildPass::build`] builds the stale ones on the worker
//! pool, each in its own scratch directory, in waves that respect unit
//! dependencies inside the batch. Grafting the results is left to the
//! caller, which owns the graph.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use kiln_cache::{BuildCache, CacheEntry, CacheError, Fingerprint, FingerprintInput, FingerprintStore};

use crate::builder::Builders;
use crate::error::BuildError;
use crate::scheduler::{JobResult, WorkerPool};
use crate::unit::BuildUnit;

/// How a batch of units relates to the cache.
#[derive(Debug, Default)]
pub struct Plan {
    /// Units whose results are already committed, by unit id.
    pub valid: BTreeMap<String, CacheEntry>,
    /// Units that must be built, with the fingerprint they will be stored
    /// under.
    pub stale: BTreeMap<String, Fingerprint>,
    /// Units that could not be fingerprinted.
    pub errors: BTreeMap<String, CacheError>,
}

/// Outcome of [`BuildPass::build`].
#[derive(Debug, Default)]
pub struct BuildResults {
    /// Committed results, by unit id.
    pub succeeded: BTreeMap<String, CacheEntry>,
    /// Failed units with the reason.
    pub failed: BTreeMap<String, BuildError>,
    /// Units that were not started, because a dependency failed or the pool
    /// stopped.
    pub skipped: Vec<String>,
}

/// Plans and builds units against one cache.
#[derive(Debug)]
pub struct BuildPass<'a> {
    cache: &'a BuildCache,
    store: &'a FingerprintStore,
    builders: &'a Builders,
    pool: &'a WorkerPool,
}

impl<'a> BuildPass<'a> {
    /// Creates a pass over the given collaborators.
    pub fn new(
        cache: &'a BuildCache,
        store: &'a FingerprintStore,
        builders: &'a Builders,
        pool: &'a WorkerPool,
    ) -> Self {
        Self {
            cache,
            store,
            builders,
            pool,
        }
    }

    /// Fingerprints `units` and checks each fingerprint against the cache.
    pub fn plan(&self, units: &[BuildUnit]) -> Plan {
        let inputs: Vec<FingerprintInput> = units.iter().map(BuildUnit::fingerprint_input).collect();
        let mut plan = Plan::default();
        for (id, result) in self.store.fingerprint_all(&inputs) {
            match result {
                Ok(fingerprint) => match self.cache.lookup(&fingerprint) {
                    Some(entry) => {
                        tracing::debug!(unit = %id, %fingerprint, "cache hit");
                        plan.valid.insert(id, entry);
                    }
                    None => {
                        tracing::debug!(unit = %id, %fingerprint, "cache miss");
                        plan.stale.insert(id, fingerprint);
                    }
                },
                Err(e) => {
                    tracing::debug!(unit = %id, error = %e, "cannot fingerprint");
                    plan.errors.insert(id, e);
                }
            }
        }
        plan
    }

    /// Builds every unit named in `stale`.
    ///
    /// Per-unit failures are collected in the results. A structural error
    /// (two builds claiming the same fingerprint) aborts the whole batch.
    pub fn build(
        &self,
        stale: &BTreeMap<String, Fingerprint>,
        units: &[BuildUnit],
    ) -> Result<BuildResults, BuildError> {
        let mut pending: Vec<(&BuildUnit, Fingerprint)> = Vec::new();
        let mut seen = BTreeSet::new();
        for unit in units {
            if let Some(fingerprint) = stale.get(&unit.id) {
                if seen.insert(unit.id.as_str()) {
                    pending.push((unit, *fingerprint));
                }
            }
        }

        let mut results = BuildResults::default();
        let mut unfinished: HashSet<&str> = pending.iter().map(|(u, _)| u.id.as_str()).collect();

        while !pending.is_empty() {
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(unit, _)| {
                unit.dependencies
                    .iter()
                    .all(|d| !unfinished.contains(d.as_str()))
            });
            pending = waiting;
            if ready.is_empty() {
                // Only reachable with a dependency cycle, which fingerprinting
                // already rejects.
                results
                    .skipped
                    .extend(pending.drain(..).map(|(unit, _)| unit.id.clone()));
                break;
            }

            let (runnable, blocked): (Vec<_>, Vec<_>) = ready.into_iter().partition(|(unit, _)| {
                unit.dependencies
                    .iter()
                    .all(|d| !results.failed.contains_key(d) && !results.skipped.contains(d))
            });
            for (unit, _) in blocked {
                tracing::warn!(unit = %unit.id, "skipping: a dependency did not build");
                results.skipped.push(unit.id.clone());
                unfinished.remove(unit.id.as_str());
            }

            let outcomes = self
                .pool
                .run(&runnable, |(unit, fingerprint)| self.build_one(unit, *fingerprint));
            for ((unit, _), outcome) in runnable.iter().zip(outcomes) {
                unfinished.remove(unit.id.as_str());
                match outcome {
                    JobResult::Done(Ok(entry)) => {
                        results.succeeded.insert(unit.id.clone(), entry);
                    }
                    JobResult::Done(Err(e)) if e.is_structural() => return Err(e),
                    JobResult::Done(Err(e)) => {
                        tracing::warn!(unit = %unit.id, error = %e, "build failed");
                        results.failed.insert(unit.id.clone(), e);
                    }
                    JobResult::Skipped => {
                        tracing::warn!(unit = %unit.id, "skipping after an earlier failure");
                        results.skipped.push(unit.id.clone());
                    }
                }
            }
        }
        Ok(results)
    }

    fn build_one(&self, unit: &BuildUnit, fingerprint: Fingerprint) -> Result<CacheEntry, BuildError> {
        let scratch = self.cache.workspace().acquire(fingerprint)?;
        match self.builders.build(unit, scratch.path()) {
            Ok(output) => {
                let entry = self
                    .cache
                    .store(scratch, &unit.id, unit.synthetic_marker, output.metadata)?;
                tracing::info!(unit = %unit.id, %fingerprint, files = entry.record.files.len(), "built");
                Ok(entry)
            }
            Err(e) => {
                if let Err(discard) = scratch.discard() {
                    tracing::warn!(unit = %unit.id, error = %discard, "could not discard scratch directory");
                }
                Err(e)
            }
        }
    }
}
