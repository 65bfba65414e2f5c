//! Per-unit outcomes of a pass and the summary shown to the user.

use std::fmt::Write as _;
use std::path::PathBuf;

use kiln_cache::{CacheError, Fingerprint};

use crate::error::BuildError;
use crate::task::Task;

/// What happened to one unit.
#[derive(Debug)]
pub enum UnitOutcome {
    /// Results were already in the cache and were grafted.
    Cached,
    /// Built, committed and grafted.
    Built,
    /// Needs a build; reported by planning runs only.
    Stale,
    /// Would be built from results of the named stale unit; reported by
    /// planning runs only.
    StaleUpstream(String),
    /// Preparing, building or grafting failed.
    Failed(BuildError),
    /// Not attempted.
    Skipped(String),
    /// The unit's inputs could not be fingerprinted.
    Unfingerprintable(CacheError),
}

impl UnitOutcome {
    /// Short label used in summaries.
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Cached => "cached",
            UnitOutcome::Built => "built",
            UnitOutcome::Stale | UnitOutcome::StaleUpstream(_) => "stale",
            UnitOutcome::Failed(_) => "failed",
            UnitOutcome::Skipped(_) => "skipped",
            UnitOutcome::Unfingerprintable(_) => "error",
        }
    }

    /// Returns `true` for outcomes that make a pass unsuccessful.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::Failed(_) | UnitOutcome::Unfingerprintable(_)
        )
    }
}

/// One line of the report.
#[derive(Debug)]
pub struct UnitReport {
    /// The task the unit belongs to.
    pub task: Task,
    /// Unit id.
    pub unit: String,
    /// Fingerprint, when one could be computed.
    pub fingerprint: Option<Fingerprint>,
    /// Outcome.
    pub outcome: UnitOutcome,
}

/// Everything a pass did, in the order it happened.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Per-unit outcomes.
    pub units: Vec<UnitReport>,
    /// Distribution files copied into the dist directory.
    pub published: Vec<PathBuf>,
}

impl PassReport {
    /// Appends an outcome.
    pub fn push(
        &mut self,
        task: Task,
        unit: impl Into<String>,
        fingerprint: Option<Fingerprint>,
        outcome: UnitOutcome,
    ) {
        self.units.push(UnitReport {
            task,
            unit: unit.into(),
            fingerprint,
            outcome,
        });
    }

    /// Returns `true` if any unit failed.
    pub fn has_failures(&self) -> bool {
        self.units.iter().any(|u| u.outcome.is_failure())
    }

    /// Number of units whose outcome has `label`.
    pub fn count(&self, label: &str) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome.label() == label)
            .count()
    }

    /// The outcome of `unit`, if it was part of the pass.
    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|u| u.unit == unit)
            .map(|u| &u.outcome)
    }

    /// Renders the summary: one line per unit, totals, then the error and
    /// captured log of every failure.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        for unit in &self.units {
            let fingerprint = unit
                .fingerprint
                .map(|f| f.to_string()[..12].to_string())
                .unwrap_or_else(|| "-".repeat(12));
            let _ = writeln!(
                out,
                "{:>8}  {fingerprint}  {}",
                unit.outcome.label(),
                unit.unit
            );
        }

        let _ = writeln!(
            out,
            "\n{} built, {} cached, {} stale, {} failed, {} skipped",
            self.count("built"),
            self.count("cached"),
            self.count("stale"),
            self.count("failed") + self.count("error"),
            self.count("skipped"),
        );

        for unit in &self.units {
            match &unit.outcome {
                UnitOutcome::Failed(e) => {
                    let _ = writeln!(out, "\nfailure: {}: {e}", unit.unit);
                    if let Some(log) = e.log().filter(|l| !l.trim().is_empty()) {
                        for line in log.lines() {
                            let _ = writeln!(out, "    {line}");
                        }
                    }
                }
                UnitOutcome::Unfingerprintable(e) => {
                    let _ = writeln!(out, "\nfailure: {}: {e}", unit.unit);
                }
                UnitOutcome::Skipped(reason) => {
                    let _ = writeln!(out, "\nskipped: {}: {reason}", unit.unit);
                }
                UnitOutcome::StaleUpstream(upstream) => {
                    let _ = writeln!(out, "\nstale: {}: waits on {upstream}", unit.unit);
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::ContentHash;

    fn report() -> PassReport {
        let fp = Fingerprint::from_hash(ContentHash::from_bytes(b"x"));
        let mut report = PassReport::default();
        report.push(Task::Cythonize, "src:a#cythonize", Some(fp), UnitOutcome::Cached);
        report.push(Task::Cythonize, "src:b#cythonize", Some(fp), UnitOutcome::Built);
        report.push(
            Task::BuildExt,
            "src:b#build-ext",
            Some(fp),
            UnitOutcome::Failed(BuildError::BuildFailed {
                unit: "src:b#build-ext".to_string(),
                exit_code: Some(1),
                log: "fast.c:1: error: expected ';'\n".to_string(),
            }),
        );
        report.push(
            Task::BuildWheel,
            "src:b#build-wheel",
            None,
            UnitOutcome::Skipped("src:b did not build".to_string()),
        );
        report
    }

    #[test]
    fn counts_and_failures() {
        let report = report();
        assert!(report.has_failures());
        assert_eq!(report.count("cached"), 1);
        assert_eq!(report.count("built"), 1);
        assert_eq!(report.count("skipped"), 1);
        assert!(matches!(
            report.outcome("src:a#cythonize"),
            Some(UnitOutcome::Cached)
        ));
    }

    #[test]
    fn summary_includes_failure_logs() {
        let summary = report().render_summary();
        assert!(summary.contains("1 built, 1 cached, 0 stale, 1 failed, 1 skipped"));
        assert!(summary.contains("failure: src:b#build-ext: build of src:b#build-ext failed with exit code 1"));
        assert!(summary.contains("    fast.c:1: error: expected ';'"));
        assert!(summary.contains("skipped: src:b#build-wheel: src:b did not build"));
    }

    #[test]
    fn stale_upstream_counts_as_stale() {
        let mut report = PassReport::default();
        report.push(Task::Cythonize, "src:a#cythonize", None, UnitOutcome::Stale);
        report.push(
            Task::BuildExt,
            "src:a#build-ext",
            None,
            UnitOutcome::StaleUpstream("src:a#cythonize".to_string()),
        );
        assert!(!report.has_failures());
        assert_eq!(report.count("stale"), 2);
        let summary = report.render_summary();
        assert!(summary.contains("0 built, 0 cached, 2 stale, 0 failed, 0 skipped"));
        assert!(summary.contains("stale: src:a#build-ext: waits on src:a#cythonize"));
    }

    #[test]
    fn clean_pass_has_no_failures() {
        let mut report = PassReport::default();
        report.push(Task::Docker, "docker:app#docker", None, UnitOutcome::Stale);
        assert!(!report.has_failures());
    }
}
