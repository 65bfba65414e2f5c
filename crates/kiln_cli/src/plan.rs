//! `kiln plan`: fingerprint every unit and report what a build would do.
//!
//! Cached results are grafted so later tasks see them, exactly as in a
//! build. Stale units are reported along with the units that would be built
//! from their results. Nothing is built, published or written to the cache
//! index.

use std::sync::Arc;

use kiln_build::{run_pipeline, Mode, PipelineOptions, ProcessInvoker};

use crate::project::{open, tasks_through};
use crate::{GlobalArgs, PlanArgs};

/// Runs the `kiln plan` command. Returns 1 if any unit could not be
/// fingerprinted.
pub fn run(args: &PlanArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let (mut project, mut cache) = open(global)?;
    let mut options = PipelineOptions::from_config(project.config(), Mode::Plan);
    options.tasks = tasks_through(args.task.as_deref())?;

    if !global.quiet {
        eprintln!(
            "   Planning {} v{}",
            project.config().project.name,
            project.config().project.version
        );
    }

    let report = run_pipeline(&mut project, &mut cache, Arc::new(ProcessInvoker), &options)?;
    print!("{}", report.render_summary());
    Ok(if report.has_failures() { 1 } else { 0 })
}
