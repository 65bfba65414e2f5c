//! `kiln build`: run the task pipeline and publish distributions.

use std::sync::Arc;

use kiln_build::{run_pipeline, Mode, PipelineOptions, ProcessInvoker};

use crate::project::{open, tasks_through};
use crate::{BuildArgs, GlobalArgs};

/// Runs the `kiln build` command.
///
/// Returns exit code 0 if every unit was cached or built, 1 otherwise.
pub fn run(args: &BuildArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let (mut project, mut cache) = open(global)?;

    let mut options = PipelineOptions::from_config(project.config(), Mode::Build);
    options.tasks = tasks_through(args.task.as_deref())?;
    if let Some(jobs) = args.jobs {
        options.jobs = jobs;
    }
    options.fail_fast |= args.fail_fast;

    if !global.quiet {
        eprintln!(
            "   Building {} v{} ({} jobs)",
            project.config().project.name,
            project.config().project.version,
            options.jobs.max(1)
        );
    }

    let report = run_pipeline(&mut project, &mut cache, Arc::new(ProcessInvoker), &options)?;

    if !global.quiet || report.has_failures() {
        print!("{}", report.render_summary());
    }
    if !global.quiet {
        for path in &report.published {
            eprintln!("   Published {}", path.display());
        }
    }
    Ok(if report.has_failures() { 1 } else { 0 })
}
