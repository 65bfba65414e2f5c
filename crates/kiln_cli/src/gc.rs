//! `kiln gc`: remove results the index no longer refers to.

use crate::project::open;
use crate::GlobalArgs;

/// Runs the `kiln gc` command.
pub fn run(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let (_, cache) = open(global)?;
    let report = cache.gc()?;
    if !global.quiet {
        eprintln!(
            "   Removed {} results directories and {} scratch directories",
            report.results_removed, report.scratch_removed
        );
    }
    Ok(0)
}
