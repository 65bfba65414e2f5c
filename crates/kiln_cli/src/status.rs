//! `kiln status`: list the cache index.

use kiln_cache::BuildCache;

use crate::project::open;
use crate::{GlobalArgs, ReportFormat, StatusArgs};

/// Runs the `kiln status` command.
pub fn run(args: &StatusArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let (_, cache) = open(global)?;

    match args.format {
        ReportFormat::Json => {
            println!("{}", serde_json::to_string_pretty(cache.manifest())?);
        }
        ReportFormat::Text => print!("{}", render(&cache)),
    }
    Ok(0)
}

/// One line per indexed unit, with whether its results are still intact.
fn render(cache: &BuildCache) -> String {
    let manifest = cache.manifest();
    if manifest.units.is_empty() {
        return format!("cache at {} is empty\n", cache.root().display());
    }
    let mut out = String::new();
    for (unit, entry) in &manifest.units {
        let state = if cache.is_valid(&entry.fingerprint) {
            "valid"
        } else {
            "missing"
        };
        let marker = if entry.synthetic_marker { "  (placeholder)" } else { "" };
        let fingerprint = entry.fingerprint.to_string();
        out.push_str(&format!(
            "{state:>8}  {:<13}  {}  {unit}  {} files{marker}\n",
            entry.task,
            &fingerprint[..12],
            entry.files.len(),
        ));
    }
    out
}
