//! Kiln CLI: the command-line interface for the kiln build cache.
//!
//! Provides `kiln plan` to see which units would rebuild, `kiln build` to run
//! the task pipeline, `kiln status` to list cached results and `kiln gc` to
//! remove results nothing refers to.

#![warn(missing_docs)]

mod build;
mod gc;
mod logging;
mod plan;
mod project;
mod status;

use std::process;

use clap::{Parser, Subcommand, ValueEnum};

/// Version written into cache indexes and artifact records.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kiln: content-addressed incremental builds for Python projects.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln incremental build cache")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Control colored output.
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Path to the project's `kiln.toml` or its directory.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show which units are cached and which would be built.
    Plan(PlanArgs),
    /// Build every stale unit and graft the results.
    Build(BuildArgs),
    /// List the units recorded in the cache index.
    Status(StatusArgs),
    /// Remove unreferenced results and leftover scratch directories.
    Gc,
}

/// Arguments for the `kiln plan` subcommand.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Stop after this task (cythonize, build-ext, build-wheel,
    /// package-wheel, docker).
    #[arg(long)]
    pub task: Option<String>,
}

/// Arguments for the `kiln build` subcommand.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Number of parallel jobs. Overrides `build.jobs`.
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Stop scheduling new units after the first failure.
    #[arg(long)]
    pub fail_fast: bool,

    /// Stop after this task.
    #[arg(long)]
    pub task: Option<String>,
}

/// Arguments for the `kiln status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

/// Controls whether colored output is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    /// Detect from terminal capabilities.
    Auto,
    /// Always produce colored output.
    Always,
    /// Never produce colored output.
    Never,
}

/// Output format for listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Whether to use colored output.
    pub color: bool,
    /// Optional path to the project configuration.
    pub config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let color = match cli.color {
        ColorChoice::Auto => std::env::var("TERM").is_ok_and(|t| t != "dumb"),
        ColorChoice::Always => true,
        ColorChoice::Never => false,
    };

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        color,
        config: cli.config,
    };
    logging::init(&global);

    let result = match cli.command {
        Command::Plan(ref args) => plan::run(args, &global),
        Command::Build(ref args) => build::run(args, &global),
        Command::Status(ref args) => status::run(args, &global),
        Command::Gc => gc::run(&global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parse_build_default() {
        let cli = Cli::parse_from(["kiln", "build"]);
        match cli.command {
            Command::Build(ref args) => {
                assert!(args.jobs.is_none());
                assert!(!args.fail_fast);
                assert!(args.task.is_none());
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn parse_build_with_args() {
        let cli = Cli::parse_from([
            "kiln",
            "build",
            "--jobs",
            "4",
            "--fail-fast",
            "--task",
            "build-wheel",
        ]);
        match cli.command {
            Command::Build(ref args) => {
                assert_eq!(args.jobs, Some(4));
                assert!(args.fail_fast);
                assert_eq!(args.task.as_deref(), Some("build-wheel"));
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn parse_plan_task() {
        let cli = Cli::parse_from(["kiln", "plan", "--task", "cythonize"]);
        match cli.command {
            Command::Plan(ref args) => assert_eq!(args.task.as_deref(), Some("cythonize")),
            _ => panic!("expected Plan command"),
        }
    }

    #[test]
    fn parse_status_json() {
        let cli = Cli::parse_from(["kiln", "status", "--format", "json"]);
        match cli.command {
            Command::Status(ref args) => assert_eq!(args.format, ReportFormat::Json),
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::parse_from(["kiln", "--quiet", "--color", "never", "gc"]);
        assert!(cli.quiet);
        assert!(!cli.verbose);
        assert_eq!(cli.color, ColorChoice::Never);
        assert!(matches!(cli.command, Command::Gc));
    }

    #[test]
    fn parse_config_path() {
        let cli = Cli::parse_from(["kiln", "--config", "/path/to/kiln.toml", "status"]);
        assert_eq!(cli.config.as_deref(), Some("/path/to/kiln.toml"));
    }
}
