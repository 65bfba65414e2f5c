//! Tracing subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::GlobalArgs;

/// Default filter directive for the given flags. `RUST_LOG` overrides it.
fn default_directive(global: &GlobalArgs) -> &'static str {
    if global.verbose {
        "debug"
    } else if global.quiet {
        "error"
    } else {
        "info"
    }
}

/// Installs a stderr `fmt` layer filtered by `RUST_LOG` or the flags.
pub fn init(global: &GlobalArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(global)));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(global.color)
        .with_target(false);
    // A subscriber may already be installed when running under a harness.
    let _ = tracing_subscriber::registry().with(layer).with(filter).try_init();
}
