//! Error types for building units.

use std::path::PathBuf;

use kiln_cache::CacheError;
use kiln_config::ConfigError;
use kiln_graph::GraphError;

/// Errors that can occur while planning, building or grafting a unit.
///
/// Most variants are per-unit and end up in the pass report. Only
/// structural problems (a workspace conflict, a broken graph) abort a pass.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// An external tool ran and exited unsuccessfully.
    #[error("build of {unit} failed with exit code {}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    BuildFailed {
        /// The unit being built.
        unit: String,
        /// Exit code, or `None` if the tool was killed by a signal.
        exit_code: Option<i32>,
        /// Captured stdout and stderr.
        log: String,
    },

    /// An external tool could not be started.
    #[error("cannot run '{program}': {source}")]
    ToolUnavailable {
        /// The executable that was invoked.
        program: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An extension module outside any package was declared on a target
    /// that has no `provides` block to carry it to the wheel stage.
    #[error(
        "{unit} contains a module that is not in a package but has no 'provides' block to build it with"
    )]
    InvalidModuleExtension {
        /// The offending unit.
        unit: String,
    },

    /// A tool reported success but did not produce what it should have.
    #[error("{unit} produced no usable output: {reason}")]
    MissingOutput {
        /// The unit being built.
        unit: String,
        /// What is missing.
        reason: String,
    },

    /// A unit was handed to a builder that cannot build it.
    #[error("{builder} builder cannot build {unit}")]
    Unsupported {
        /// The unit.
        unit: String,
        /// The builder it was dispatched to.
        builder: &'static str,
    },

    /// A filesystem operation failed while staging or collecting files.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The worker pool could not be created.
    #[error("cannot start worker pool: {reason}")]
    Pool {
        /// Why the pool failed to start.
        reason: String,
    },

    /// A fingerprinting, workspace or cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A graph error.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for errors that must abort the whole pass rather than
    /// fail a single unit.
    pub fn is_structural(&self) -> bool {
        matches!(self, BuildError::Cache(CacheError::WorkspaceConflict { .. }))
    }

    /// The captured tool log, if this is a tool failure.
    pub fn log(&self) -> Option<&str> {
        match self {
            BuildError::BuildFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}
