//! The builder seam.
//!
//! An [`ArtifactBuilder`] turns a unit into files inside a private workspace
//! directory. It never touches the cache: allocation, commit and discard are
//! the caller's job, so a failed build can never leave partial results.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use kiln_config::ToolsConfig;

use crate::compile::CompileBuilder;
use crate::error::BuildError;
use crate::image::ImageBuilder;
use crate::package::PackageBuilder;
use crate::tool::ToolInvoker;
use crate::unit::{BuildUnit, UnitSpec};

/// Facts a builder reports about what it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Stored in the artifact record (wheel name, image tag, ...).
    pub metadata: BTreeMap<String, String>,
}

impl BuildOutput {
    /// Adds a metadata entry.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Builds one kind of unit.
///
/// Builders hold no per-unit state and are shared by every worker.
pub trait ArtifactBuilder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Builds `unit` into `workspace`, an empty directory owned by this call.
    fn build(&self, unit: &BuildUnit, workspace: &Path) -> Result<BuildOutput, BuildError>;
}

/// One builder per unit family.
pub struct Builders {
    compile: CompileBuilder,
    package: PackageBuilder,
    image: ImageBuilder,
}

impl Builders {
    /// Creates the builders, all running tools through `invoker`.
    pub fn new(tools: &ToolsConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            compile: CompileBuilder::new(tools, Arc::clone(&invoker)),
            package: PackageBuilder::new(tools, Arc::clone(&invoker)),
            image: ImageBuilder::new(tools, invoker),
        }
    }

    /// The builder responsible for `unit`.
    pub fn for_unit(&self, unit: &BuildUnit) -> &dyn ArtifactBuilder {
        match unit.spec {
            UnitSpec::Compile(_) => &self.compile,
            UnitSpec::Package(_) => &self.package,
            UnitSpec::Image(_) => &self.image,
        }
    }

    /// Builds `unit` into `workspace` with the matching builder.
    pub fn build(&self, unit: &BuildUnit, workspace: &Path) -> Result<BuildOutput, BuildError> {
        let builder = self.for_unit(unit);
        tracing::info!(unit = %unit.id, builder = builder.name(), "building");
        builder.build(unit, workspace)
    }
}

impl std::fmt::Debug for Builders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builders").finish_non_exhaustive()
    }
}
