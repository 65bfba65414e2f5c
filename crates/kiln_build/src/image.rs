//! The image builder: `docker build` over a hermetic context directory.

use std::path::Path;
use std::sync::Arc;

use kiln_config::ToolsConfig;

use crate::builder::{ArtifactBuilder, BuildOutput};
use crate::error::BuildError;
use crate::stage;
use crate::tool::{Invocation, ToolInvoker};
use crate::unit::{BuildUnit, ImageSpec, UnitSpec};

/// Metadata key holding the full image tag.
pub const IMAGE_TAG: &str = "image_tag";

/// File the built tag is written to inside the artifact.
pub const IMAGE_TAG_FILE: &str = "image-tag";

const CONTEXT_DIR: &str = ".kiln-context";

/// `[repository/]image_name[:tag]`.
pub fn full_tag(repository: Option<&str>, image_name: &str, tag: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(repository) = repository.filter(|r| !r.is_empty()) {
        out.push_str(repository.trim_end_matches('/'));
        out.push('/');
    }
    out.push_str(image_name);
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        out.push(':');
        out.push_str(tag);
    }
    out
}

/// Builds [`ImageSpec`] units.
pub struct ImageBuilder {
    docker: String,
    invoker: Arc<dyn ToolInvoker>,
}

impl ImageBuilder {
    /// Creates a builder using the configured Docker client.
    pub fn new(tools: &ToolsConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            docker: tools.docker.clone(),
            invoker,
        }
    }

    fn image(
        &self,
        unit: &BuildUnit,
        spec: &ImageSpec,
        workspace: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let context = workspace.join(CONTEXT_DIR);
        stage::copy_file(
            &unit.source_root.join(&spec.dockerfile),
            &context.join("Dockerfile"),
        )?;
        for file in &spec.context {
            let Some(name) = file.file_name() else {
                continue;
            };
            stage::copy_file(file, &context.join(name))?;
        }

        let mut build = Invocation::new(&unit.id, &self.docker, workspace)
            .args(["build", "--rm", "-t"])
            .arg(&spec.full_tag);
        for (key, value) in &spec.build_args {
            build = build.arg("--build-arg").arg(format!("{key}={value}"));
        }
        build = build.arg(context.to_string_lossy());
        let result = self.invoker.invoke(&build);
        stage::remove_after(&context, result)?;
        tracing::info!(unit = %unit.id, tag = %spec.full_tag, "built image");

        if spec.push {
            let push = Invocation::new(&unit.id, &self.docker, workspace)
                .arg("push")
                .arg(&spec.full_tag);
            self.invoker.invoke(&push)?;
            tracing::info!(unit = %unit.id, tag = %spec.full_tag, "pushed image");
        }

        let tag_file = workspace.join(IMAGE_TAG_FILE);
        std::fs::write(&tag_file, format!("{}\n", spec.full_tag))
            .map_err(|e| BuildError::io(&tag_file, e))?;
        Ok(BuildOutput::default().with(IMAGE_TAG, spec.full_tag.clone()))
    }
}

impl ArtifactBuilder for ImageBuilder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn build(&self, unit: &BuildUnit, workspace: &Path) -> Result<BuildOutput, BuildError> {
        match &unit.spec {
            UnitSpec::Image(spec) => self.image(unit, spec, workspace),
            _ => Err(BuildError::Unsupported {
                unit: unit.id.clone(),
                builder: self.name(),
            }),
        }
    }
}
