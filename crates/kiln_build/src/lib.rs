//! Building units and splicing their results into the target graph.
//!
//! A [`Task`] selects target nodes and prepares a [`BuildUnit`] for each.
//! [`BuildPass`] fingerprints units, reuses committed results and builds the
//! rest on a [`WorkerPool`] through the [`ArtifactBuilder`] for the unit's
//! kind. [`run_pipeline`] drives every task in order and grafts each unit's
//! results so the next task sees them.

#![warn(missing_docs)]

pub mod builder;
pub mod compile;
pub mod error;
pub mod image;
pub mod package;
pub mod pass;
pub mod pipeline;
pub mod project;
pub mod report;
pub mod scheduler;
pub mod setup_py;
pub mod stage;
pub mod task;
pub mod tool;
pub mod unit;

pub use builder::{ArtifactBuilder, BuildOutput, Builders};
pub use error::BuildError;
pub use pass::{BuildPass, BuildResults, Plan};
pub use pipeline::{run_pipeline, Mode, PipelineOptions};
pub use project::Project;
pub use report::{PassReport, UnitOutcome, UnitReport};
pub use scheduler::{JobResult, WorkerPool};
pub use task::Task;
pub use tool::{Invocation, ProcessInvoker, ToolInvoker, ToolOutput};
pub use unit::{BuildUnit, CompileSpec, ImageSpec, PackageSpec, StagedFile, UnitSpec};
