//! The kiln target graph.
//!
//! [`BuildGraph`] holds declared targets and the edges between them, with
//! memoized invalidation hashes. [`GraphSplicer`] grafts build results into
//! the graph as derived nodes so that later tasks in the same pass consume
//! them.

#![warn(missing_docs)]

pub mod error;
pub mod graph;
pub mod node;
pub mod splice;
pub mod views;

pub use error::GraphError;
pub use graph::BuildGraph;
pub use node::{ExtModule, NodeId, NodeOrigin, Provides, TargetNode};
pub use splice::{Companion, GraftOutcome, GraftRequest, GraphSplicer, UnitState};
pub use views::{derived_from, effective_dependencies, exported_targets, resolve_original};
