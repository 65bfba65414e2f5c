//! Error types for graph mutation.

use kiln_common::Address;

use crate::node::NodeId;

/// Errors raised while building or rewriting the target graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// An address was looked up but no node carries it.
    #[error("unknown target: {address}")]
    UnknownTarget {
        /// The missing address.
        address: Address,
    },
    /// A node handle refers to a node that was removed.
    #[error("stale node handle {0:?}")]
    StaleHandle(NodeId),
    /// A node with the same address already exists.
    #[error("duplicate target: {address}")]
    DuplicateTarget {
        /// The clashing address.
        address: Address,
    },
    /// Adding the edge would create a dependency cycle.
    #[error("dependency cycle: {dependent} -> {dependency}")]
    Cycle {
        /// The node that would gain the dependency.
        dependent: Address,
        /// The node it would depend on.
        dependency: Address,
    },
    /// The original node of a graft could not be found.
    #[error("cannot graft onto {address}: original target is not in the graph")]
    GraftConflict {
        /// The original address.
        address: Address,
    },
    /// A graft was requested for a unit that has not been built this pass.
    #[error("cannot graft {address}: unit has not been built")]
    NotBuilt {
        /// The unit's address.
        address: Address,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GraphError::Cycle {
            dependent: Address::new("a", "x"),
            dependency: Address::new("b", "y"),
        };
        assert_eq!(err.to_string(), "dependency cycle: a:x -> b:y");

        let err = GraphError::NotBuilt {
            address: Address::new("src", "lib"),
        };
        assert!(err.to_string().contains("has not been built"));
    }
}
