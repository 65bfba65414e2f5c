//! Grafting build results back into the graph.
//!
//! When a build unit finishes, its results become a new *synthetic* node
//! derived from the unit's original node. Every consumer of the original is
//! made to depend on the synthetic node as well, so later tasks in the same
//! pass see the built artifact. Original edges are kept;
//! [`effective_dependencies`](crate::effective_dependencies) hides the
//! shadowed originals.
//!
//! Synthetic nodes live for a single pass. [`GraphSplicer::begin_pass`]
//! removes whatever the previous pass grafted.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use kiln_common::{Address, ContentHash};

use crate::error::GraphError;
use crate::graph::BuildGraph;
use crate::node::{NodeId, NodeOrigin, Provides, TargetNode};

/// Lifecycle of one build unit within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not built yet.
    Pending,
    /// Built (or restored from cache), not yet visible in the graph.
    Built,
    /// Grafted; `synthetic` is the node standing in for the results.
    Grafted {
        /// The synthetic node.
        synthetic: NodeId,
    },
}

/// An extra node created next to the synthetic node (for example a wheel's
/// `.dist-info` resources). The synthetic node depends on its companions.
#[derive(Debug, Clone)]
pub struct Companion {
    /// Address of the companion node.
    pub address: Address,
    /// Kind label.
    pub kind: String,
    /// Files relative to the graft's source root.
    pub sources: Vec<PathBuf>,
    /// Payload hash of the companion.
    pub payload_hash: ContentHash,
}

/// Everything needed to graft one unit's results.
#[derive(Debug, Clone)]
pub struct GraftRequest {
    /// Address of the unit's original node.
    pub original: Address,
    /// Address for the synthetic node.
    pub synthetic_address: Address,
    /// Kind label of the synthetic node.
    pub kind: String,
    /// Directory holding the results.
    pub source_root: PathBuf,
    /// Result files relative to `source_root`.
    pub sources: Vec<PathBuf>,
    /// Distribution identity carried by the synthetic node.
    pub provides: Option<Provides>,
    /// Payload hash of the synthetic node (typically the unit fingerprint).
    pub payload_hash: ContentHash,
    /// Additional nodes created alongside.
    pub companions: Vec<Companion>,
    /// Tags added on top of the ones inherited from the original.
    pub tags: BTreeSet<String>,
}

/// What a graft changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftOutcome {
    /// The synthetic node.
    pub synthetic: NodeId,
    /// Consumers that gained an edge to the synthetic node.
    pub consumers_rewired: usize,
    /// Nodes whose invalidation hash went from clean to dirty.
    pub nodes_dirtied: usize,
    /// `true` if the unit had already been grafted and nothing changed.
    pub reused: bool,
}

/// Tracks per-unit graft state across a pass and performs grafts.
#[derive(Debug, Default)]
pub struct GraphSplicer {
    states: HashMap<Address, UnitState>,
    created: Vec<NodeId>,
}

impl GraphSplicer {
    /// Creates a splicer with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new pass: removes every node grafted by earlier passes and
    /// resets all units to [`UnitState::Pending`].
    pub fn begin_pass(&mut self, graph: &mut BuildGraph) {
        let removed = self.created.len();
        for id in self.created.drain(..).rev() {
            graph.remove_target(id);
        }
        self.states.clear();
        if removed > 0 {
            tracing::debug!(removed, "removed synthetic nodes from previous pass");
        }
    }

    /// Current state of the unit for `original`.
    pub fn state(&self, original: &Address) -> UnitState {
        self.states
            .get(original)
            .copied()
            .unwrap_or(UnitState::Pending)
    }

    /// Records that the unit for `original` has results. A unit that is
    /// already grafted stays grafted.
    pub fn mark_built(&mut self, original: &Address) {
        let state = self
            .states
            .entry(original.clone())
            .or_insert(UnitState::Pending);
        if *state == UnitState::Pending {
            *state = UnitState::Built;
        }
    }

    /// Splices the results of a built unit into `graph`.
    ///
    /// Grafting the same unit twice in a pass returns the existing synthetic
    /// node without touching the graph.
    pub fn graft(
        &mut self,
        graph: &mut BuildGraph,
        request: GraftRequest,
    ) -> Result<GraftOutcome, GraphError> {
        match self.state(&request.original) {
            UnitState::Grafted { synthetic } if graph.contains(synthetic) => {
                return Ok(GraftOutcome {
                    synthetic,
                    consumers_rewired: 0,
                    nodes_dirtied: 0,
                    reused: true,
                });
            }
            UnitState::Pending => {
                return Err(GraphError::NotBuilt {
                    address: request.original,
                });
            }
            _ => {}
        }

        let original = graph
            .lookup(&request.original)
            .ok_or_else(|| GraphError::GraftConflict {
                address: request.original.clone(),
            })?;
        if graph.lookup(&request.synthetic_address).is_some() {
            return Err(GraphError::DuplicateTarget {
                address: request.synthetic_address,
            });
        }
        let origin = NodeOrigin::Derived { original };

        // Snapshot before adding anything so new nodes are never rewired.
        let consumers: Vec<NodeId> = graph
            .dependents_of(original)
            .into_iter()
            .filter(|c| graph.node(*c).map(|n| n.origin) != Some(origin))
            .collect();
        let mut tags = graph
            .node(original)
            .map(|n| n.tags.clone())
            .unwrap_or_default();
        tags.extend(request.tags);

        let mut companion_ids = Vec::with_capacity(request.companions.len());
        for companion in request.companions {
            let mut node = TargetNode::original(companion.address, companion.kind)
                .with_sources(request.source_root.clone(), companion.sources)
                .with_payload_hash(companion.payload_hash);
            node.origin = origin;
            let id = graph.add_target(node)?;
            self.created.push(id);
            companion_ids.push(id);
        }

        let mut node = TargetNode::original(request.synthetic_address, request.kind)
            .with_sources(request.source_root, request.sources)
            .with_payload_hash(request.payload_hash);
        node.origin = origin;
        node.provides = request.provides;
        node.tags = tags;
        let synthetic = graph.add_new_target(node, &companion_ids)?;
        self.created.push(synthetic);

        let mut consumers_rewired = 0;
        for consumer in consumers {
            if graph.inject_dependency(consumer, synthetic)? {
                consumers_rewired += 1;
            }
        }

        let mut seeds = graph.dependencies_of(original);
        seeds.push(original);
        let nodes_dirtied = graph.mark_invalidation_dirty_transitive(seeds);

        if graph.is_target_root(original) {
            graph.add_target_root(synthetic)?;
        }

        self.states
            .insert(request.original.clone(), UnitState::Grafted { synthetic });
        tracing::debug!(
            original = %request.original,
            consumers_rewired,
            nodes_dirtied,
            "grafted build results"
        );
        Ok(GraftOutcome {
            synthetic,
            consumers_rewired,
            nodes_dirtied,
            reused: false,
        })
    }
}
