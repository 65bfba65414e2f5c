//! The mutable target graph.
//!
//! Edges point from a dependent to its dependency. Every node has an
//! *invalidation hash* derived from its own payload and the invalidation
//! hashes of its dependencies. Hashes are memoized; mutating the graph drops
//! the memo for the affected node and everything that depends on it, and the
//! next query recomputes them lazily.
//!
//! The memo obeys one invariant: if a node's hash is memoized, so are the
//! hashes of all its dependencies. Equivalently, a dirty node only has dirty
//! dependents, which lets the transitive dirty walk stop at the first node
//! that is already dirty.

use std::collections::{HashMap, HashSet, VecDeque};

use kiln_common::{Address, ContentHash, ContentHasher};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::error::GraphError;
use crate::node::{NodeId, TargetNode};

/// The dependency graph of targets.
#[derive(Debug, Default)]
pub struct BuildGraph {
    graph: StableDiGraph<TargetNode, ()>,
    by_address: HashMap<Address, NodeId>,
    roots: Vec<NodeId>,
    invalidation: HashMap<NodeId, ContentHash>,
}

impl BuildGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Adds a node with no dependencies.
    pub fn add_target(&mut self, node: TargetNode) -> Result<NodeId, GraphError> {
        self.add_new_target(node, &[])
    }

    /// Adds a node that depends on `dependencies`.
    ///
    /// Fails if the address is already taken or a dependency handle is stale.
    pub fn add_new_target(
        &mut self,
        node: TargetNode,
        dependencies: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        if self.by_address.contains_key(&node.address) {
            return Err(GraphError::DuplicateTarget {
                address: node.address,
            });
        }
        for dep in dependencies {
            self.check(*dep)?;
        }
        let address = node.address.clone();
        let id = NodeId(self.graph.add_node(node));
        for dep in dependencies {
            self.graph.update_edge(id.0, dep.0, ());
        }
        self.by_address.insert(address, id);
        Ok(id)
    }

    /// Removes a node and its edges, dirtying everything that depended on it.
    pub fn remove_target(&mut self, id: NodeId) -> Option<TargetNode> {
        if !self.graph.contains_node(id.0) {
            return None;
        }
        self.mark_invalidation_dirty_transitive([id]);
        let node = self.graph.remove_node(id.0)?;
        self.by_address.remove(&node.address);
        self.roots.retain(|r| *r != id);
        Some(node)
    }

    /// Returns `true` if `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.contains_node(id.0)
    }

    /// Returns the node behind `id`, if it still exists.
    pub fn node(&self, id: NodeId) -> Option<&TargetNode> {
        self.graph.node_weight(id.0)
    }

    /// Looks up a node by address.
    pub fn lookup(&self, address: &Address) -> Option<NodeId> {
        self.by_address.get(address).copied()
    }

    /// Iterates over every node, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TargetNode)> + '_ {
        self.graph
            .node_indices()
            .map(move |ix| (NodeId(ix), &self.graph[ix]))
    }

    /// Nodes of the given kind, sorted by address.
    pub fn nodes_of_kind(&self, kind: &str) -> Vec<NodeId> {
        let mut out: Vec<_> = self
            .nodes()
            .filter(|(_, n)| n.kind == kind)
            .map(|(id, _)| id)
            .collect();
        self.sort_by_address(&mut out);
        out
    }

    /// Direct dependencies of `id`, sorted by address.
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependents of `id`, sorted by address.
    pub fn dependents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// `id` and everything it transitively depends on, sorted by address.
    pub fn transitive_dependencies(&self, id: NodeId) -> Vec<NodeId> {
        if !self.contains(id) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut dfs = Dfs::new(&self.graph, id.0);
        while let Some(ix) = dfs.next(&self.graph) {
            out.push(NodeId(ix));
        }
        self.sort_by_address(&mut out);
        out
    }

    /// `seeds` and everything that transitively depends on them, sorted by
    /// address.
    pub fn transitive_dependees(&self, seeds: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = seeds.into_iter().filter(|s| self.contains(*s)).collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                queue.extend(self.neighbors(id, Direction::Incoming));
            }
        }
        let mut out: Vec<_> = seen.into_iter().collect();
        self.sort_by_address(&mut out);
        out
    }

    /// Makes `dependent` depend on `dependency`.
    ///
    /// Returns `false` if the edge already existed. Rejects edges that would
    /// close a cycle. A new edge dirties the invalidation hash of `dependent`
    /// and everything above it.
    pub fn inject_dependency(
        &mut self,
        dependent: NodeId,
        dependency: NodeId,
    ) -> Result<bool, GraphError> {
        self.check(dependent)?;
        self.check(dependency)?;
        if self.graph.find_edge(dependent.0, dependency.0).is_some() {
            return Ok(false);
        }
        if dependent == dependency
            || petgraph::algo::has_path_connecting(&self.graph, dependency.0, dependent.0, None)
        {
            return Err(GraphError::Cycle {
                dependent: self.graph[dependent.0].address.clone(),
                dependency: self.graph[dependency.0].address.clone(),
            });
        }
        self.graph.add_edge(dependent.0, dependency.0, ());
        self.mark_invalidation_dirty_transitive([dependent]);
        Ok(true)
    }

    /// The nodes the user asked to build, in the order they were added.
    pub fn target_roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Adds `id` to the target roots. Adding a root twice is a no-op.
    pub fn add_target_root(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.check(id)?;
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
        Ok(())
    }

    /// Returns `true` if `id` is a target root.
    pub fn is_target_root(&self, id: NodeId) -> bool {
        self.roots.contains(&id)
    }

    /// Returns the invalidation hash of `id`, recomputing it (and any dirty
    /// dependency) if needed.
    ///
    /// # Panics
    ///
    /// Panics if `id` has been removed from the graph.
    pub fn invalidation_hash(&mut self, id: NodeId) -> ContentHash {
        if let Some(hash) = self.invalidation.get(&id) {
            return *hash;
        }
        let dep_hashes: Vec<ContentHash> = self
            .dependencies_of(id)
            .into_iter()
            .map(|dep| self.invalidation_hash(dep))
            .collect();
        let node = &self.graph[id.0];
        let mut hasher = ContentHasher::new();
        hasher
            .write_str(&node.address.to_string())
            .write_str(&node.kind)
            .write_hash(&node.payload_hash)
            .write_u64(dep_hashes.len() as u64);
        for hash in &dep_hashes {
            hasher.write_hash(hash);
        }
        let hash = hasher.finish();
        self.invalidation.insert(id, hash);
        hash
    }

    /// Returns `true` if the invalidation hash of `id` must be recomputed.
    pub fn is_invalidation_dirty(&self, id: NodeId) -> bool {
        !self.invalidation.contains_key(&id)
    }

    /// Drops the memoized invalidation hash of every seed and everything that
    /// transitively depends on one.
    ///
    /// Returns how many nodes went from clean to dirty. The walk stops at
    /// nodes that are already dirty, so repeating it with overlapping seeds
    /// does no redundant work.
    pub fn mark_invalidation_dirty_transitive(
        &mut self,
        seeds: impl IntoIterator<Item = NodeId>,
    ) -> usize {
        let mut queue: VecDeque<NodeId> = seeds.into_iter().collect();
        let mut dirtied = 0;
        while let Some(id) = queue.pop_front() {
            if self.invalidation.remove(&id).is_none() {
                continue;
            }
            dirtied += 1;
            queue.extend(self.neighbors(id, Direction::Incoming));
        }
        dirtied
    }

    fn check(&self, id: NodeId) -> Result<(), GraphError> {
        if self.graph.contains_node(id.0) {
            Ok(())
        } else {
            Err(GraphError::StaleHandle(id))
        }
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        if !self.contains(id) {
            return Vec::new();
        }
        let mut out: Vec<_> = self
            .graph
            .neighbors_directed(id.0, direction)
            .map(NodeId)
            .collect();
        self.sort_by_address(&mut out);
        out
    }

    fn sort_by_address(&self, ids: &mut [NodeId]) {
        ids.sort_by(|a, b| self.graph[a.0].address.cmp(&self.graph[b.0].address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> TargetNode {
        TargetNode::original(Address::new("src", name), "python_library")
    }

    /// app -> lib -> base
    fn chain() -> (BuildGraph, NodeId, NodeId, NodeId) {
        let mut g = BuildGraph::new();
        let base = g.add_target(node("base")).unwrap();
        let lib = g.add_new_target(node("lib"), &[base]).unwrap();
        let app = g.add_new_target(node("app"), &[lib]).unwrap();
        (g, app, lib, base)
    }

    #[test]
    fn add_and_lookup() {
        let (g, app, lib, base) = chain();
        assert_eq!(g.len(), 3);
        assert_eq!(g.lookup(&Address::new("src", "app")), Some(app));
        assert_eq!(g.dependencies_of(app), vec![lib]);
        assert_eq!(g.dependents_of(base), vec![lib]);
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut g = BuildGraph::new();
        g.add_target(node("a")).unwrap();
        let err = g.add_target(node("a")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTarget { .. }));
    }

    #[test]
    fn inject_is_idempotent() {
        let (mut g, app, _, base) = chain();
        assert!(g.inject_dependency(app, base).unwrap());
        assert!(!g.inject_dependency(app, base).unwrap());
        assert_eq!(g.dependencies_of(app).len(), 2);
    }

    #[test]
    fn inject_rejects_cycles() {
        let (mut g, app, _, base) = chain();
        let err = g.inject_dependency(base, app).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        let err = g.inject_dependency(base, base).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn invalidation_hash_tracks_dependencies() {
        let (mut g, app, _, base) = chain();
        let before = g.invalidation_hash(app);
        assert!(!g.is_invalidation_dirty(app));
        assert_eq!(g.invalidation_hash(app), before);

        let extra = g.add_target(node("extra")).unwrap();
        g.inject_dependency(base, extra).unwrap();
        assert!(g.is_invalidation_dirty(app));
        assert_ne!(g.invalidation_hash(app), before);
    }

    #[test]
    fn dirty_walk_prunes_at_dirty_nodes() {
        let (mut g, app, lib, base) = chain();
        g.invalidation_hash(app);
        assert_eq!(g.mark_invalidation_dirty_transitive([base]), 3);
        // Everything above base is already dirty.
        assert_eq!(g.mark_invalidation_dirty_transitive([lib, base]), 0);
    }

    #[test]
    fn memo_invariant_holds_after_partial_query() {
        let (mut g, app, lib, base) = chain();
        g.invalidation_hash(lib);
        assert!(!g.is_invalidation_dirty(base));
        assert!(g.is_invalidation_dirty(app));
        // Dirtying base must reach lib even though app was never computed.
        assert_eq!(g.mark_invalidation_dirty_transitive([base]), 2);
        assert!(g.is_invalidation_dirty(lib));
    }

    #[test]
    fn remove_dirties_dependents() {
        let (mut g, app, lib, base) = chain();
        let extra = g.add_new_target(node("extra"), &[base]).unwrap();
        g.inject_dependency(lib, extra).unwrap();
        g.invalidation_hash(app);
        let removed = g.remove_target(extra).unwrap();
        assert_eq!(removed.address.name(), "extra");
        assert!(g.is_invalidation_dirty(app));
        assert!(g.lookup(&Address::new("src", "extra")).is_none());
        assert_eq!(g.dependencies_of(lib), vec![base]);
        assert!(g.remove_target(extra).is_none());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (mut g, app, _, _) = chain();
        let gone = g.add_target(node("gone")).unwrap();
        g.remove_target(gone);
        let err = g.inject_dependency(app, gone).unwrap_err();
        assert!(matches!(err, GraphError::StaleHandle(_)));
    }

    #[test]
    fn transitive_views() {
        let (g, app, lib, base) = chain();
        let mut deps = g.transitive_dependencies(app);
        deps.sort();
        let mut expected = vec![app, lib, base];
        expected.sort();
        assert_eq!(deps, expected);
        assert_eq!(g.transitive_dependees([lib]).len(), 2);
    }

    #[test]
    fn target_roots_dedupe() {
        let (mut g, app, _, _) = chain();
        g.add_target_root(app).unwrap();
        g.add_target_root(app).unwrap();
        assert_eq!(g.target_roots(), &[app]);
        assert!(g.is_target_root(app));
    }
}
