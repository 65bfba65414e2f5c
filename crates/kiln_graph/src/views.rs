//! Read-only views that account for derived nodes.

use crate::graph::BuildGraph;
use crate::node::{NodeId, NodeOrigin, TargetNode};

/// Follows the `derived from` chain of `id` back to the user-declared node.
///
/// An original node resolves to itself. If a link in the chain has been
/// removed, the last live node is returned.
pub fn resolve_original(graph: &BuildGraph, id: NodeId) -> NodeId {
    let mut current = id;
    while let Some(TargetNode {
        origin: NodeOrigin::Derived { original },
        ..
    }) = graph.node(current)
    {
        if !graph.contains(*original) {
            break;
        }
        current = *original;
    }
    current
}

/// Nodes directly derived from `original`, sorted by id.
pub fn derived_from(graph: &BuildGraph, original: NodeId) -> Vec<NodeId> {
    let mut out: Vec<_> = graph
        .nodes()
        .filter(|(_, n)| n.origin == NodeOrigin::Derived { original })
        .map(|(id, _)| id)
        .collect();
    out.sort();
    out
}

/// The nodes that publish a distribution, with originals replaced by their
/// derived counterparts.
///
/// A derived node replaces the node it was derived from when both satisfy
/// `is_exported` and publish the same distribution (see
/// [`Provides::same_distribution`](crate::Provides::same_distribution)).
/// Sorted by address.
pub fn exported_targets<F>(graph: &BuildGraph, is_exported: F) -> Vec<NodeId>
where
    F: Fn(&TargetNode) -> bool,
{
    let mut exported: Vec<NodeId> = graph
        .nodes()
        .filter(|(_, n)| is_exported(n))
        .map(|(id, _)| id)
        .collect();
    let replaced: Vec<NodeId> = exported
        .iter()
        .filter_map(|&id| {
            let node = graph.node(id)?;
            let NodeOrigin::Derived { original } = node.origin else {
                return None;
            };
            let parent = graph.node(original)?;
            let same = match (&parent.provides, &node.provides) {
                (Some(a), Some(b)) => a.same_distribution(b),
                (None, None) => true,
                _ => false,
            };
            (is_exported(parent) && same).then_some(original)
        })
        .collect();
    exported.retain(|id| !replaced.contains(id));
    exported.sort_by(|a, b| {
        let an = graph.node(*a).map(|n| &n.address);
        let bn = graph.node(*b).map(|n| &n.address);
        an.cmp(&bn)
    });
    exported
}

/// Dependencies of `id` with shadowed originals hidden.
///
/// After a graft a consumer depends on both the original and its derived
/// replacement. A dependency is hidden when another dependency of the same
/// node was derived from it, so chains of grafts resolve to the newest node.
pub fn effective_dependencies(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let deps = graph.dependencies_of(id);
    let shadowed: Vec<NodeId> = deps
        .iter()
        .filter_map(|d| match graph.node(*d)?.origin {
            NodeOrigin::Derived { original } => Some(original),
            NodeOrigin::Original => None,
        })
        .collect();
    deps.into_iter().filter(|d| !shadowed.contains(d)).collect()
}
