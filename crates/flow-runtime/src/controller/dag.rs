//! Dependency-graph ordering over node ids.
//!
//! Nodes live in a flat map keyed by id; edges are id pairs, never owning
//! references. This module turns that edge set into a deterministic
//! topological order, rejecting cycles before the loader commits anything.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

/// The edge set contains a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("configuration graph contains a cycle involving `{0}`")]
pub struct CycleError(pub String);

/// Compute a topological order over `nodes` given `dependency -> dependent`
/// edges.
///
/// The order is deterministic for identical inputs: nodes and edges are
/// inserted in sorted order.
///
/// # Errors
///
/// Returns [`CycleError`] naming a node on a cycle.
pub(crate) fn topo_order(
    nodes: &BTreeSet<String>,
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, CycleError> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in nodes {
        graph.add_node(id.as_str());
    }
    for (from, tos) in edges {
        for to in tos {
            graph.add_edge(from.as_str(), to.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(CycleError(cycle.node_id().to_string())),
    }
}

/// Transitive dependents of `origin`, excluding `origin` itself.
pub(crate) fn transitive_dependents(
    origin: &str,
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<&str> = vec![origin];
    while let Some(id) = stack.pop() {
        if let Some(dependents) = edges.get(id) {
            for dependent in dependents {
                if out.insert(dependent.clone()) {
                    stack.push(dependent.as_str());
                }
            }
        }
    }
    out
}
