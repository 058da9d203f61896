// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! DAG engine: build the step dependency graph, detect cycles, compute
//! topological waves, and derive subgraphs/leaves for targeted runs.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use thiserror::Error;

use crate::id::StepId;

/// `step id -> set of step ids it depends on`. Insertion order is preserved
/// (not semantic for edges, but wave output order derived from it is
/// observable and should be stable run to run).
pub type StepGraph = IndexMap<StepId, IndexSet<StepId>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CyclicDependencyError {
    #[error("cyclic dependency detected among steps: {0:?}")]
    Cycle(Vec<StepId>),
}

/// Build a graph from `(step id, dependency ids)` pairs, preserving the
/// caller's iteration order.
pub fn build_graph<I, D>(edges: I) -> StepGraph
where
    I: IntoIterator<Item = (StepId, D)>,
    D: IntoIterator<Item = StepId>,
{
    edges
        .into_iter()
        .map(|(id, deps)| (id, deps.into_iter().collect()))
        .collect()
}

/// Reject a graph containing a cycle. Missing-reference validation is the
/// resolver's job (it knows which inputs are `optional`); this only checks
/// acyclicity among edges that are already known to exist in the graph.
pub fn validate_graph(graph: &StepGraph) -> Result<(), CyclicDependencyError> {
    topological_levels(graph).map(|_| ())
}

/// Kahn's algorithm: repeatedly drain nodes with zero remaining in-degree.
/// Each drained batch is one wave; steps within a wave share no dependency
/// and may run concurrently. If fewer than `|V|` nodes drain, the remainder
/// forms at least one cycle.
pub fn topological_levels(graph: &StepGraph) -> Result<Vec<Vec<StepId>>, CyclicDependencyError> {
    let mut in_degree: IndexMap<&StepId, usize> = graph
        .keys()
        .map(|id| {
            let degree = graph.get(id).map(|deps| deps.len()).unwrap_or(0);
            (id, degree)
        })
        .collect();

    // Reverse index: who depends on me, so a drained node can decrement its dependents.
    let mut dependents: IndexMap<&StepId, Vec<&StepId>> =
        graph.keys().map(|id| (id, Vec::new())).collect();
    for (id, deps) in graph {
        for dep in deps {
            if let Some(list) = dependents.get_mut(dep) {
                list.push(id);
            }
        }
    }

    let mut levels = Vec::new();
    let mut remaining = graph.len();

    loop {
        let ready: Vec<&StepId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            in_degree.shift_remove(*id);
        }
        remaining -= ready.len();
        for id in &ready {
            if let Some(deps) = dependents.get(id) {
                for dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }
        levels.push(ready.into_iter().cloned().collect());
    }

    if remaining > 0 {
        let cyclic: Vec<StepId> = in_degree.keys().map(|id| (*id).clone()).collect();
        return Err(CyclicDependencyError::Cycle(cyclic));
    }

    Ok(levels)
}

/// Reverse BFS from `targets`: every target plus every (transitive)
/// dependency it needs. Inclusive of the targets themselves.
pub fn subgraph(graph: &StepGraph, targets: &[StepId]) -> HashSet<StepId> {
    let mut seen: HashSet<StepId> = HashSet::new();
    let mut stack: Vec<StepId> = targets.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(deps) = graph.get(&id) {
            for dep in deps {
                if !seen.contains(dep) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    seen
}

/// Nodes that no other node depends on.
pub fn leaf_nodes(graph: &StepGraph) -> Vec<StepId> {
    let depended_on: HashSet<&StepId> = graph.values().flat_map(|deps| deps.iter()).collect();
    graph
        .keys()
        .filter(|id| !depended_on.contains(id))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
