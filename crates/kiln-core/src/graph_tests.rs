// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn step(id: &str) -> StepId {
    StepId::new(id)
}

fn linear_graph() -> StepGraph {
    build_graph([
        (step("a"), vec![]),
        (step("b"), vec![step("a")]),
        (step("c"), vec![step("b")]),
    ])
}

#[test]
fn topological_levels_orders_independent_steps_into_one_wave() {
    let graph = build_graph([
        (step("a"), vec![]),
        (step("b"), vec![]),
        (step("c"), vec![step("a"), step("b")]),
    ]);
    let levels = topological_levels(&graph).unwrap();
    assert_eq!(levels.len(), 2);
    let mut first: Vec<&str> = levels[0].iter().map(StepId::as_str).collect();
    first.sort_unstable();
    assert_eq!(first, vec!["a", "b"]);
    assert_eq!(levels[1], vec![step("c")]);
}

#[test]
fn topological_levels_is_a_valid_order_when_flattened() {
    let graph = linear_graph();
    let levels = topological_levels(&graph).unwrap();
    let flattened: Vec<&StepId> = levels.iter().flatten().collect();
    let position = |id: &str| flattened.iter().position(|s| *s == &step(id)).unwrap();
    assert!(position("a") < position("b"));
    assert!(position("b") < position("c"));
}

#[test]
fn cyclic_graph_is_rejected() {
    let graph = build_graph([
        (step("a"), vec![step("b")]),
        (step("b"), vec![step("a")]),
    ]);
    let err = topological_levels(&graph).unwrap_err();
    match err {
        CyclicDependencyError::Cycle(mut ids) => {
            ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            assert_eq!(ids, vec![step("a"), step("b")]);
        }
    }
}

#[test]
fn validate_graph_accepts_acyclic_and_rejects_cyclic() {
    assert!(validate_graph(&linear_graph()).is_ok());
    let cyclic = build_graph([(step("a"), vec![step("a")])]);
    assert!(validate_graph(&cyclic).is_err());
}

#[test]
fn subgraph_is_closed_under_predecessors() {
    let graph = linear_graph();
    let result = subgraph(&graph, &[step("c")]);
    assert_eq!(result.len(), 3);
    assert!(result.contains(&step("a")));
    assert!(result.contains(&step("b")));
    assert!(result.contains(&step("c")));
}

#[test]
fn subgraph_from_unrelated_target_excludes_siblings() {
    let graph = build_graph([
        (step("a"), vec![]),
        (step("b"), vec![]),
        (step("c"), vec![step("a")]),
    ]);
    let result = subgraph(&graph, &[step("c")]);
    assert_eq!(result.len(), 2);
    assert!(!result.contains(&step("b")));
}

#[test]
fn leaf_nodes_are_steps_nothing_depends_on() {
    let graph = build_graph([
        (step("a"), vec![]),
        (step("b"), vec![step("a")]),
        (step("c"), vec![step("a")]),
    ]);
    let mut leaves: Vec<&str> = leaf_nodes(&graph).iter().map(StepId::as_str).collect();
    leaves.sort_unstable();
    assert_eq!(leaves, vec!["b", "c"]);
}

#[test]
fn diamond_graph_has_three_waves() {
    let graph = build_graph([
        (step("a"), vec![]),
        (step("b"), vec![step("a")]),
        (step("c"), vec![step("a")]),
        (step("d"), vec![step("b"), step("c")]),
    ]);
    let levels = topological_levels(&graph).unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], vec![step("a")]);
    assert_eq!(levels[2], vec![step("d")]);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Build a random acyclic graph: node `i` may only depend on nodes `< i`.
    fn acyclic_graph(n: usize, edge_bits: &[bool]) -> StepGraph {
        let ids: Vec<StepId> = (0..n).map(|i| step(&format!("s{i}"))).collect();
        let mut bit = 0;
        let mut graph = StepGraph::new();
        for i in 0..n {
            let mut deps = IndexSet::new();
            for j in 0..i {
                if edge_bits.get(bit).copied().unwrap_or(false) {
                    deps.insert(ids[j].clone());
                }
                bit += 1;
            }
            graph.insert(ids[i].clone(), deps);
        }
        graph
    }

    proptest! {
        #[test]
        fn topological_levels_is_always_a_valid_order(
            n in 1usize..8,
            edge_bits in prop::collection::vec(any::<bool>(), 0..28),
        ) {
            let graph = acyclic_graph(n, &edge_bits);
            let levels = topological_levels(&graph).unwrap();
            let flattened: Vec<&StepId> = levels.iter().flatten().collect();
            prop_assert_eq!(flattened.len(), graph.len());

            let position = |id: &StepId| flattened.iter().position(|s| *s == id).unwrap();
            for (id, deps) in &graph {
                for dep in deps {
                    prop_assert!(position(dep) < position(id));
                }
            }
        }

        #[test]
        fn subgraph_is_always_closed_under_predecessors(
            n in 1usize..8,
            edge_bits in prop::collection::vec(any::<bool>(), 0..28),
            target_idx in 0usize..8,
        ) {
            let graph = acyclic_graph(n, &edge_bits);
            let target_idx = target_idx % n;
            let target = step(&format!("s{target_idx}"));
            let result = subgraph(&graph, &[target.clone()]);

            for id in &result {
                if let Some(deps) = graph.get(id) {
                    for dep in deps {
                        prop_assert!(result.contains(dep));
                    }
                }
            }
            prop_assert!(result.contains(&target));
        }
    }
}
