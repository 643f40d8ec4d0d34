//! Strongly connected components over the file-level import graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Adjacency in path order, so the walk is deterministic.
pub type Adjacency = BTreeMap<String, BTreeSet<String>>;

/// Iterative Tarjan. Returns every component, each sorted.
pub fn strongly_connected(adjacency: &Adjacency) -> Vec<Vec<String>> {
    let nodes: Vec<&String> = adjacency
        .iter()
        .flat_map(|(source, targets)| std::iter::once(source).chain(targets.iter()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| {
            adjacency
                .get(*n)
                .map(|targets| targets.iter().map(|t| position[t.as_str()]).collect())
                .unwrap_or_default()
        })
        .collect();

    let count = nodes.len();
    let mut index = vec![usize::MAX; count];
    let mut lowlink = vec![0usize; count];
    let mut on_stack = vec![false; count];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<String>> = Vec::new();

    for root in 0..count {
        if index[root] != usize::MAX {
            continue;
        }
        // (node, next successor to visit)
        let mut work: Vec<(usize, usize)> = vec![(root, 0)];
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(&(node, cursor)) = work.last() {
            if let Some(&succ) = successors[node].get(cursor) {
                let top = work.len() - 1;
                work[top].1 += 1;
                if index[succ] == usize::MAX {
                    index[succ] = next_index;
                    lowlink[succ] = next_index;
                    next_index += 1;
                    stack.push(succ);
                    on_stack[succ] = true;
                    work.push((succ, 0));
                } else if on_stack[succ] {
                    lowlink[node] = lowlink[node].min(index[succ]);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[node]);
            }
            if lowlink[node] == index[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(nodes[member].clone());
                    if member == node {
                        break;
                    }
                }
                component.sort();
                components.push(component);
            }
        }
    }
    components
}

/// Components with more than one member, ordered by their smallest path.
/// Self-loops are not cycles here; callers report them separately.
pub fn cycle_groups(adjacency: &Adjacency) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = strongly_connected(adjacency)
        .into_iter()
        .filter(|c| c.len() > 1)
        .collect();
    groups.sort();
    groups
}
