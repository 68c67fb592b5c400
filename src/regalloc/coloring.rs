//! Chaitin-Briggs optimistic graph coloring (distilled spec §4.4).
//!
//! Grounded on `reg_alloc.c`'s `color_graph`: repeatedly remove (simplify)
//! any node of insignificant degree (< k); when none remains, optimistically
//! push the remaining node with the lowest `spill_cost / degree` ratio
//! anyway rather than committing to a spill up front. Nodes come back off
//! the stack in reverse removal order and get the first allocatable color
//! none of their already-colored neighbors hold; a node that runs out of
//! colors at that point is a genuine spill, not just a simplify-time guess.

use super::interference::Graph;
use super::liveness::Loc;
use crate::asm::Reg;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct Coloring {
    pub colors: HashMap<Loc, Reg>,
    pub spilled: HashSet<Loc>,
}

/// Color `graph` using at most `k` colors drawn from `allocatable`.
/// Precolored hardware-register nodes are pinned to themselves and never
/// pushed through simplify/select; only `Loc::Pseudo` nodes are candidates
/// for coloring or spilling.
pub fn color(graph: &Graph, k: usize, allocatable: &[Reg]) -> Coloring {
    let ordered = prefer_caller_saved(allocatable);
    color_with_order(graph, k, &ordered)
}

/// Caller-saved registers first, callee-saved last, each group keeping
/// `allocatable`'s relative order. A node picks the first free color in
/// this order, so a caller-saved register wins whenever one is free —
/// callee-saved colors are only spent when nothing caller-saved is left,
/// which keeps the common case from needing a prologue/epilogue save.
fn prefer_caller_saved(allocatable: &[Reg]) -> Vec<Reg> {
    let mut ordered: Vec<Reg> = allocatable.iter().copied().filter(|r| !r.is_callee_saved()).collect();
    ordered.extend(allocatable.iter().copied().filter(|r| r.is_callee_saved()));
    ordered
}

fn color_with_order(graph: &Graph, k: usize, allocatable: &[Reg]) -> Coloring {
    let pseudo_nodes: Vec<Loc> = graph
        .nodes
        .iter()
        .copied()
        .filter(|n| matches!(n, Loc::Pseudo(_)))
        .collect();

    let original_degree: HashMap<Loc, usize> = pseudo_nodes
        .iter()
        .map(|&n| (n, graph.degree(&n)))
        .collect();

    let mut removed: HashSet<Loc> = HashSet::new();
    // Simplify-phase push order; most functions never spill more than a
    // handful of pseudos, so this rarely spills to the heap.
    let mut stack: SmallVec<[Loc; 16]> = SmallVec::new();

    loop {
        let remaining: Vec<Loc> = pseudo_nodes
            .iter()
            .copied()
            .filter(|n| !removed.contains(n))
            .collect();
        if remaining.is_empty() {
            break;
        }

        let insignificant = remaining
            .iter()
            .find(|n| current_degree(graph, n, &removed) < k)
            .copied();

        let chosen = insignificant.unwrap_or_else(|| {
            // No insignificant-degree node left: push the cheapest-to-spill
            // candidate and keep going, betting its neighbors still end up
            // with enough colors once simplified further (Briggs'
            // optimistic coloring).
            remaining
                .iter()
                .copied()
                .min_by(|a, b| {
                    spill_cost(graph, &original_degree, a)
                        .partial_cmp(&spill_cost(graph, &original_degree, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("remaining is non-empty")
        });

        removed.insert(chosen);
        stack.push(chosen);
    }

    let mut colors: HashMap<Loc, Reg> = allocatable.iter().map(|&r| (Loc::Reg(r), r)).collect();
    let mut spilled = HashSet::new();

    while let Some(node) = stack.pop() {
        let used: HashSet<Reg> = graph
            .neighbors(&node)
            .iter()
            .filter_map(|n| colors.get(n).copied())
            .collect();
        match allocatable.iter().find(|r| !used.contains(r)) {
            Some(&r) => {
                colors.insert(node, r);
            }
            None => {
                spilled.insert(node);
            }
        }
    }

    colors.retain(|loc, _| matches!(loc, Loc::Pseudo(_)));
    Coloring { colors, spilled }
}

fn current_degree(graph: &Graph, node: &Loc, removed: &HashSet<Loc>) -> usize {
    graph
        .neighbors(node)
        .iter()
        .filter(|n| !removed.contains(*n))
        .count()
}

/// `occurrences(node) / max(1, original_degree(node))` — a node used rarely
/// relative to how much it constrains its neighbors is a cheap spill.
fn spill_cost(graph: &Graph, original_degree: &HashMap<Loc, usize>, node: &Loc) -> f64 {
    let occ = *graph.occurrences.get(node).unwrap_or(&1) as f64;
    let degree = (*original_degree.get(node).unwrap_or(&1)).max(1) as f64;
    occ / degree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::IdentFactory;

    #[test]
    fn two_non_interfering_pseudos_can_share_a_color() {
        let mut f = IdentFactory::new();
        let x = f.intern("x");
        let y = f.intern("y");
        let mut graph = Graph::default();
        graph.add_node(Loc::Pseudo(x));
        graph.add_node(Loc::Pseudo(y));
        let allocatable = [Reg::Ax, Reg::Bx];
        let coloring = color(&graph, 2, &allocatable);
        assert_eq!(coloring.colors.len(), 2);
        assert!(coloring.spilled.is_empty());
    }

    #[test]
    fn more_pseudos_than_colors_forces_a_spill() {
        let mut f = IdentFactory::new();
        let locs: Vec<Loc> = (0..3).map(|i| Loc::Pseudo(f.intern(&format!("v{i}")))).collect();
        let mut graph = Graph::default();
        for &a in &locs {
            for &b in &locs {
                if a != b {
                    graph.add_edge(a, b);
                }
            }
        }
        let allocatable = [Reg::Ax, Reg::Bx];
        let coloring = color(&graph, 2, &allocatable);
        assert_eq!(coloring.spilled.len(), 1);
        assert_eq!(coloring.colors.len(), 2);
    }

    #[test]
    fn caller_saved_color_wins_over_an_earlier_callee_saved_one() {
        let mut f = IdentFactory::new();
        let x = f.intern("x");
        let mut graph = Graph::default();
        graph.add_node(Loc::Pseudo(x));
        // Bx (callee-saved) listed before Ax (caller-saved): the picked
        // color must still be Ax.
        let allocatable = [Reg::Bx, Reg::Ax];
        let coloring = color(&graph, 2, &allocatable);
        assert_eq!(coloring.colors.get(&Loc::Pseudo(x)), Some(&Reg::Ax));
    }
}
