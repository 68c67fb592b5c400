//! Interference graph construction (distilled spec §4.4).
//!
//! Grounded on `reg_alloc.c`'s `build_interference_graph`: for every
//! instruction, each location it defines interferes with everything live
//! immediately after it, except the move-coalescing exception — a `Mov
//! r, s -> t` of matching register class does not make `s` interfere with
//! `t`, since they're candidates to be colored identically and erased by
//! coalescing. Integer and SSE pseudos never interfere with each other (two
//! disjoint physical files), so this builds two independent graphs.

use super::cfg::Cfg;
use super::liveness::{Liveness, Loc};
use crate::asm::{Instruction, Operand, Reg};
use crate::backend_symbols::TypeEnv;
use crate::ident::Ident;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Int,
    Sse,
}

/// An undirected interference graph for one register class.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: HashSet<Loc>,
    pub edges: HashMap<Loc, HashSet<Loc>>,
    /// How many times each node is referenced in the instruction stream —
    /// the numerator of the spill-cost heuristic ([`super::coloring`]).
    pub occurrences: HashMap<Loc, u32>,
}

impl Graph {
    pub fn add_node(&mut self, loc: Loc) {
        self.nodes.insert(loc);
        self.edges.entry(loc).or_default();
    }

    pub fn add_edge(&mut self, a: Loc, b: Loc) {
        if a == b {
            return;
        }
        self.add_node(a);
        self.add_node(b);
        self.edges.get_mut(&a).unwrap().insert(b);
        self.edges.get_mut(&b).unwrap().insert(a);
    }

    pub fn degree(&self, loc: &Loc) -> usize {
        self.edges.get(loc).map_or(0, |s| s.len())
    }

    pub fn neighbors(&self, loc: &Loc) -> &HashSet<Loc> {
        static EMPTY: std::sync::OnceLock<HashSet<Loc>> = std::sync::OnceLock::new();
        self.edges.get(loc).unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    fn bump_occurrence(&mut self, loc: Loc) {
        *self.occurrences.entry(loc).or_insert(0) += 1;
    }
}

fn class_of_reg(r: Reg) -> Class {
    if r.is_sse() {
        Class::Sse
    } else {
        Class::Int
    }
}

fn class_of_loc(loc: Loc, types: &TypeEnv) -> Class {
    match loc {
        Loc::Reg(r) => class_of_reg(r),
        Loc::Pseudo(id) => {
            if types.try_get(id).map_or(false, |t| t.is_double()) {
                Class::Sse
            } else {
                Class::Int
            }
        }
    }
}

/// Build both the integer and SSE interference graphs for one function's
/// (already liveness-analyzed) instruction stream.
///
/// `aliased` names every pseudo whose address was taken somewhere in this
/// function (a `Lea` sourced directly from it, per `GetAddress`'s lowering
/// in `asm::select`). Per the glossary's "aliased pseudo" entry, these are
/// excluded from allocation entirely: a `Lea`'s source must name actual
/// storage, so an address-taken variable can never be colored into a
/// register. Skipping it here rather than filtering after the fact means
/// it simply never becomes a graph node, so it surfaces untouched to
/// `legalize::replace_pseudos`, which gives every pseudo a stack slot.
pub fn build(cfg: &Cfg, liveness: &Liveness, types: &TypeEnv, aliased: &HashSet<Ident>) -> (Graph, Graph) {
    let mut int_graph = Graph::default();
    let mut sse_graph = Graph::default();
    let is_aliased = |loc: &Loc| matches!(loc, Loc::Pseudo(id) if aliased.contains(id));

    // Precolored hardware registers of a class form a clique among
    // themselves: no two physical registers can ever share a color, so
    // this has to hold regardless of whether any instruction's def/live-out
    // sets witness it directly.
    for &r in Reg::ALLOCATABLE_INT.iter() {
        int_graph.add_node(Loc::Reg(r));
    }
    for &r in Reg::ALLOCATABLE_SSE.iter() {
        sse_graph.add_node(Loc::Reg(r));
    }
    clique(&mut int_graph, &Reg::ALLOCATABLE_INT.iter().map(|&r| Loc::Reg(r)).collect::<Vec<_>>());
    clique(&mut sse_graph, &Reg::ALLOCATABLE_SSE.iter().map(|&r| Loc::Reg(r)).collect::<Vec<_>>());

    for (b, block) in cfg.blocks.iter().enumerate() {
        for (i, inst) in block.instructions.iter().enumerate() {
            let live_after = &liveness.instruction_live_out[b][i];
            let def_locs = super::liveness::instruction_defs(inst);
            let move_pair = coalescible_move_pair(inst);

            for &d in &def_locs {
                if is_aliased(&d) {
                    continue;
                }
                let class = class_of_loc(d, types);
                let graph = if class == Class::Int { &mut int_graph } else { &mut sse_graph };
                graph.add_node(d);
                graph.bump_occurrence(d);
                for &other in live_after.iter() {
                    if is_aliased(&other) {
                        continue;
                    }
                    if class_of_loc(other, types) != class {
                        continue;
                    }
                    if other == d {
                        continue;
                    }
                    if move_pair == Some((d, other)) || move_pair == Some((other, d)) {
                        continue;
                    }
                    graph.add_edge(d, other);
                }
            }

            for &u in super::liveness::instruction_uses(inst).iter() {
                if is_aliased(&u) {
                    continue;
                }
                let class = class_of_loc(u, types);
                let graph = if class == Class::Int { &mut int_graph } else { &mut sse_graph };
                graph.add_node(u);
                graph.bump_occurrence(u);
            }

            let _ = inst;
        }
    }

    (int_graph, sse_graph)
}

fn clique(graph: &mut Graph, locs: &[Loc]) {
    for i in 0..locs.len() {
        for j in (i + 1)..locs.len() {
            graph.add_edge(locs[i], locs[j]);
        }
    }
}

/// If `inst` is a same-class register-to-register-or-pseudo `Mov`, returns
/// its `(dst, src)` pair so the caller can skip the interference edge
/// between them.
fn coalescible_move_pair(inst: &Instruction) -> Option<(Loc, Loc)> {
    match inst {
        Instruction::Mov { src, dst, .. } => {
            let s = loc_of(src)?;
            let d = loc_of(dst)?;
            Some((d, s))
        }
        _ => None,
    }
}

fn loc_of(op: &Operand) -> Option<Loc> {
    match op {
        Operand::Register(r) => Some(Loc::Reg(*r)),
        Operand::Pseudo(id) => Some(Loc::Pseudo(*id)),
        _ => None,
    }
}
