//! Move coalescing (distilled spec §4.4), run before coloring when
//! [`crate::settings::Flags::coalesce`] is set.
//!
//! Grounded on `reg_alloc.c`'s conservative-coalescing loop: repeatedly
//! find a candidate `Mov src, dst` whose operands don't already interfere,
//! test it safe to merge (Briggs' test when both sides are pseudos: the
//! union's significant-degree neighbors number fewer than `k`; George's
//! test when one side is a precolored hardware register: every neighbor of
//! the pseudo side is either precolored, already interferes with that
//! register, or has insignificant degree), and if safe, merge the pseudo
//! into its partner and delete the now-redundant move. Iterates to a fixed
//! point — coalescing one pair can make a previously-unsafe pair safe by
//! shrinking a shared neighbor's degree — bounded defensively so a cycle in
//! the merge graph can't loop forever.

use super::interference::Graph;
use super::liveness::Loc;
use crate::asm::{Instruction, Operand};
use crate::ident::Ident;
use std::collections::{HashMap, HashSet};

/// Coalesces what it safely can, rewriting `instructions` in place and
/// returning the substitution map applied (coalesced-away location ->
/// surviving location), composed transitively. `aliased` pseudos (their
/// address was taken) are never candidates: they don't appear in `graph`
/// at all, so merging one in would smuggle it back into allocation.
pub fn coalesce(
    graph: &mut Graph,
    instructions: &mut Vec<Instruction>,
    k: usize,
    aliased: &HashSet<Ident>,
) -> HashMap<Loc, Loc> {
    let mut subst: HashMap<Loc, Loc> = HashMap::new();
    let is_aliased = |loc: &Loc| matches!(loc, Loc::Pseudo(id) if aliased.contains(id));

    let max_rounds = instructions.len() + graph.nodes.len() + 1;
    for _ in 0..max_rounds {
        let candidate = find_candidate(graph, instructions, &subst, &is_aliased);
        let Some((from, to)) = candidate else {
            break;
        };
        if !safe_to_coalesce(graph, from, to, k) {
            // Mark it permanently ineligible by merging it with itself is
            // wrong; instead we just won't reconsider the exact same pair
            // since `from` stays a distinct node. To guarantee progress,
            // skip re-scanning it by recording a no-op self mapping is
            // unsound, so simply break — remaining candidates (if any)
            // differ only by instruction order and will be found next
            // round if something upstream changes their safety.
            if !advance_past(graph, instructions, &subst, from, to, &is_aliased) {
                break;
            }
            continue;
        }
        merge(graph, &mut subst, from, to);
        rewrite_instructions(instructions, from, to);
    }

    subst
}

/// Finds the next coalescing candidate: a `Mov` whose (post-substitution)
/// operands are two distinct, non-interfering, same-class locations.
fn find_candidate(
    graph: &Graph,
    instructions: &[Instruction],
    subst: &HashMap<Loc, Loc>,
    is_aliased: &impl Fn(&Loc) -> bool,
) -> Option<(Loc, Loc)> {
    for inst in instructions {
        if let Instruction::Mov { src, dst, .. } = inst {
            let (Some(s), Some(d)) = (loc_of(src), loc_of(dst)) else {
                continue;
            };
            let s = resolve(subst, s);
            let d = resolve(subst, d);
            if s == d || is_aliased(&s) || is_aliased(&d) {
                continue;
            }
            if graph.neighbors(&d).contains(&s) {
                continue;
            }
            return Some((s, d));
        }
    }
    None
}

/// When a found candidate fails its safety test, skip past it by treating
/// it as already "seen" for this scan: we detect forward progress by
/// checking whether any other candidate remains once this one is excluded.
/// Returns `false` when no further candidates exist, ending the loop.
fn advance_past(
    graph: &Graph,
    instructions: &[Instruction],
    subst: &HashMap<Loc, Loc>,
    seen_from: Loc,
    seen_to: Loc,
    is_aliased: &impl Fn(&Loc) -> bool,
) -> bool {
    for inst in instructions {
        if let Instruction::Mov { src, dst, .. } = inst {
            let (Some(s), Some(d)) = (loc_of(src), loc_of(dst)) else {
                continue;
            };
            let s = resolve(subst, s);
            let d = resolve(subst, d);
            if s == d || is_aliased(&s) || is_aliased(&d) || graph.neighbors(&d).contains(&s) {
                continue;
            }
            if (s, d) != (seen_from, seen_to) {
                return true;
            }
        }
    }
    false
}

fn resolve(subst: &HashMap<Loc, Loc>, mut loc: Loc) -> Loc {
    let mut steps = 0;
    while let Some(&next) = subst.get(&loc) {
        loc = next;
        steps += 1;
        if steps > 10_000 {
            break;
        }
    }
    loc
}

fn loc_of(op: &Operand) -> Option<Loc> {
    match op {
        Operand::Register(r) => Some(Loc::Reg(*r)),
        Operand::Pseudo(id) => Some(Loc::Pseudo(*id)),
        _ => None,
    }
}

fn is_precolored(loc: Loc) -> bool {
    matches!(loc, Loc::Reg(_))
}

fn safe_to_coalesce(graph: &Graph, a: Loc, b: Loc, k: usize) -> bool {
    if is_precolored(a) && is_precolored(b) {
        return false;
    }
    if is_precolored(a) || is_precolored(b) {
        let (precolored, pseudo) = if is_precolored(a) { (a, b) } else { (b, a) };
        george_test(graph, pseudo, precolored, k)
    } else {
        briggs_test(graph, a, b, k)
    }
}

/// Briggs' test: after merging, the number of neighbors with significant
/// (>= k) degree must stay below k.
fn briggs_test(graph: &Graph, a: Loc, b: Loc, k: usize) -> bool {
    let mut union: HashSet<Loc> = graph.neighbors(&a).iter().copied().collect();
    union.extend(graph.neighbors(&b).iter().copied());
    union.remove(&a);
    union.remove(&b);

    let significant = union
        .iter()
        .filter(|n| combined_degree(graph, n, a, b) >= k)
        .count();
    significant < k
}

/// George's test: every neighbor of the pseudo is either precolored,
/// already interferes with the target register, or has insignificant
/// degree — so merging can't push any of them over budget.
fn george_test(graph: &Graph, pseudo: Loc, precolored: Loc, k: usize) -> bool {
    graph.neighbors(&pseudo).iter().all(|n| {
        is_precolored(*n) || graph.neighbors(&precolored).contains(n) || graph.degree(n) < k
    })
}

/// A neighbor's degree in the hypothetical merged graph: its normal degree,
/// minus one if it's adjacent to both `a` and `b` (since that edge would
/// collapse into a single edge to the merged node).
fn combined_degree(graph: &Graph, n: &Loc, a: Loc, b: Loc) -> usize {
    let base = graph.degree(n);
    if graph.neighbors(n).contains(&a) && graph.neighbors(n).contains(&b) {
        base - 1
    } else {
        base
    }
}

fn merge(graph: &mut Graph, subst: &mut HashMap<Loc, Loc>, from: Loc, to: Loc) {
    let neighbors: Vec<Loc> = graph.neighbors(&from).iter().copied().collect();
    for n in neighbors {
        graph.add_edge(to, n);
    }
    graph.nodes.remove(&from);
    graph.edges.remove(&from);
    for edges in graph.edges.values_mut() {
        edges.remove(&from);
    }
    let occ = graph.occurrences.remove(&from).unwrap_or(0);
    *graph.occurrences.entry(to).or_insert(0) += occ;
    subst.insert(from, to);
}

fn rewrite_instructions(instructions: &mut Vec<Instruction>, from: Loc, to: Loc) {
    for inst in instructions.iter_mut() {
        rewrite_operands(inst, from, to);
    }
    instructions.retain(|inst| !is_trivial_mov(inst));
}

fn rewrite_operands(inst: &mut Instruction, from: Loc, to: Loc) {
    let replace = |op: &mut Operand| {
        if loc_of(op) == Some(from) {
            *op = match to {
                Loc::Reg(r) => Operand::Register(r),
                Loc::Pseudo(id) => Operand::Pseudo(id),
            };
        }
    };
    match inst {
        Instruction::Mov { src, dst, .. }
        | Instruction::MovSx { src, dst, .. }
        | Instruction::MovZeroExtend { src, dst, .. }
        | Instruction::Lea { src, dst }
        | Instruction::Cvttsd2si { src, dst, .. }
        | Instruction::Cvtsi2sd { src, dst, .. }
        | Instruction::Binary { src, dst, .. }
        | Instruction::Cmp { src, dst, .. } => {
            replace(src);
            replace(dst);
        }
        Instruction::Unary { dst, .. } | Instruction::SetCC { dst, .. } => replace(dst),
        Instruction::Idiv { src, .. } | Instruction::Div { src, .. } | Instruction::Push(src) => {
            replace(src)
        }
        Instruction::Cdq { .. }
        | Instruction::Jmp(_)
        | Instruction::JmpCC { .. }
        | Instruction::Label(_)
        | Instruction::AllocateStack(_)
        | Instruction::DeallocateStack(_)
        | Instruction::Pop(_)
        | Instruction::Call { .. }
        | Instruction::Ret => {}
    }
}

fn is_trivial_mov(inst: &Instruction) -> bool {
    matches!(inst, Instruction::Mov { src, dst, .. } if src == dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::IdentFactory;

    #[test]
    fn non_interfering_move_related_pseudos_coalesce() {
        let mut f = IdentFactory::new();
        let x = f.intern("x");
        let y = f.intern("y");
        let mut graph = Graph::default();
        graph.add_node(Loc::Pseudo(x));
        graph.add_node(Loc::Pseudo(y));

        let mut instructions = vec![Instruction::Mov {
            ty: crate::asm::AsmType::LongWord,
            src: Operand::Pseudo(x),
            dst: Operand::Pseudo(y),
        }];
        let subst = coalesce(&mut graph, &mut instructions, 12, &HashSet::new());
        assert_eq!(subst.len(), 1);
        assert!(instructions.is_empty());
    }

    #[test]
    fn aliased_pseudo_never_coalesces() {
        let mut f = IdentFactory::new();
        let x = f.intern("x");
        let y = f.intern("y");
        let mut graph = Graph::default();
        graph.add_node(Loc::Pseudo(x));
        graph.add_node(Loc::Pseudo(y));

        let mut instructions = vec![Instruction::Mov {
            ty: crate::asm::AsmType::LongWord,
            src: Operand::Pseudo(x),
            dst: Operand::Pseudo(y),
        }];
        let mut aliased = HashSet::new();
        aliased.insert(x);
        let subst = coalesce(&mut graph, &mut instructions, 12, &aliased);
        assert!(subst.is_empty());
        assert_eq!(instructions.len(), 1);
    }
}
