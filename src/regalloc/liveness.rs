//! Backward liveness dataflow over a [`Cfg`] (distilled spec §4.4:
//! `in[B] = use[B] ∪ (out[B] − def[B])`).
//!
//! Grounded on `examples/original_source/src/optimization/reg_alloc.c`'s
//! `analyze_liveness` loop, generalized from that file's 32/64-bit integer
//! register tracking to the full int+SSE file this crate allocates over.
//! The SysV-specific transfer-function quirks (`Call` clobbers every
//! caller-saved register and uses only the argument registers its own
//! `int_arg_regs`/`sse_arg_regs` counts name, `Idiv`/`Div` read and write
//! `AX`/`DX`, `Cdq` writes `DX`, a non-immediate shift count is staged
//! through `CX`) live here rather than on [`Instruction::uses`]/
//! [`Instruction::def`], since those exist for the later pseudo-rewrite pass
//! and intentionally don't know about implicit hardware-register traffic.

use super::cfg::Cfg;
use crate::asm::{Instruction, Operand, Reg};
use crate::ident::Ident;
use std::collections::HashSet;

/// A location liveness cares about: either a not-yet-allocated pseudo or a
/// concrete hardware register. Memory operands (`Stack`/`Data`) never
/// appear here — nothing needs to color them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loc {
    Pseudo(Ident),
    Reg(Reg),
}

pub type LiveSet = HashSet<Loc>;

/// Every caller-saved integer and SSE register a `Call` instruction
/// clobbers (distilled spec §4.4). `R10`/`R11`/`Xmm14`/`Xmm15` are excluded
/// because they never hold a live pseudo's value across a call boundary —
/// they're legalizer scratch, dead by construction at any instruction
/// boundary.
const CALL_CLOBBERS: [Reg; 13] = [
    Reg::Ax,
    Reg::Cx,
    Reg::Dx,
    Reg::Di,
    Reg::Si,
    Reg::R8,
    Reg::R9,
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
];
const CALL_CLOBBERS_SSE_REST: [Reg; 8] = [
    Reg::Xmm6,
    Reg::Xmm7,
    Reg::Xmm8,
    Reg::Xmm9,
    Reg::Xmm10,
    Reg::Xmm11,
    Reg::Xmm12,
    Reg::Xmm13,
];

/// Result of running liveness to a fixed point: per-block boundary sets,
/// plus the finer per-instruction live-out sets interference needs.
pub struct Liveness {
    pub block_live_in: Vec<LiveSet>,
    pub block_live_out: Vec<LiveSet>,
    /// `instruction_live_out[b][i]` is the set live immediately after
    /// instruction `i` of block `b`.
    pub instruction_live_out: Vec<Vec<LiveSet>>,
}

pub fn analyze(cfg: &Cfg) -> Liveness {
    let n = cfg.blocks.len();
    let mut live_in: Vec<LiveSet> = vec![LiveSet::new(); n];
    let mut live_out: Vec<LiveSet> = vec![LiveSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..n).rev() {
            let mut out_b = LiveSet::new();
            for &succ in &cfg.blocks[b].successors {
                out_b.extend(live_in[succ].iter().copied());
            }

            let mut in_b = out_b.clone();
            for inst in cfg.blocks[b].instructions.iter().rev() {
                apply_transfer(inst, &mut in_b);
            }

            if in_b != live_in[b] {
                live_in[b] = in_b;
                changed = true;
            }
            if out_b != live_out[b] {
                live_out[b] = out_b;
                changed = true;
            }
        }
    }

    let mut instruction_live_out = Vec::with_capacity(n);
    for b in 0..n {
        let mut running = live_out[b].clone();
        let mut per_inst = vec![LiveSet::new(); cfg.blocks[b].instructions.len()];
        for (i, inst) in cfg.blocks[b].instructions.iter().enumerate().rev() {
            per_inst[i] = running.clone();
            apply_transfer(inst, &mut running);
        }
        instruction_live_out.push(per_inst);
    }

    Liveness {
        block_live_in: live_in,
        block_live_out: live_out,
        instruction_live_out,
    }
}

/// `live = use(inst) ∪ (live − def(inst))`, applied in place (so callers
/// walk a block backward, folding each instruction's transfer function
/// into a running live set).
fn apply_transfer(inst: &Instruction, live: &mut LiveSet) {
    for def in defs(inst) {
        live.remove(&def);
    }
    for u in uses(inst) {
        live.insert(u);
    }
}

fn as_loc(op: &Operand) -> Option<Loc> {
    match op {
        Operand::Register(r) => Some(Loc::Reg(*r)),
        Operand::Pseudo(id) => Some(Loc::Pseudo(*id)),
        // The address-computation register in a dereference is itself a
        // live use at this instruction, even though the operand it's
        // embedded in is conceptually "memory".
        Operand::Memory { base, .. } => Some(Loc::Reg(*base)),
        Operand::Stack { .. } | Operand::Data(_) | Operand::Imm { .. } => None,
    }
}

/// Public alias used by interference construction, which needs the same
/// use-set independent of the running liveness fold.
pub(crate) fn instruction_uses(inst: &Instruction) -> Vec<Loc> {
    uses(inst)
}

/// Public alias used by interference construction.
pub(crate) fn instruction_defs(inst: &Instruction) -> Vec<Loc> {
    defs(inst)
}

fn uses(inst: &Instruction) -> Vec<Loc> {
    let mut out: Vec<Loc> = inst.uses().into_iter().filter_map(as_loc).collect();
    // Binary's generic `uses()` already includes `dst` for the
    // read-modify-write shape; nothing more to add there.
    match inst {
        Instruction::Idiv { .. } | Instruction::Div { .. } => {
            out.push(Loc::Reg(Reg::Ax));
            out.push(Loc::Reg(Reg::Dx));
        }
        Instruction::Cdq { .. } => out.push(Loc::Reg(Reg::Ax)),
        Instruction::Call { int_arg_regs, sse_arg_regs, .. } => {
            for r in &Reg::INT_ARG_REGS[..*int_arg_regs as usize] {
                out.push(Loc::Reg(*r));
            }
            for r in &Reg::SSE_ARG_REGS[..*sse_arg_regs as usize] {
                out.push(Loc::Reg(*r));
            }
        }
        Instruction::Binary {
            op,
            src: Operand::Pseudo(_) | Operand::Register(_),
            ..
        } if matches!(
            op,
            crate::asm::AsmBinaryOp::ShiftLeft | crate::asm::AsmBinaryOp::ShiftRight
        ) =>
        {
            out.push(Loc::Reg(Reg::Cx));
        }
        _ => {}
    }
    out
}

fn defs(inst: &Instruction) -> Vec<Loc> {
    let mut out: Vec<Loc> = inst.def().into_iter().filter_map(as_loc).collect();
    match inst {
        Instruction::Idiv { .. } | Instruction::Div { .. } => {
            out.push(Loc::Reg(Reg::Ax));
            out.push(Loc::Reg(Reg::Dx));
        }
        Instruction::Cdq { .. } => out.push(Loc::Reg(Reg::Dx)),
        Instruction::Call { .. } => {
            for r in CALL_CLOBBERS {
                out.push(Loc::Reg(r));
            }
            for r in CALL_CLOBBERS_SSE_REST {
                out.push(Loc::Reg(r));
            }
        }
        Instruction::Binary {
            op,
            src: Operand::Pseudo(_) | Operand::Register(_),
            ..
        } if matches!(
            op,
            crate::asm::AsmBinaryOp::ShiftLeft | crate::asm::AsmBinaryOp::ShiftRight
        ) =>
        {
            out.push(Loc::Reg(Reg::Cx));
        }
        _ => {}
    }
    out
}
