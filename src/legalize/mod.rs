//! Pseudo-register elimination and x86-64 instruction legalization
//! (distilled spec §4.5).
//!
//! Two passes, grounded on `asm_gen.cpp`'s `replace_pseudo_registers` and
//! `legalize_instructions`:
//!
//! 1. [`replace_pseudos`]: every remaining `Operand::Pseudo` — a spill, or
//!    every pseudo at all under [`crate::settings::OptLevel::None`] — is
//!    rewritten to `Operand::Data` if it names static storage, otherwise to
//!    a monotonically-decreasing `Operand::Stack` slot sized/aligned by its
//!    `AsmType`.
//! 2. [`legalize_instructions`]: x86-64 can't encode every shape this IR
//!    allows (two memory operands, an immediate too wide for a 32-bit
//!    encoding, `cvttsd2si` writing to memory, ...); each such instruction
//!    is rewritten into a short sequence staged through the reserved
//!    scratch registers `R10`/`R11` (integer) and `Xmm14`/`Xmm15` (SSE).

use crate::asm::{AsmBinaryOp, AsmType, Instruction, Operand, Reg};
use crate::backend_symbols::{BackendSymbolTable, TypeEnv};
use crate::ident::Ident;
use std::collections::HashMap;

/// Rewrites every `Pseudo` operand in `instructions` to `Data` or `Stack`,
/// returning the rewritten instructions and the frame size (bytes, rounded
/// up to a multiple of 8) the prologue must reserve.
pub fn replace_pseudos(
    mut instructions: Vec<Instruction>,
    types: &TypeEnv,
    backend: &BackendSymbolTable,
) -> (Vec<Instruction>, i32) {
    let mut offsets: HashMap<Ident, i32> = HashMap::new();
    let mut current = 0i32;

    let mut slot_for = |id: Ident| -> Operand {
        if backend.is_static(id) {
            return Operand::Data(id);
        }
        if let Some(&offset) = offsets.get(&id) {
            return Operand::Stack { offset, base: Reg::Bp };
        }
        let asm_ty = project(types.get(id));
        current -= asm_ty.size_bytes();
        current = align_down(current, asm_ty.alignment());
        offsets.insert(id, current);
        Operand::Stack { offset: current, base: Reg::Bp }
    };

    for inst in instructions.iter_mut() {
        for_each_operand_mut(inst, |op| {
            if let Operand::Pseudo(id) = *op {
                *op = slot_for(id);
            }
        });
    }

    let frame_size = round_up_to_8(-current);
    (instructions, frame_size)
}

fn align_down(offset: i32, align: i32) -> i32 {
    offset - offset.rem_euclid(align)
}

fn round_up_to_8(n: i32) -> i32 {
    (n + 7) / 8 * 8
}

fn project(ty: &crate::frontend_ast::CType) -> AsmType {
    match ty {
        crate::frontend_ast::CType::Int | crate::frontend_ast::CType::UInt => AsmType::LongWord,
        crate::frontend_ast::CType::Long
        | crate::frontend_ast::CType::ULong
        | crate::frontend_ast::CType::Pointer(_) => AsmType::QuadWord,
        crate::frontend_ast::CType::Double => AsmType::Double,
        crate::frontend_ast::CType::Fun { .. } => panic!("function type has no assembly operand size"),
    }
}

fn for_each_operand_mut(inst: &mut Instruction, mut f: impl FnMut(&mut Operand)) {
    match inst {
        Instruction::Mov { src, dst, .. }
        | Instruction::MovSx { src, dst, .. }
        | Instruction::MovZeroExtend { src, dst, .. }
        | Instruction::Lea { src, dst }
        | Instruction::Cvttsd2si { src, dst, .. }
        | Instruction::Cvtsi2sd { src, dst, .. }
        | Instruction::Binary { src, dst, .. }
        | Instruction::Cmp { src, dst, .. } => {
            f(src);
            f(dst);
        }
        Instruction::Unary { dst, .. } | Instruction::SetCC { dst, .. } => f(dst),
        Instruction::Idiv { src, .. } | Instruction::Div { src, .. } | Instruction::Push(src) => f(src),
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

const INT_SCRATCH_1: Reg = Reg::R10;
const INT_SCRATCH_2: Reg = Reg::R11;
const SSE_SCRATCH_1: Reg = Reg::Xmm14;
const SSE_SCRATCH_2: Reg = Reg::Xmm15;

fn is_quad_imm(op: &Operand) -> bool {
    matches!(op, Operand::Imm { is_quad: true, .. })
}

/// Rewrites every instruction x86-64 can't encode directly into a short,
/// always-legal sequence. Order matters within each rule: an
/// immediate-too-wide source is staged first, so the subsequent
/// memory-memory check sees the already-legalized operand.
pub fn legalize_instructions(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(instructions.len());
    for inst in instructions {
        legalize_one(inst, &mut out);
    }
    out
}

fn legalize_one(inst: Instruction, out: &mut Vec<Instruction>) {
    match inst {
        Instruction::Mov { ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(ty, src);
            out.extend(pre);
            if src.is_memory() && dst.is_memory() {
                let scratch = scratch_reg(ty, INT_SCRATCH_1, SSE_SCRATCH_1);
                out.push(Instruction::Mov { ty, src, dst: Operand::Register(scratch) });
                out.push(Instruction::Mov { ty, src: Operand::Register(scratch), dst });
            } else {
                out.push(Instruction::Mov { ty, src, dst });
            }
        }
        Instruction::MovSx { src_ty, dst_ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(src_ty, src);
            out.extend(pre);
            if dst.is_memory() {
                out.push(Instruction::MovSx { src_ty, dst_ty, src, dst: Operand::Register(INT_SCRATCH_2) });
                out.push(Instruction::Mov { ty: dst_ty, src: Operand::Register(INT_SCRATCH_2), dst });
            } else {
                out.push(Instruction::MovSx { src_ty, dst_ty, src, dst });
            }
        }
        Instruction::MovZeroExtend { src_ty, dst_ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(src_ty, src);
            out.extend(pre);
            if dst.is_memory() {
                out.push(Instruction::MovZeroExtend { src_ty, dst_ty, src, dst: Operand::Register(INT_SCRATCH_2) });
                out.push(Instruction::Mov { ty: dst_ty, src: Operand::Register(INT_SCRATCH_2), dst });
            } else {
                out.push(Instruction::MovZeroExtend { src_ty, dst_ty, src, dst });
            }
        }
        Instruction::Lea { src, dst } => {
            if dst.is_memory() {
                out.push(Instruction::Lea { src, dst: Operand::Register(INT_SCRATCH_2) });
                out.push(Instruction::Mov { ty: AsmType::QuadWord, src: Operand::Register(INT_SCRATCH_2), dst });
            } else {
                out.push(Instruction::Lea { src, dst });
            }
        }
        Instruction::Cvttsd2si { ty, src, dst } => {
            if dst.is_memory() {
                out.push(Instruction::Cvttsd2si { ty, src, dst: Operand::Register(INT_SCRATCH_2) });
                out.push(Instruction::Mov { ty, src: Operand::Register(INT_SCRATCH_2), dst });
            } else {
                out.push(Instruction::Cvttsd2si { ty, src, dst });
            }
        }
        Instruction::Cvtsi2sd { ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(ty, src);
            out.extend(pre);
            if dst.is_memory() {
                out.push(Instruction::Cvtsi2sd { ty, src, dst: Operand::Register(SSE_SCRATCH_2) });
                out.push(Instruction::Mov { ty: AsmType::Double, src: Operand::Register(SSE_SCRATCH_2), dst });
            } else {
                out.push(Instruction::Cvtsi2sd { ty, src, dst });
            }
        }
        Instruction::Binary { op, ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(ty, src);
            out.extend(pre);
            let dst_needs_staging = dst.is_memory() && (op == AsmBinaryOp::Mult || ty.is_double());
            if dst_needs_staging {
                let scratch = scratch_reg(ty, INT_SCRATCH_2, SSE_SCRATCH_2);
                out.push(Instruction::Mov { ty, src: dst.clone(), dst: Operand::Register(scratch) });
                out.push(Instruction::Binary { op, ty, src, dst: Operand::Register(scratch) });
                out.push(Instruction::Mov { ty, src: Operand::Register(scratch), dst });
            } else if src.is_memory() && dst.is_memory() {
                let scratch = scratch_reg(ty, INT_SCRATCH_1, SSE_SCRATCH_1);
                out.push(Instruction::Mov { ty, src, dst: Operand::Register(scratch) });
                out.push(Instruction::Binary { op, ty, src: Operand::Register(scratch), dst });
            } else {
                out.push(Instruction::Binary { op, ty, src, dst });
            }
        }
        Instruction::Cmp { ty, src, dst } => {
            let (src, pre) = stage_imm_if_needed(ty, src);
            out.extend(pre);
            if ty.is_double() && dst.is_memory() {
                out.push(Instruction::Mov { ty, src: dst.clone(), dst: Operand::Register(SSE_SCRATCH_2) });
                out.push(Instruction::Cmp { ty, src, dst: Operand::Register(SSE_SCRATCH_2) });
            } else if matches!(dst, Operand::Imm { .. }) {
                let scratch = scratch_reg(ty, INT_SCRATCH_2, SSE_SCRATCH_2);
                out.push(Instruction::Mov { ty, src: dst, dst: Operand::Register(scratch) });
                out.push(Instruction::Cmp { ty, src, dst: Operand::Register(scratch) });
            } else if src.is_memory() && dst.is_memory() {
                let scratch = scratch_reg(ty, INT_SCRATCH_1, SSE_SCRATCH_1);
                out.push(Instruction::Mov { ty, src, dst: Operand::Register(scratch) });
                out.push(Instruction::Cmp { ty, src: Operand::Register(scratch), dst });
            } else {
                out.push(Instruction::Cmp { ty, src, dst });
            }
        }
        Instruction::Idiv { ty, src } => {
            if matches!(src, Operand::Imm { .. }) {
                out.push(Instruction::Mov { ty, src, dst: Operand::Register(INT_SCRATCH_1) });
                out.push(Instruction::Idiv { ty, src: Operand::Register(INT_SCRATCH_1) });
            } else {
                out.push(Instruction::Idiv { ty, src });
            }
        }
        Instruction::Div { ty, src } => {
            if matches!(src, Operand::Imm { .. }) {
                out.push(Instruction::Mov { ty, src, dst: Operand::Register(INT_SCRATCH_1) });
                out.push(Instruction::Div { ty, src: Operand::Register(INT_SCRATCH_1) });
            } else {
                out.push(Instruction::Div { ty, src });
            }
        }
        other => out.push(other),
    }
}

fn stage_imm_if_needed(ty: AsmType, op: Operand) -> (Operand, Option<Instruction>) {
    if is_quad_imm(&op) {
        let scratch = Operand::Register(INT_SCRATCH_1);
        (scratch.clone(), Some(Instruction::Mov { ty, src: op, dst: scratch }))
    } else {
        (op, None)
    }
}

fn scratch_reg(ty: AsmType, int_reg: Reg, sse_reg: Reg) -> Reg {
    if ty.is_double() {
        sse_reg
    } else {
        int_reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_to_memory_mov_is_staged_through_scratch() {
        let inst = Instruction::Mov {
            ty: AsmType::QuadWord,
            src: Operand::Stack { offset: -8, base: Reg::Bp },
            dst: Operand::Stack { offset: -16, base: Reg::Bp },
        };
        let out = legalize_instructions(vec![inst]);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Instruction::Mov { dst: Operand::Register(Reg::R10), .. }));
        assert!(matches!(out[1], Instruction::Mov { src: Operand::Register(Reg::R10), .. }));
    }

    #[test]
    fn idiv_with_immediate_is_staged() {
        let inst = Instruction::Idiv {
            ty: AsmType::LongWord,
            src: Operand::Imm { is_quad: false, text: "3".into() },
        };
        let out = legalize_instructions(vec![inst]);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Instruction::Idiv { src: Operand::Register(Reg::R10), .. }));
    }

    #[test]
    fn stack_slots_are_8_byte_aligned_for_quadwords() {
        let mut f = crate::ident::IdentFactory::new();
        let x = f.intern("x");
        let mut symtab = crate::frontend_ast::FrontendSymbolTable::new();
        symtab.insert(
            x,
            crate::frontend_ast::FrontendSymbol {
                ty: crate::frontend_ast::CType::Long,
                attrs: crate::frontend_ast::SymbolAttrs::Local,
            },
        );
        let types = TypeEnv::from_frontend(&symtab);
        let backend = BackendSymbolTable::from_frontend(&symtab);
        let instructions = vec![Instruction::Unary {
            op: crate::asm::AsmUnaryOp::Neg,
            ty: AsmType::QuadWord,
            dst: Operand::Pseudo(x),
        }];
        let (out, frame_size) = replace_pseudos(instructions, &types, &backend);
        assert!(matches!(out[0], Instruction::Unary { dst: Operand::Stack { offset: -8, .. }, .. }));
        assert_eq!(frame_size, 8);
    }
}
