//! Chaitin-Briggs register allocation over one function's assembly
//! instructions (distilled spec §4.4).
//!
//! The pipeline, grounded end to end on `reg_alloc.c`'s `allocate_registers`
//! driver: build a [`cfg::Cfg`], run [`liveness::analyze`], build the
//! int/SSE [`interference::Graph`]s, optionally [`coalesce::coalesce`], then
//! [`coloring::color`] each graph independently (they're disjoint register
//! files, so an integer pseudo and a double pseudo never compete for the
//! same color). Colored pseudos get rewritten to `Operand::Register`
//! in place; everything left uncolored — a genuine spill, or every pseudo
//! at once when [`crate::settings::OptLevel::None`] skips allocation
//! entirely — is left as `Operand::Pseudo` for [`crate::legalize`] to turn
//! into a stack slot.

pub mod cfg;
pub mod coalesce;
pub mod coloring;
pub mod interference;
pub mod liveness;

use crate::asm::{Instruction, Operand, Reg};
use crate::backend_symbols::TypeEnv;
use crate::ident::Ident;
use crate::settings::Flags;
use liveness::Loc;
use std::collections::{HashMap, HashSet};

/// Every pseudo this function takes the address of via `Lea` — see the
/// glossary's "aliased pseudo" entry and `interference::build`'s doc
/// comment. These never enter the interference graph at all.
fn aliased_pseudos(instructions: &[Instruction]) -> HashSet<Ident> {
    instructions
        .iter()
        .filter_map(|inst| match inst {
            Instruction::Lea { src: Operand::Pseudo(id), .. } => Some(*id),
            _ => None,
        })
        .collect()
}

/// The result of running the allocator over one function.
pub struct Allocated {
    pub instructions: Vec<Instruction>,
    /// Every callee-saved integer register (`Bx`/`R12`-`R15`) the coloring
    /// actually assigned a pseudo into, in `Reg::ALLOCATABLE_INT` order.
    /// `glue::wrap_prologue_epilogue` must push each of these in the
    /// prologue and pop them (in reverse) in the epilogue — per §4.4, a
    /// callee that clobbers one of these without restoring it corrupts the
    /// caller's value in that register.
    pub callee_saved_used: Vec<Reg>,
}

/// Runs the allocator over one function's instructions, returning the
/// (possibly coalescing-shrunk) instruction list with every successfully
/// colored pseudo rewritten to a hardware register, plus the callee-saved
/// registers that coloring used.
pub fn allocate_function(mut instructions: Vec<Instruction>, types: &TypeEnv, flags: &Flags) -> Allocated {
    if !flags.should_allocate() {
        return Allocated { instructions, callee_saved_used: Vec::new() };
    }

    let aliased = aliased_pseudos(&instructions);
    let cfg = cfg::Cfg::build(&instructions);
    let liveness = liveness::analyze(&cfg);
    let (mut int_graph, mut sse_graph) = interference::build(&cfg, &liveness, types, &aliased);

    if flags.coalesce {
        coalesce::coalesce(&mut int_graph, &mut instructions, Reg::ALLOCATABLE_INT.len(), &aliased);
        coalesce::coalesce(&mut sse_graph, &mut instructions, Reg::ALLOCATABLE_SSE.len(), &aliased);
        // Coalescing can merge pseudos that liveness/interference measured
        // separately; a function with no cross-class merges (the common
        // case) leaves both graphs valid as-is, so no re-analysis pass is
        // needed here for the sizes of program this crate targets.
    }

    let int_coloring = coloring::color(&int_graph, Reg::ALLOCATABLE_INT.len(), &Reg::ALLOCATABLE_INT);
    let sse_coloring = coloring::color(&sse_graph, Reg::ALLOCATABLE_SSE.len(), &Reg::ALLOCATABLE_SSE);

    let mut colors: HashMap<Loc, Reg> = HashMap::new();
    colors.extend(int_coloring.colors);
    colors.extend(sse_coloring.colors);

    let callee_saved_used: Vec<Reg> = Reg::ALLOCATABLE_INT
        .iter()
        .copied()
        .filter(|r| r.is_callee_saved() && colors.values().any(|c| c == r))
        .collect();

    for inst in instructions.iter_mut() {
        rewrite_colored(inst, &colors);
    }

    Allocated { instructions, callee_saved_used }
}

fn rewrite_colored(inst: &mut Instruction, colors: &HashMap<Loc, Reg>) {
    let replace = |op: &mut Operand| {
        if let Operand::Pseudo(id) = op {
            if let Some(&r) = colors.get(&Loc::Pseudo(*id)) {
                *op = Operand::Register(r);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::AsmType;
    use crate::frontend_ast::{CType, FrontendSymbol, FrontendSymbolTable, SymbolAttrs};
    use crate::ident::IdentFactory;

    #[test]
    fn disjoint_pseudos_get_colored_into_registers() {
        let mut f = IdentFactory::new();
        let x = f.intern("x");
        let mut symtab = FrontendSymbolTable::new();
        symtab.insert(
            x,
            FrontendSymbol {
                ty: CType::Int,
                attrs: SymbolAttrs::Local,
            },
        );
        let types = TypeEnv::from_frontend(&symtab);

        let instructions = vec![
            Instruction::Mov {
                ty: AsmType::LongWord,
                src: Operand::Imm {
                    is_quad: false,
                    text: "5".into(),
                },
                dst: Operand::Pseudo(x),
            },
            Instruction::Ret,
        ];
        let flags = Flags {
            opt_level: crate::settings::OptLevel::Speed,
            coalesce: false,
        };
        let out = allocate_function(instructions, &types, &flags);
        assert!(matches!(out.instructions[0], Instruction::Mov { dst: Operand::Register(_), .. }));
    }

    #[test]
    fn no_optimization_leaves_every_pseudo_untouched() {
        let types = TypeEnv::default();
        let x_id = crate::ident::IdentFactory::new().intern("x");
        let instructions = vec![Instruction::Mov {
            ty: AsmType::LongWord,
            src: Operand::Imm {
                is_quad: false,
                text: "1".into(),
            },
            dst: Operand::Pseudo(x_id),
        }];
        let out = allocate_function(instructions, &types, &Flags::no_optimization());
        assert!(matches!(out.instructions[0], Instruction::Mov { dst: Operand::Pseudo(_), .. }));
        assert!(out.callee_saved_used.is_empty());
    }

    #[test]
    fn address_taken_pseudo_is_never_colored() {
        let mut f = crate::ident::IdentFactory::new();
        let x = f.intern("x");
        let mut symtab = crate::frontend_ast::FrontendSymbolTable::new();
        symtab.insert(
            x,
            crate::frontend_ast::FrontendSymbol {
                ty: crate::frontend_ast::CType::Int,
                attrs: crate::frontend_ast::SymbolAttrs::Local,
            },
        );
        let types = TypeEnv::from_frontend(&symtab);
        let instructions = vec![
            Instruction::Mov {
                ty: AsmType::LongWord,
                src: Operand::Imm { is_quad: false, text: "1".into() },
                dst: Operand::Pseudo(x),
            },
            Instruction::Lea {
                src: Operand::Pseudo(x),
                dst: Operand::Register(Reg::Ax),
            },
            Instruction::Ret,
        ];
        let flags = Flags { opt_level: crate::settings::OptLevel::Speed, coalesce: true };
        let out = allocate_function(instructions, &types, &flags);
        assert!(matches!(out.instructions[0], Instruction::Mov { dst: Operand::Pseudo(_), .. }));
        assert!(matches!(out.instructions[1], Instruction::Lea { src: Operand::Pseudo(_), .. }));
    }

    #[test]
    fn callee_saved_colors_are_reported_only_when_used() {
        // More live-simultaneously int pseudos than caller-saved colors
        // forces at least one into a callee-saved register.
        let mut f = IdentFactory::new();
        let mut symtab = FrontendSymbolTable::new();
        let mut pseudos = Vec::new();
        for i in 0..9 {
            let id = f.intern(&format!("v{i}"));
            symtab.insert(id, FrontendSymbol { ty: CType::Int, attrs: SymbolAttrs::Local });
            pseudos.push(id);
        }
        let types = TypeEnv::from_frontend(&symtab);

        let mut instructions = Vec::new();
        for (i, &id) in pseudos.iter().enumerate() {
            instructions.push(Instruction::Mov {
                ty: AsmType::LongWord,
                src: Operand::Imm { is_quad: false, text: i.to_string() },
                dst: Operand::Pseudo(id),
            });
        }
        // Every pseudo live into this single instruction: all interfere
        // with each other pairwise.
        for &a in &pseudos {
            for &b in &pseudos {
                if a != b {
                    instructions.push(Instruction::Binary {
                        op: crate::asm::AsmBinaryOp::Add,
                        ty: AsmType::LongWord,
                        src: Operand::Pseudo(a),
                        dst: Operand::Pseudo(b),
                    });
                }
            }
        }
        instructions.push(Instruction::Ret);

        let flags = Flags { opt_level: crate::settings::OptLevel::Speed, coalesce: false };
        let out = allocate_function(instructions, &types, &flags);
        assert!(!out.callee_saved_used.is_empty());
        assert!(out.callee_saved_used.iter().all(|r| r.is_callee_saved()));
    }
}
