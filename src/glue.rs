//! Whole-program orchestration: TAC lowering -> selection -> allocation ->
//! legalization -> final assembly (distilled spec §5).
//!
//! Grounded on `asm_gen.cpp`'s `generate_program` / the overall driver
//! shape every pass in this crate was built to slot into: one pipeline
//! function per translation unit, running each function independently
//! through the whole backend and reassembling the program's `top_levels`
//! (every `Function`/`StaticVariable`) and `static_constants` (every
//! deduplicated `.Ldouble` the selector interned) lists at the end. Per
//! §4.4, the allocator only runs at [`crate::settings::OptLevel::Speed`];
//! at `OptLevel::None` every pseudo flows straight to the stack-frame fixer.

use crate::asm::{AsmType, Instruction, Operand, Program, Reg, TopLevel};
use crate::backend_symbols::{BackendSymbolTable, TypeEnv};
use crate::error::CodegenResult;
use crate::frontend_ast;
use crate::ident::IdentFactory;
use crate::legalize;
use crate::regalloc;
use crate::settings::Flags;
use crate::tac::builder::TacBuilder;

/// Runs the whole backend over one translation unit.
pub fn compile_program(
    program: &frontend_ast::Program,
    symtab: &frontend_ast::FrontendSymbolTable,
    factory: &mut IdentFactory,
    flags: &Flags,
) -> CodegenResult<Program> {
    let mut backend = BackendSymbolTable::from_frontend(symtab);

    let builder = TacBuilder::new(factory, symtab);
    let (tac_program, types) = builder.lower_program(program)?;

    let selected = crate::asm::select::select_program(&tac_program, factory, &types, &mut backend)?;

    let mut top_levels = Vec::with_capacity(selected.top_levels.len());
    for tl in selected.top_levels {
        match tl {
            TopLevel::Function { name, global, instructions } => {
                let body = compile_function_body(instructions, &types, &backend, flags, factory, &name)?;
                top_levels.push(TopLevel::Function { name, global, instructions: body });
            }
            other => top_levels.push(other),
        }
    }

    Ok(Program { top_levels, static_constants: selected.static_constants })
}

fn compile_function_body(
    instructions: Vec<Instruction>,
    types: &TypeEnv,
    backend: &BackendSymbolTable,
    flags: &Flags,
    factory: &IdentFactory,
    name: &crate::ident::Ident,
) -> CodegenResult<Vec<Instruction>> {
    let allocated = regalloc::allocate_function(instructions, types, flags);
    let (replaced, frame_size) = legalize::replace_pseudos(allocated.instructions, types, backend);

    if frame_size % 8 != 0 {
        return Err(crate::error::CodegenError::MisalignedFrame {
            function: factory.text(*name).to_string(),
            size: frame_size,
        });
    }

    let legalized = legalize::legalize_instructions(replaced);
    Ok(wrap_prologue_epilogue(legalized, frame_size, &allocated.callee_saved_used))
}

/// Wraps a function's legalized body with the standard frame-pointer
/// prologue (`push %rbp; mov %rsp, %rbp; sub $frame_size, %rsp`, followed by
/// a `push` for each register in `callee_saved`) and rewrites every bare
/// `Ret` the selector emitted into a full epilogue (the `callee_saved` pops,
/// in reverse, then `mov %rbp, %rsp; pop %rbp; ret`). Per §4.4, any
/// callee-saved register the allocator colored a pseudo into must be saved
/// and restored around the body that clobbers it.
fn wrap_prologue_epilogue(body: Vec<Instruction>, frame_size: i32, callee_saved: &[Reg]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(body.len() + 4 + callee_saved.len() * 2);
    out.push(Instruction::Push(Operand::Register(Reg::Bp)));
    out.push(Instruction::Mov {
        ty: AsmType::QuadWord,
        src: Operand::Register(Reg::Sp),
        dst: Operand::Register(Reg::Bp),
    });
    if frame_size > 0 {
        out.push(Instruction::AllocateStack(frame_size));
    }
    for &r in callee_saved {
        out.push(Instruction::Push(Operand::Register(r)));
    }

    for inst in body {
        if matches!(inst, Instruction::Ret) {
            for &r in callee_saved.iter().rev() {
                out.push(Instruction::Pop(r));
            }
            out.push(Instruction::Mov {
                ty: AsmType::QuadWord,
                src: Operand::Register(Reg::Bp),
                dst: Operand::Register(Reg::Sp),
            });
            out.push(Instruction::Pop(Reg::Bp));
            out.push(Instruction::Ret);
        } else {
            out.push(inst);
        }
    }

    out
}
