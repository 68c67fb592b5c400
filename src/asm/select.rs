//! Instruction selection: TAC -> assembly IR (distilled spec §4.2).
//!
//! Grounded on `asm_gen.cpp`'s `generate_*_instructions` family. That file's
//! `TacLoad`/`TacStore`/`TacGetAddress` cases are absent from the surviving
//! source (only the scalar-arithmetic and conversion cases made it past the
//! TODO stage), so the pointer-dereference lowering below is this crate's
//! own extension, built in the same idiom the surviving code uses elsewhere
//! for scratch registers (stage the value through `AX`, then move it where
//! it needs to go) rather than introducing a new kind of fixup the legalizer
//! would need to know about.
//!
//! Every hardware register the selector reaches for directly (`AX`, `DX`,
//! `XMM0`, `XMM1`) is drawn from the allocatable set, so ordinary liveness
//! tracks it like any other definition — `R10`/`R11`/`XMM14`/`XMM15` stay
//! reserved for the legalizer, exactly as distilled spec §4.5 expects.

use crate::asm::{AsmBinaryOp, AsmType, AsmUnaryOp, CondCode, Instruction, Operand, Reg, TopLevel};
use crate::backend_symbols::{BackendSymbolTable, TypeEnv};
use crate::error::CodegenResult;
use crate::frontend_ast::{CConst, CType};
use crate::ident::{Ident, IdentFactory};
use crate::tac;
use std::collections::HashMap;

/// Lowers a whole TAC program to the assembly IR, threading the selector's
/// double-constant pool and registering every synthesized name in the
/// backend symbol table as it goes.
pub fn select_program(
    program: &tac::Program,
    factory: &mut IdentFactory,
    types: &TypeEnv,
    backend: &mut BackendSymbolTable,
) -> CodegenResult<crate::asm::Program> {
    let mut selector = Selector {
        factory,
        types,
        backend,
        double_pool: HashMap::new(),
        constants: Vec::new(),
    };

    let mut top_levels = Vec::new();
    for tl in &program.static_vars {
        top_levels.push(selector.select_static_variable(tl));
    }
    for tl in &program.functions {
        top_levels.push(selector.select_function(tl)?);
    }

    Ok(crate::asm::Program { top_levels, static_constants: selector.constants })
}

struct Selector<'a> {
    factory: &'a mut IdentFactory,
    types: &'a TypeEnv,
    backend: &'a mut BackendSymbolTable,
    /// Interns a double's bit pattern to the tag minted for it, so the same
    /// constant used twice shares one pool entry.
    double_pool: HashMap<u64, Ident>,
    /// `StaticConstant` top-levels, in first-insertion order (iteration
    /// order over `double_pool` is not meaningful; this vec is).
    constants: Vec<TopLevel>,
}

impl<'a> Selector<'a> {
    fn select_static_variable(&mut self, tl: &tac::TopLevel) -> TopLevel {
        match tl {
            tac::TopLevel::StaticVariable {
                name,
                global,
                ty,
                initial,
            } => TopLevel::StaticVariable {
                name: *name,
                global: *global,
                alignment: project_type(ty).alignment(),
                init: *initial,
            },
            tac::TopLevel::Function { .. } => unreachable!("not a static variable"),
        }
    }

    fn select_function(&mut self, tl: &tac::TopLevel) -> CodegenResult<TopLevel> {
        let (name, global, params, body) = match tl {
            tac::TopLevel::Function {
                name,
                global,
                params,
                body,
            } => (*name, *global, params, body),
            tac::TopLevel::StaticVariable { .. } => unreachable!("not a function"),
        };

        let mut instructions = Vec::new();
        self.lower_prologue(params, &mut instructions);
        for inst in body {
            self.select_instruction(inst, &mut instructions);
        }

        Ok(TopLevel::Function {
            name,
            global,
            instructions,
        })
    }

    /// Assigns every parameter pseudo its incoming location: the next free
    /// integer or SSE argument register, or a caller-pushed stack slot for
    /// overflow. Stack-passed parameters live at `16(%rbp)`, `24(%rbp)`,
    /// ... — `8(%rbp)` is the return address and `0(%rbp)` the saved frame
    /// pointer, both pushed by `call`/the callee's own prologue.
    fn lower_prologue(&mut self, params: &[Ident], out: &mut Vec<Instruction>) {
        let mut int_reg_idx = 0usize;
        let mut sse_reg_idx = 0usize;
        let mut stack_idx = 0i32;

        for &param in params {
            let ty = self.type_of_ident(param);
            let asm_ty = project_type(&ty);
            let dst = Operand::Pseudo(param);
            if asm_ty.is_double() {
                if sse_reg_idx < Reg::SSE_ARG_REGS.len() {
                    let src = Operand::Register(Reg::SSE_ARG_REGS[sse_reg_idx]);
                    sse_reg_idx += 1;
                    out.push(Instruction::Mov {
                        ty: asm_ty,
                        src,
                        dst,
                    });
                } else {
                    out.push(Instruction::Mov {
                        ty: asm_ty,
                        src: Operand::Stack {
                            offset: (stack_idx + 2) * 8,
                            base: Reg::Bp,
                        },
                        dst,
                    });
                    stack_idx += 1;
                }
            } else if int_reg_idx < Reg::INT_ARG_REGS.len() {
                let src = Operand::Register(Reg::INT_ARG_REGS[int_reg_idx]);
                int_reg_idx += 1;
                out.push(Instruction::Mov {
                    ty: asm_ty,
                    src,
                    dst,
                });
            } else {
                out.push(Instruction::Mov {
                    ty: asm_ty,
                    src: Operand::Stack {
                        offset: (stack_idx + 2) * 8,
                        base: Reg::Bp,
                    },
                    dst,
                });
                stack_idx += 1;
            }
        }
    }

    fn select_instruction(&mut self, inst: &tac::Instruction, out: &mut Vec<Instruction>) {
        use tac::Instruction as T;
        match inst {
            T::Return(v) => {
                if self.is_double(v) {
                    out.push(Instruction::Mov {
                        ty: AsmType::Double,
                        src: self.operand_of(v),
                        dst: Operand::Register(Reg::Xmm0),
                    });
                } else {
                    out.push(Instruction::Mov {
                        ty: self.type_of(v),
                        src: self.operand_of(v),
                        dst: Operand::Register(Reg::Ax),
                    });
                }
                out.push(Instruction::Ret);
            }
            T::SignExtend { src, dst } => out.push(Instruction::MovSx {
                src_ty: AsmType::LongWord,
                dst_ty: AsmType::QuadWord,
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::ZeroExtend { src, dst } => out.push(Instruction::MovZeroExtend {
                src_ty: AsmType::LongWord,
                dst_ty: AsmType::QuadWord,
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::Truncate { src, dst } => {
                let truncated_src = match src {
                    tac::Value::Constant(c) => Operand::Imm {
                        is_quad: false,
                        text: ((c.as_unsigned_bits() as u32) as i32).to_string(),
                    },
                    tac::Value::Variable(_) => self.operand_of(src),
                };
                out.push(Instruction::Mov {
                    ty: AsmType::LongWord,
                    src: truncated_src,
                    dst: self.operand_of(dst),
                });
            }
            T::DoubleToInt { src, dst } => out.push(Instruction::Cvttsd2si {
                ty: self.type_of(dst),
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::DoubleToUInt { src, dst } => self.lower_double_to_uint(src, dst, out),
            T::IntToDouble { src, dst } => out.push(Instruction::Cvtsi2sd {
                ty: self.type_of(src),
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::UIntToDouble { src, dst } => self.lower_uint_to_double(src, dst, out),
            T::Unary { op, src, dst } => self.lower_unary(*op, src, dst, out),
            T::Binary {
                op,
                src1,
                src2,
                dst,
            } => self.lower_binary(*op, src1, src2, dst, out),
            T::Copy { src, dst } => out.push(Instruction::Mov {
                ty: self.type_of(src),
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::GetAddress { src, dst } => out.push(Instruction::Lea {
                src: self.operand_of(src),
                dst: self.operand_of(dst),
            }),
            T::Load { src_ptr, dst } => self.lower_load(src_ptr, dst, out),
            T::Store { src, dst_ptr } => self.lower_store(src, dst_ptr, out),
            T::Jump(target) => out.push(Instruction::Jmp(*target)),
            T::JumpIfZero { cond, target } => self.lower_jump_if(*cond, true, *target, out),
            T::JumpIfNotZero { cond, target } => self.lower_jump_if(*cond, false, *target, out),
            T::Label(l) => out.push(Instruction::Label(*l)),
            T::FunCall { name, args, dst } => self.lower_call(*name, args, dst.as_ref(), out),
        }
    }

    // -- conversions ------------------------------------------------------

    fn lower_double_to_uint(&mut self, src: &tac::Value, dst: &tac::Value, out: &mut Vec<Instruction>) {
        let dst_ty = self.type_of(dst);
        if dst_ty == AsmType::LongWord {
            out.push(Instruction::Cvttsd2si {
                ty: AsmType::QuadWord,
                src: self.operand_of(src),
                dst: Operand::Register(Reg::Ax),
            });
            out.push(Instruction::Mov {
                ty: AsmType::LongWord,
                src: Operand::Register(Reg::Ax),
                dst: self.operand_of(dst),
            });
            return;
        }

        let upper_bound = self.double_constant(9_223_372_036_854_775_808.0f64.to_bits(), 8);
        let out_of_range = self.factory.fresh_label("sd2si_out_of_range");
        let after = self.factory.fresh_label("sd2si_after");

        out.push(Instruction::Cmp {
            ty: AsmType::Double,
            src: upper_bound.clone(),
            dst: self.operand_of(src),
        });
        out.push(Instruction::JmpCC {
            cond: CondCode::AE,
            target: out_of_range,
        });
        out.push(Instruction::Cvttsd2si {
            ty: AsmType::QuadWord,
            src: self.operand_of(src),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Jmp(after));
        out.push(Instruction::Label(out_of_range));
        out.push(Instruction::Mov {
            ty: AsmType::Double,
            src: self.operand_of(src),
            dst: Operand::Register(Reg::Xmm1),
        });
        out.push(Instruction::Binary {
            op: AsmBinaryOp::Sub,
            ty: AsmType::Double,
            src: upper_bound,
            dst: Operand::Register(Reg::Xmm1),
        });
        out.push(Instruction::Cvttsd2si {
            ty: AsmType::QuadWord,
            src: Operand::Register(Reg::Xmm1),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Mov {
            ty: AsmType::QuadWord,
            src: Operand::Imm {
                is_quad: true,
                text: "9223372036854775808".to_string(),
            },
            dst: Operand::Register(Reg::Dx),
        });
        out.push(Instruction::Binary {
            op: AsmBinaryOp::Add,
            ty: AsmType::QuadWord,
            src: Operand::Register(Reg::Dx),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Label(after));
    }

    fn lower_uint_to_double(&mut self, src: &tac::Value, dst: &tac::Value, out: &mut Vec<Instruction>) {
        let src_ty = self.type_of(src);
        if src_ty == AsmType::LongWord {
            out.push(Instruction::MovZeroExtend {
                src_ty: AsmType::LongWord,
                dst_ty: AsmType::QuadWord,
                src: self.operand_of(src),
                dst: Operand::Register(Reg::Ax),
            });
            out.push(Instruction::Cvtsi2sd {
                ty: AsmType::QuadWord,
                src: Operand::Register(Reg::Ax),
                dst: self.operand_of(dst),
            });
            return;
        }

        let out_of_range = self.factory.fresh_label("si2sd_out_of_range");
        let after = self.factory.fresh_label("si2sd_after");

        out.push(Instruction::Cmp {
            ty: AsmType::QuadWord,
            src: Operand::Imm {
                is_quad: false,
                text: "0".to_string(),
            },
            dst: self.operand_of(src),
        });
        out.push(Instruction::JmpCC {
            cond: CondCode::L,
            target: out_of_range,
        });
        out.push(Instruction::Cvtsi2sd {
            ty: AsmType::QuadWord,
            src: self.operand_of(src),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Jmp(after));
        out.push(Instruction::Label(out_of_range));
        out.push(Instruction::Mov {
            ty: AsmType::QuadWord,
            src: self.operand_of(src),
            dst: Operand::Register(Reg::Ax),
        });
        out.push(Instruction::Mov {
            ty: AsmType::QuadWord,
            src: Operand::Register(Reg::Ax),
            dst: Operand::Register(Reg::Dx),
        });
        out.push(Instruction::Unary {
            op: AsmUnaryOp::Shr,
            ty: AsmType::QuadWord,
            dst: Operand::Register(Reg::Dx),
        });
        out.push(Instruction::Binary {
            op: AsmBinaryOp::BitAnd,
            ty: AsmType::QuadWord,
            src: Operand::Imm {
                is_quad: false,
                text: "1".to_string(),
            },
            dst: Operand::Register(Reg::Ax),
        });
        out.push(Instruction::Binary {
            op: AsmBinaryOp::BitOr,
            ty: AsmType::QuadWord,
            src: Operand::Register(Reg::Ax),
            dst: Operand::Register(Reg::Dx),
        });
        out.push(Instruction::Cvtsi2sd {
            ty: AsmType::QuadWord,
            src: Operand::Register(Reg::Dx),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Binary {
            op: AsmBinaryOp::Add,
            ty: AsmType::Double,
            src: self.operand_of(dst),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Label(after));
    }

    // -- unary / binary -----------------------------------------------------

    fn lower_unary(&mut self, op: tac::UnaryOp, src: &tac::Value, dst: &tac::Value, out: &mut Vec<Instruction>) {
        match op {
            tac::UnaryOp::Not if self.is_double(src) => {
                self.zero_xmm0(out);
                out.push(Instruction::Cmp {
                    ty: AsmType::Double,
                    src: Operand::Register(Reg::Xmm0),
                    dst: self.operand_of(src),
                });
                out.push(Instruction::Mov {
                    ty: AsmType::LongWord,
                    src: zero_imm(),
                    dst: self.operand_of(dst),
                });
                out.push(Instruction::SetCC {
                    cond: CondCode::E,
                    dst: self.operand_of(dst),
                });
            }
            tac::UnaryOp::Not => {
                out.push(Instruction::Cmp {
                    ty: self.type_of(src),
                    src: zero_imm(),
                    dst: self.operand_of(src),
                });
                out.push(Instruction::Mov {
                    ty: self.type_of(dst),
                    src: zero_imm(),
                    dst: self.operand_of(dst),
                });
                out.push(Instruction::SetCC {
                    cond: CondCode::E,
                    dst: self.operand_of(dst),
                });
            }
            tac::UnaryOp::Negate if self.is_double(src) => {
                let mask = self.double_constant((-0.0f64).to_bits(), 16);
                out.push(Instruction::Mov {
                    ty: AsmType::Double,
                    src: self.operand_of(src),
                    dst: self.operand_of(dst),
                });
                out.push(Instruction::Binary {
                    op: AsmBinaryOp::BitXor,
                    ty: AsmType::Double,
                    src: mask,
                    dst: self.operand_of(dst),
                });
            }
            tac::UnaryOp::Negate | tac::UnaryOp::Complement => {
                let asm_op = if op == tac::UnaryOp::Complement {
                    AsmUnaryOp::Not
                } else {
                    AsmUnaryOp::Neg
                };
                out.push(Instruction::Mov {
                    ty: self.type_of(src),
                    src: self.operand_of(src),
                    dst: self.operand_of(dst),
                });
                out.push(Instruction::Unary {
                    op: asm_op,
                    ty: self.type_of(src),
                    dst: self.operand_of(dst),
                });
            }
        }
    }

    fn lower_binary(
        &mut self,
        op: tac::BinaryOp,
        src1: &tac::Value,
        src2: &tac::Value,
        dst: &tac::Value,
        out: &mut Vec<Instruction>,
    ) {
        use tac::BinaryOp as B;

        if op.is_relational() {
            self.lower_relational(op, src1, src2, dst, out);
            return;
        }

        if op == B::Divide && self.is_double(src1) {
            out.push(Instruction::Mov {
                ty: AsmType::Double,
                src: self.operand_of(src1),
                dst: self.operand_of(dst),
            });
            out.push(Instruction::Binary {
                op: AsmBinaryOp::DivDouble,
                ty: AsmType::Double,
                src: self.operand_of(src2),
                dst: self.operand_of(dst),
            });
            return;
        }

        if matches!(op, B::Divide | B::Remainder) {
            self.lower_divide_or_remainder(op, src1, src2, dst, out);
            return;
        }

        let asm_op = match op {
            B::Add => AsmBinaryOp::Add,
            B::Subtract => AsmBinaryOp::Sub,
            B::Multiply => AsmBinaryOp::Mult,
            B::BitAnd => AsmBinaryOp::BitAnd,
            B::BitOr => AsmBinaryOp::BitOr,
            B::BitXor => AsmBinaryOp::BitXor,
            B::ShiftLeft => AsmBinaryOp::ShiftLeft,
            B::ShiftRight => AsmBinaryOp::ShiftRight,
            B::Divide | B::Remainder => unreachable!("handled above"),
            B::Equal | B::NotEqual | B::LessThan | B::LessOrEqual | B::GreaterThan | B::GreaterOrEqual => {
                unreachable!("relational, handled above")
            }
        };
        let ty = self.type_of(src1);
        out.push(Instruction::Mov {
            ty,
            src: self.operand_of(src1),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::Binary {
            op: asm_op,
            ty,
            src: self.operand_of(src2),
            dst: self.operand_of(dst),
        });
    }

    fn lower_divide_or_remainder(
        &mut self,
        op: tac::BinaryOp,
        src1: &tac::Value,
        src2: &tac::Value,
        dst: &tac::Value,
        out: &mut Vec<Instruction>,
    ) {
        let ty = self.type_of(src1);
        let result_reg = if op == tac::BinaryOp::Divide { Reg::Ax } else { Reg::Dx };
        out.push(Instruction::Mov {
            ty,
            src: self.operand_of(src1),
            dst: Operand::Register(Reg::Ax),
        });
        if self.is_signed(src1) {
            out.push(Instruction::Cdq { ty });
            out.push(Instruction::Idiv {
                ty,
                src: self.operand_of(src2),
            });
        } else {
            out.push(Instruction::Mov {
                ty,
                src: zero_imm(),
                dst: Operand::Register(Reg::Dx),
            });
            out.push(Instruction::Div {
                ty,
                src: self.operand_of(src2),
            });
        }
        out.push(Instruction::Mov {
            ty,
            src: Operand::Register(result_reg),
            dst: self.operand_of(dst),
        });
    }

    fn lower_relational(
        &mut self,
        op: tac::BinaryOp,
        src1: &tac::Value,
        src2: &tac::Value,
        dst: &tac::Value,
        out: &mut Vec<Instruction>,
    ) {
        if self.is_double(src1) {
            let cond = unsigned_cond_code(op);
            let nan_label = self.factory.fresh_label("comisd_nan");
            out.push(Instruction::Cmp {
                ty: AsmType::Double,
                src: self.operand_of(src2),
                dst: self.operand_of(src1),
            });
            out.push(Instruction::Mov {
                ty: AsmType::LongWord,
                src: zero_imm(),
                dst: self.operand_of(dst),
            });
            out.push(Instruction::JmpCC {
                cond: CondCode::P,
                target: nan_label,
            });
            out.push(Instruction::SetCC {
                cond,
                dst: self.operand_of(dst),
            });
            out.push(Instruction::Label(nan_label));
            return;
        }

        let cond = if self.is_signed(src1) {
            signed_cond_code(op)
        } else {
            unsigned_cond_code(op)
        };
        out.push(Instruction::Cmp {
            ty: self.type_of(src1),
            src: self.operand_of(src2),
            dst: self.operand_of(src1),
        });
        out.push(Instruction::Mov {
            ty: self.type_of(dst),
            src: zero_imm(),
            dst: self.operand_of(dst),
        });
        out.push(Instruction::SetCC {
            cond,
            dst: self.operand_of(dst),
        });
    }

    // -- control flow -------------------------------------------------------

    fn lower_jump_if(&mut self, cond: tac::Value, on_zero: bool, target: Ident, out: &mut Vec<Instruction>) {
        let cc = if on_zero { CondCode::E } else { CondCode::NE };
        if self.is_double(&cond) {
            self.zero_xmm0(out);
            out.push(Instruction::Cmp {
                ty: AsmType::Double,
                src: self.operand_of(&cond),
                dst: Operand::Register(Reg::Xmm0),
            });
        } else {
            out.push(Instruction::Cmp {
                ty: self.type_of(&cond),
                src: zero_imm(),
                dst: self.operand_of(&cond),
            });
        }
        out.push(Instruction::JmpCC { cond: cc, target });
    }

    // -- pointers -------------------------------------------------------------

    fn lower_load(&mut self, src_ptr: &tac::Value, dst: &tac::Value, out: &mut Vec<Instruction>) {
        out.push(Instruction::Mov {
            ty: AsmType::QuadWord,
            src: self.operand_of(src_ptr),
            dst: Operand::Register(Reg::Ax),
        });
        out.push(Instruction::Mov {
            ty: self.type_of(dst),
            src: Operand::Memory {
                offset: 0,
                base: Reg::Ax,
            },
            dst: self.operand_of(dst),
        });
    }

    fn lower_store(&mut self, src: &tac::Value, dst_ptr: &tac::Value, out: &mut Vec<Instruction>) {
        out.push(Instruction::Mov {
            ty: AsmType::QuadWord,
            src: self.operand_of(dst_ptr),
            dst: Operand::Register(Reg::Ax),
        });
        out.push(Instruction::Mov {
            ty: self.type_of(src),
            src: self.operand_of(src),
            dst: Operand::Memory {
                offset: 0,
                base: Reg::Ax,
            },
        });
    }

    // -- calls ----------------------------------------------------------------

    fn lower_call(&mut self, name: Ident, args: &[tac::Value], dst: Option<&tac::Value>, out: &mut Vec<Instruction>) {
        let mut int_args = Vec::new();
        let mut sse_args = Vec::new();
        let mut stack_args = Vec::new();
        for arg in args {
            if self.is_double(arg) {
                if sse_args.len() < Reg::SSE_ARG_REGS.len() {
                    sse_args.push(arg);
                } else {
                    stack_args.push(arg);
                }
            } else if int_args.len() < Reg::INT_ARG_REGS.len() {
                int_args.push(arg);
            } else {
                stack_args.push(arg);
            }
        }

        let needs_padding = stack_args.len() % 2 == 1;
        let padding = if needs_padding { 8 } else { 0 };
        if padding > 0 {
            out.push(Instruction::AllocateStack(padding));
        }

        for (i, &arg) in int_args.iter().enumerate() {
            out.push(Instruction::Mov {
                ty: self.type_of(arg),
                src: self.operand_of(arg),
                dst: Operand::Register(Reg::INT_ARG_REGS[i]),
            });
        }
        for (i, &arg) in sse_args.iter().enumerate() {
            out.push(Instruction::Mov {
                ty: AsmType::Double,
                src: self.operand_of(arg),
                dst: Operand::Register(Reg::SSE_ARG_REGS[i]),
            });
        }

        for &arg in stack_args.iter().rev() {
            let operand = self.operand_of(arg);
            let ty = self.type_of(arg);
            // `pushq` always moves 8 bytes: a register or immediate operand
            // (whatever its logical width) or an 8-byte memory operand can
            // go straight onto the stack. A 4-byte memory operand can't —
            // stage it through a scratch register first.
            let pushable_directly = matches!(operand, Operand::Register(_) | Operand::Imm { .. })
                || ty == AsmType::QuadWord
                || ty.is_double();
            if pushable_directly {
                out.push(Instruction::Push(operand));
            } else {
                let scratch = Reg::Ax;
                out.push(Instruction::Mov {
                    ty,
                    src: operand,
                    dst: Operand::Register(scratch),
                });
                out.push(Instruction::Push(Operand::Register(scratch)));
            }
        }

        out.push(Instruction::Call {
            target: name,
            int_arg_regs: int_args.len() as u8,
            sse_arg_regs: sse_args.len() as u8,
        });

        let deallocate = (stack_args.len() as i32) * 8 + padding;
        if deallocate > 0 {
            out.push(Instruction::DeallocateStack(deallocate));
        }

        if let Some(dst) = dst {
            if self.is_double(dst) {
                out.push(Instruction::Mov {
                    ty: AsmType::Double,
                    src: Operand::Register(Reg::Xmm0),
                    dst: self.operand_of(dst),
                });
            } else {
                out.push(Instruction::Mov {
                    ty: self.type_of(dst),
                    src: Operand::Register(Reg::Ax),
                    dst: self.operand_of(dst),
                });
            }
        }
    }

    // -- helpers --------------------------------------------------------------

    fn zero_xmm0(&mut self, out: &mut Vec<Instruction>) {
        out.push(Instruction::Binary {
            op: AsmBinaryOp::BitXor,
            ty: AsmType::Double,
            src: Operand::Register(Reg::Xmm0),
            dst: Operand::Register(Reg::Xmm0),
        });
    }

    fn operand_of(&mut self, v: &tac::Value) -> Operand {
        match v {
            tac::Value::Constant(CConst::Double(d)) => {
                self.double_constant(d.to_bits(), 8)
            }
            tac::Value::Constant(c) => Operand::Imm {
                is_quad: c.as_unsigned_bits() > (i32::MAX as u64),
                text: c.to_decimal_string(),
            },
            tac::Value::Variable(id) => {
                if self.backend.is_static(*id) {
                    Operand::Data(*id)
                } else {
                    Operand::Pseudo(*id)
                }
            }
        }
    }

    /// Interns `bits` (a double's raw bit pattern) into the constant pool,
    /// minting a fresh `.Ldouble` tag and registering it in the backend
    /// symbol table the first time this pattern is seen.
    fn double_constant(&mut self, bits: u64, alignment: i32) -> Operand {
        if let Some(&tag) = self.double_pool.get(&bits) {
            return Operand::Data(tag);
        }
        let tag = self.factory.fresh_tag(".Ldouble");
        self.double_pool.insert(bits, tag);
        self.backend.insert_double_constant(tag);
        self.constants.push(TopLevel::StaticConstant {
            name: tag,
            alignment,
            bits,
        });
        Operand::Data(tag)
    }

    fn type_of(&self, v: &tac::Value) -> AsmType {
        match v {
            tac::Value::Constant(c) => project_type(&c.ty()),
            tac::Value::Variable(id) => project_type(self.types.get(*id)),
        }
    }

    fn type_of_ident(&self, id: Ident) -> CType {
        self.types.get(id).clone()
    }

    fn is_double(&self, v: &tac::Value) -> bool {
        self.type_of(v).is_double()
    }

    fn is_signed(&self, v: &tac::Value) -> bool {
        match v {
            tac::Value::Constant(c) => c.ty().is_signed(),
            tac::Value::Variable(id) => self.types.get(*id).is_signed(),
        }
    }
}

fn project_type(ty: &CType) -> AsmType {
    match ty {
        CType::Int | CType::UInt => AsmType::LongWord,
        CType::Long | CType::ULong | CType::Pointer(_) => AsmType::QuadWord,
        CType::Double => AsmType::Double,
        CType::Fun { .. } => panic!("function type has no assembly operand size"),
    }
}

fn zero_imm() -> Operand {
    Operand::Imm {
        is_quad: false,
        text: "0".to_string(),
    }
}

fn signed_cond_code(op: tac::BinaryOp) -> CondCode {
    use tac::BinaryOp as B;
    match op {
        B::Equal => CondCode::E,
        B::NotEqual => CondCode::NE,
        B::LessThan => CondCode::L,
        B::LessOrEqual => CondCode::LE,
        B::GreaterThan => CondCode::G,
        B::GreaterOrEqual => CondCode::GE,
        _ => unreachable!("not a relational operator"),
    }
}

fn unsigned_cond_code(op: tac::BinaryOp) -> CondCode {
    use tac::BinaryOp as B;
    match op {
        B::Equal => CondCode::E,
        B::NotEqual => CondCode::NE,
        B::LessThan => CondCode::B,
        B::LessOrEqual => CondCode::BE,
        B::GreaterThan => CondCode::A,
        B::GreaterOrEqual => CondCode::AE,
        _ => unreachable!("not a relational operator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend_ast::{FrontendSymbol, FrontendSymbolTable, SymbolAttrs};

    fn empty_backend() -> (IdentFactory, TypeEnv, BackendSymbolTable) {
        let factory = IdentFactory::new();
        let symtab = FrontendSymbolTable::new();
        let types = TypeEnv::from_frontend(&symtab);
        let backend = BackendSymbolTable::from_frontend(&symtab);
        (factory, types, backend)
    }

    #[test]
    fn integer_return_lowers_to_ax_and_ret() {
        let (mut factory, mut types, mut backend) = empty_backend();
        let x = factory.intern("x");
        types.insert(x, CType::Int);
        backend.insert_local(x, CType::Int);

        let program = tac::Program {
            static_vars: vec![],
            functions: vec![tac::TopLevel::Function {
                name: factory.intern("main"),
                global: true,
                params: vec![],
                body: vec![tac::Instruction::Return(tac::Value::Variable(x))],
            }],
        };

        let asm = select_program(&program, &mut factory, &types, &mut backend).unwrap();
        let TopLevel::Function { instructions, .. } = &asm.top_levels[0] else {
            panic!("expected a function")
        };
        assert!(matches!(
            instructions[0],
            Instruction::Mov {
                dst: Operand::Register(Reg::Ax),
                ..
            }
        ));
        assert!(matches!(instructions[1], Instruction::Ret));
    }

    #[test]
    fn double_constant_pool_dedupes_by_bit_pattern() {
        let (mut factory, types, mut backend) = empty_backend();
        let mut selector = Selector {
            factory: &mut factory,
            types: &types,
            backend: &mut backend,
            double_pool: HashMap::new(),
            constants: Vec::new(),
        };
        let a = selector.double_constant(1.5f64.to_bits(), 8);
        let b = selector.double_constant(1.5f64.to_bits(), 8);
        assert_eq!(a, b);
        assert_eq!(selector.constants.len(), 1);
    }

    #[test]
    fn unsigned_division_uses_div_not_idiv() {
        let (mut factory, mut types, mut backend) = empty_backend();
        let a = factory.intern("a");
        let b = factory.intern("b");
        let d = factory.intern("d");
        for id in [a, b, d] {
            types.insert(id, CType::UInt);
            backend.insert_local(id, CType::UInt);
        }
        let mut selector = Selector {
            factory: &mut factory,
            types: &types,
            backend: &mut backend,
            double_pool: HashMap::new(),
            constants: Vec::new(),
        };
        let mut out = Vec::new();
        selector.lower_divide_or_remainder(
            tac::BinaryOp::Divide,
            &tac::Value::Variable(a),
            &tac::Value::Variable(b),
            &tac::Value::Variable(d),
            &mut out,
        );
        assert!(out.iter().any(|i| matches!(i, Instruction::Div { .. })));
        assert!(!out.iter().any(|i| matches!(i, Instruction::Idiv { .. })));
    }

    #[test]
    fn load_stages_pointer_through_ax() {
        let (mut factory, mut types, mut backend) = empty_backend();
        let p = factory.intern("p");
        let v = factory.intern("v");
        types.insert(p, CType::Pointer(Box::new(CType::Int)));
        types.insert(v, CType::Int);
        backend.insert_local(p, CType::Pointer(Box::new(CType::Int)));
        backend.insert_local(v, CType::Int);
        let mut selector = Selector {
            factory: &mut factory,
            types: &types,
            backend: &mut backend,
            double_pool: HashMap::new(),
            constants: Vec::new(),
        };
        let mut out = Vec::new();
        selector.lower_load(&tac::Value::Variable(p), &tac::Value::Variable(v), &mut out);
        assert!(matches!(
            out[0],
            Instruction::Mov {
                dst: Operand::Register(Reg::Ax),
                ..
            }
        ));
        assert!(matches!(
            out[1],
            Instruction::Mov {
                src: Operand::Memory { offset: 0, base: Reg::Ax },
                ..
            }
        ));
    }

    #[test]
    fn double_negate_xors_against_a_sign_mask_constant() {
        let (mut factory, mut types, mut backend) = empty_backend();
        let x = factory.intern("x");
        let d = factory.intern("d");
        for id in [x, d] {
            types.insert(id, CType::Double);
            backend.insert_local(id, CType::Double);
        }
        let mut selector = Selector {
            factory: &mut factory,
            types: &types,
            backend: &mut backend,
            double_pool: HashMap::new(),
            constants: Vec::new(),
        };
        let mut out = Vec::new();
        selector.lower_unary(
            tac::UnaryOp::Negate,
            &tac::Value::Variable(x),
            &tac::Value::Variable(d),
            &mut out,
        );

        assert_eq!(selector.constants.len(), 1);
        assert!(matches!(
            selector.constants[0],
            TopLevel::StaticConstant { bits, alignment: 16, .. } if bits == (-0.0f64).to_bits()
        ));
        assert!(out.iter().any(
            |i| matches!(i, Instruction::Binary { op: AsmBinaryOp::BitXor, ty: AsmType::Double, src: Operand::Data(_), .. })
        ));
    }

    #[test]
    fn unsigned_64bit_int_to_double_takes_the_out_of_range_split_path() {
        let (mut factory, mut types, mut backend) = empty_backend();
        let u = factory.intern("u");
        let d = factory.intern("d");
        types.insert(u, CType::ULong);
        types.insert(d, CType::Double);
        backend.insert_local(u, CType::ULong);
        backend.insert_local(d, CType::Double);
        let mut selector = Selector {
            factory: &mut factory,
            types: &types,
            backend: &mut backend,
            double_pool: HashMap::new(),
            constants: Vec::new(),
        };
        let mut out = Vec::new();
        selector.lower_uint_to_double(&tac::Value::Variable(u), &tac::Value::Variable(d), &mut out);

        let labels: Vec<&crate::ident::Ident> = out
            .iter()
            .filter_map(|i| match i {
                Instruction::Label(l) => Some(l),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), 2, "expected the out-of-range and after labels");
        assert!(out.iter().any(|i| matches!(i, Instruction::JmpCC { cond: CondCode::L, .. })));
        assert_eq!(
            out.iter().filter(|i| matches!(i, Instruction::Cvtsi2sd { .. })).count(),
            2,
            "both the fast path and the halved-value fixup convert with cvtsi2sd"
        );
        assert!(
            out.iter().any(|i| matches!(i, Instruction::Unary { op: AsmUnaryOp::Shr, .. })),
            "the halve-and-preserve-low-bit trick shifts the high half right"
        );
        assert!(
            out.iter().any(|i| matches!(i, Instruction::Binary { op: AsmBinaryOp::BitOr, .. })),
            "the low bit is or'd back in before the fixup conversion"
        );
    }
}
