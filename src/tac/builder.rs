//! Lowers a type-checked C AST to TAC.
//!
//! The two load-bearing ideas are:
//!
//! - **Lvalue discipline** via [`ExpResult`]: lowering an expression either
//!   hands back a plain `Value` or witnesses that the expression was a
//!   pointer dereference, so that an enclosing assignment can choose
//!   between `Copy` and `Store` without the IR needing a dedicated lvalue
//!   node. The witness is consumed immediately at the call site that
//!   produced it — see `DESIGN.md` for why this is not promoted to an IR
//!   citizen.
//! - **Short-circuit lowering** of `&&`/`||` into explicit jumps, so that
//!   by the time TAC leaves the builder there is no boolean operator left
//!   that could hide control flow.

use crate::backend_symbols::TypeEnv;
use crate::error::{CodegenError, CodegenResult};
use crate::frontend_ast::{
    self as ast, BinaryOp as AstBinaryOp, CConst, CType, Decl, Expr, ExprKind, ForInit,
    FrontendSymbolTable, FunDecl, InitialValue, Program as AstProgram, Stmt, SymbolAttrs,
    UnaryOp as AstUnaryOp,
};
use crate::ident::{Ident, IdentFactory};
use crate::tac::{BinaryOp, Instruction, Program, TopLevel, UnaryOp, Value};

/// Witness for whether an expression's lowering produced a plain value or
/// a pointer that must be dereferenced to read, and stored-through to
/// write. One-shot: never stored, always matched immediately.
enum ExpResult {
    PlainOperand(Value),
    DereferencedPointer(Value),
}

/// Lowers one translation unit's worth of declarations to TAC, threading
/// the identifier factory and a type environment that starts out seeded
/// from the frontend symbol table and grows with every synthesized
/// temporary.
pub struct TacBuilder<'a> {
    factory: &'a mut IdentFactory,
    symtab: &'a FrontendSymbolTable,
    types: TypeEnv,
    body: Vec<Instruction>,
}

impl<'a> TacBuilder<'a> {
    pub fn new(factory: &'a mut IdentFactory, symtab: &'a FrontendSymbolTable) -> Self {
        Self {
            factory,
            symtab,
            types: TypeEnv::from_frontend(symtab),
            body: Vec::new(),
        }
    }

    /// Lower a whole program, returning the TAC program and the type
    /// environment the selector needs (frontend types plus every
    /// synthesized temporary's type).
    pub fn lower_program(mut self, program: &AstProgram) -> CodegenResult<(Program, TypeEnv)> {
        let mut functions = Vec::new();
        for decl in &program.decls {
            if let Decl::Fun(fun) = decl {
                if let Some(top) = self.lower_fun_decl(fun)? {
                    functions.push(top);
                }
            }
        }
        let static_vars = self.synthesize_static_variables();
        Ok((
            Program {
                static_vars,
                functions,
            },
            self.types,
        ))
    }

    fn lower_fun_decl(&mut self, fun: &FunDecl) -> CodegenResult<Option<TopLevel>> {
        let Some(block) = &fun.body else {
            return Ok(None);
        };
        let global = match self.symtab.get(fun.name) {
            Some(ast::FrontendSymbol {
                attrs: SymbolAttrs::Fun { global, .. },
                ..
            }) => *global,
            _ => {
                return Err(CodegenError::Malformed {
                    pass: "tac::builder",
                    what: format!("function {:?} missing Fun attrs", fun.name),
                })
            }
        };
        self.body = Vec::new();
        self.lower_block(block)?;
        // Every body falls off the end into an implicit `return 0`,
        // regardless of whether every path already returned explicitly.
        self.body.push(Instruction::Return(Value::Constant(CConst::Int(0))));
        Ok(Some(TopLevel::Function {
            name: fun.name,
            global,
            params: fun.params.clone(),
            body: std::mem::take(&mut self.body),
        }))
    }

    fn lower_block(&mut self, block: &ast::Block) -> CodegenResult<()> {
        for item in &block.0 {
            match item {
                ast::BlockItem::Stmt(stmt) => self.lower_stmt(stmt)?,
                ast::BlockItem::Decl(Decl::Var(var)) => self.lower_local_var_decl(var)?,
                // A nested function prototype has no TAC effect; only the
                // top-level pass over `Program::decls` emits function
                // bodies.
                ast::BlockItem::Decl(Decl::Fun(_)) => {}
            }
        }
        Ok(())
    }

    fn lower_local_var_decl(&mut self, var: &ast::VarDecl) -> CodegenResult<()> {
        // Static locals are not emitted here: they're picked up from the
        // frontend symbol table by `synthesize_static_variables`, exactly
        // like file-scope statics.
        let is_static = matches!(
            self.symtab.get(var.name),
            Some(ast::FrontendSymbol {
                attrs: SymbolAttrs::Static { .. },
                ..
            })
        );
        if is_static {
            return Ok(());
        }
        if let Some(init) = &var.init {
            let src = self.lower_expr(init)?;
            let dst = Value::Variable(var.name);
            self.emit(Instruction::Copy { src, dst });
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        match stmt {
            Stmt::Expr(e) => {
                self.lower_expr(e)?;
                Ok(())
            }
            Stmt::Return(e) => {
                let v = self.lower_expr(e)?;
                self.emit(Instruction::Return(v));
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch: None,
            } => {
                let target_false = self.factory.fresh_label("if_false");
                let condition = self.lower_expr(cond)?;
                self.emit(Instruction::JumpIfZero {
                    cond: condition,
                    target: target_false,
                });
                self.lower_stmt(then_branch)?;
                self.emit(Instruction::Label(target_false));
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch: Some(else_branch),
            } => {
                let target_else = self.factory.fresh_label("if_else");
                let target_false = self.factory.fresh_label("if_false");
                let condition = self.lower_expr(cond)?;
                self.emit(Instruction::JumpIfZero {
                    cond: condition,
                    target: target_else,
                });
                self.lower_stmt(then_branch)?;
                self.emit(Instruction::Jump(target_false));
                self.emit(Instruction::Label(target_else));
                self.lower_stmt(else_branch)?;
                self.emit(Instruction::Label(target_false));
                Ok(())
            }
            Stmt::Compound(block) => self.lower_block(block),
            Stmt::Break(loop_id) => {
                self.emit(Instruction::Jump(self.break_label(*loop_id)));
                Ok(())
            }
            Stmt::Continue(loop_id) => {
                self.emit(Instruction::Jump(self.continue_label(*loop_id)));
                Ok(())
            }
            Stmt::While {
                loop_id,
                cond,
                body,
            } => {
                let continue_label = self.continue_label(*loop_id);
                let break_label = self.break_label(*loop_id);
                self.emit(Instruction::Label(continue_label));
                let condition = self.lower_expr(cond)?;
                self.emit(Instruction::JumpIfZero {
                    cond: condition,
                    target: break_label,
                });
                self.lower_stmt(body)?;
                self.emit(Instruction::Jump(continue_label));
                self.emit(Instruction::Label(break_label));
                Ok(())
            }
            Stmt::DoWhile {
                loop_id,
                body,
                cond,
            } => {
                let start = self.factory.fresh_label("do_while_start");
                let continue_label = self.continue_label(*loop_id);
                let break_label = self.break_label(*loop_id);
                self.emit(Instruction::Label(start));
                self.lower_stmt(body)?;
                self.emit(Instruction::Label(continue_label));
                let condition = self.lower_expr(cond)?;
                self.emit(Instruction::JumpIfNotZero {
                    cond: condition,
                    target: start,
                });
                self.emit(Instruction::Label(break_label));
                Ok(())
            }
            Stmt::For {
                loop_id,
                init,
                cond,
                post,
                body,
            } => {
                let start = self.factory.fresh_label("for_start");
                let continue_label = self.continue_label(*loop_id);
                let break_label = self.break_label(*loop_id);
                match init {
                    Some(ForInit::Decl(var)) => self.lower_local_var_decl(var)?,
                    Some(ForInit::Expr(e)) => {
                        self.lower_expr(e)?;
                    }
                    None => {}
                }
                self.emit(Instruction::Label(start));
                if let Some(cond) = cond {
                    let condition = self.lower_expr(cond)?;
                    self.emit(Instruction::JumpIfZero {
                        cond: condition,
                        target: break_label,
                    });
                }
                self.lower_stmt(body)?;
                self.emit(Instruction::Label(continue_label));
                if let Some(post) = post {
                    self.lower_expr(post)?;
                }
                self.emit(Instruction::Jump(start));
                self.emit(Instruction::Label(break_label));
                Ok(())
            }
            Stmt::Labeled { label, stmt } => {
                self.emit(Instruction::Label(*label));
                self.lower_stmt(stmt)
            }
            Stmt::Goto(label) => {
                self.emit(Instruction::Jump(*label));
                Ok(())
            }
            Stmt::Null => Ok(()),
        }
    }

    fn continue_label(&mut self, loop_id: Ident) -> Ident {
        self.factory
            .intern(&format!("continue_{}", self.factory_text(loop_id)))
    }

    fn break_label(&mut self, loop_id: Ident) -> Ident {
        self.factory
            .intern(&format!("break_{}", self.factory_text(loop_id)))
    }

    fn factory_text(&self, id: Ident) -> String {
        self.factory.text(id).to_string()
    }

    /// Lower an expression to a plain value, inserting a `Load` if the
    /// expression was actually a pointer dereference.
    fn lower_expr(&mut self, expr: &Expr) -> CodegenResult<Value> {
        match self.lower_expr_result(expr)? {
            ExpResult::PlainOperand(v) => Ok(v),
            ExpResult::DereferencedPointer(ptr) => {
                let dst = self.fresh_tmp(&expr.ty);
                self.emit(Instruction::Load { src_ptr: ptr, dst });
                Ok(dst)
            }
        }
    }

    fn lower_expr_result(&mut self, expr: &Expr) -> CodegenResult<ExpResult> {
        match &expr.kind {
            ExprKind::Constant(c) => Ok(ExpResult::PlainOperand(Value::Constant(*c))),
            ExprKind::Var(name) => Ok(ExpResult::PlainOperand(Value::Variable(*name))),
            ExprKind::Deref(inner) => {
                let ptr = self.lower_expr(inner)?;
                Ok(ExpResult::DereferencedPointer(ptr))
            }
            ExprKind::AddrOf(inner) => match self.lower_expr_result(inner)? {
                ExpResult::PlainOperand(v) => {
                    let dst = self.fresh_tmp(&expr.ty);
                    self.emit(Instruction::GetAddress { src: v, dst });
                    Ok(ExpResult::PlainOperand(dst))
                }
                // Taking the address of a dereference cancels: `&*p == p`.
                ExpResult::DereferencedPointer(v) => Ok(ExpResult::PlainOperand(v)),
            },
            ExprKind::Assignment(lhs, rhs) => {
                let src = self.lower_expr(rhs)?;
                match self.lower_expr_result(lhs)? {
                    ExpResult::PlainOperand(dst) => {
                        self.emit(Instruction::Copy { src, dst });
                        Ok(ExpResult::PlainOperand(dst))
                    }
                    ExpResult::DereferencedPointer(ptr) => {
                        self.emit(Instruction::Store {
                            src,
                            dst_ptr: ptr,
                        });
                        Ok(ExpResult::PlainOperand(src))
                    }
                }
            }
            ExprKind::Cast { inner } => {
                let src = self.lower_expr(inner)?;
                let dst = self.lower_cast(&inner.ty, &expr.ty, src)?;
                Ok(ExpResult::PlainOperand(dst))
            }
            ExprKind::Unary(AstUnaryOp::Not, inner) => {
                let src = self.lower_expr(inner)?;
                let dst = self.fresh_tmp(&expr.ty);
                self.emit(Instruction::Unary {
                    op: UnaryOp::Not,
                    src,
                    dst,
                });
                Ok(ExpResult::PlainOperand(dst))
            }
            ExprKind::Unary(op, inner) => {
                let src = self.lower_expr(inner)?;
                let dst = self.fresh_tmp(&expr.ty);
                let op = match op {
                    AstUnaryOp::Complement => UnaryOp::Complement,
                    AstUnaryOp::Negate => UnaryOp::Negate,
                    AstUnaryOp::Not => unreachable!("handled above"),
                };
                self.emit(Instruction::Unary { op, src, dst });
                Ok(ExpResult::PlainOperand(dst))
            }
            ExprKind::Binary(AstBinaryOp::And, lhs, rhs) => {
                Ok(ExpResult::PlainOperand(self.lower_and(&expr.ty, lhs, rhs)?))
            }
            ExprKind::Binary(AstBinaryOp::Or, lhs, rhs) => {
                Ok(ExpResult::PlainOperand(self.lower_or(&expr.ty, lhs, rhs)?))
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let src1 = self.lower_expr(lhs)?;
                let src2 = self.lower_expr(rhs)?;
                let dst = self.fresh_tmp(&expr.ty);
                self.emit(Instruction::Binary {
                    op: lower_binary_op(*op),
                    src1,
                    src2,
                    dst,
                });
                Ok(ExpResult::PlainOperand(dst))
            }
            ExprKind::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                let target_else = self.factory.fresh_label("ternary_else");
                let target_false = self.factory.fresh_label("ternary_false");
                let dst = self.fresh_tmp(&expr.ty);
                let condition = self.lower_expr(cond)?;
                self.emit(Instruction::JumpIfZero {
                    cond: condition,
                    target: target_else,
                });
                let src_then = self.lower_expr(then_expr)?;
                self.emit(Instruction::Copy { src: src_then, dst });
                self.emit(Instruction::Jump(target_false));
                self.emit(Instruction::Label(target_else));
                let src_else = self.lower_expr(else_expr)?;
                self.emit(Instruction::Copy { src: src_else, dst });
                self.emit(Instruction::Label(target_false));
                Ok(ExpResult::PlainOperand(dst))
            }
            ExprKind::FunCall { name, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for a in args {
                    arg_values.push(self.lower_expr(a)?);
                }
                let dst = self.fresh_tmp(&expr.ty);
                self.emit(Instruction::FunCall {
                    name: *name,
                    args: arg_values,
                    dst: Some(dst),
                });
                Ok(ExpResult::PlainOperand(dst))
            }
        }
    }

    /// `&&`: `and_false`/`and_true` label pair (the second is the join
    /// point, not a second short-circuit target).
    fn lower_and(&mut self, ty: &CType, lhs: &Expr, rhs: &Expr) -> CodegenResult<Value> {
        let target_false = self.factory.fresh_label("and_false");
        let target_true = self.factory.fresh_label("and_true");
        let dst = self.fresh_tmp(ty);
        let left = self.lower_expr(lhs)?;
        self.emit(Instruction::JumpIfZero {
            cond: left,
            target: target_false,
        });
        let right = self.lower_expr(rhs)?;
        self.emit(Instruction::JumpIfZero {
            cond: right,
            target: target_false,
        });
        self.emit(Instruction::Copy {
            src: Value::Constant(CConst::Int(1)),
            dst,
        });
        self.emit(Instruction::Jump(target_true));
        self.emit(Instruction::Label(target_false));
        self.emit(Instruction::Copy {
            src: Value::Constant(CConst::Int(0)),
            dst,
        });
        self.emit(Instruction::Label(target_true));
        Ok(dst)
    }

    /// `||`: symmetric with `JumpIfNotZero`, `or_true`/`or_false` label pair.
    fn lower_or(&mut self, ty: &CType, lhs: &Expr, rhs: &Expr) -> CodegenResult<Value> {
        let target_true = self.factory.fresh_label("or_true");
        let target_false = self.factory.fresh_label("or_false");
        let dst = self.fresh_tmp(ty);
        let left = self.lower_expr(lhs)?;
        self.emit(Instruction::JumpIfNotZero {
            cond: left,
            target: target_true,
        });
        let right = self.lower_expr(rhs)?;
        self.emit(Instruction::JumpIfNotZero {
            cond: right,
            target: target_true,
        });
        self.emit(Instruction::Copy {
            src: Value::Constant(CConst::Int(0)),
            dst,
        });
        self.emit(Instruction::Jump(target_false));
        self.emit(Instruction::Label(target_true));
        self.emit(Instruction::Copy {
            src: Value::Constant(CConst::Int(1)),
            dst,
        });
        self.emit(Instruction::Label(target_false));
        Ok(dst)
    }

    /// Cast-lowering table (distilled spec §4.1).
    fn lower_cast(&mut self, from: &CType, to: &CType, src: Value) -> CodegenResult<Value> {
        if from == to {
            return Ok(src);
        }
        let dst = self.fresh_tmp(to);
        let inst = match (from, to) {
            (CType::Double, t) if !t.is_double() && t.is_signed() => {
                Instruction::DoubleToInt { src, dst }
            }
            (CType::Double, _) => Instruction::DoubleToUInt { src, dst },
            (f, CType::Double) if f.is_signed() => Instruction::IntToDouble { src, dst },
            (_, CType::Double) => Instruction::UIntToDouble { src, dst },
            (f, t) if f.size_bytes() == t.size_bytes() => Instruction::Copy { src, dst },
            (f, t) if f.size_bytes() > t.size_bytes() => Instruction::Truncate { src, dst },
            (f, _) if f.is_signed() => Instruction::SignExtend { src, dst },
            _ => Instruction::ZeroExtend { src, dst },
        };
        self.emit(inst);
        Ok(dst)
    }

    fn fresh_tmp(&mut self, ty: &CType) -> Value {
        let id = self.factory.fresh_var("tmp");
        self.types.insert(id, ty.clone());
        Value::Variable(id)
    }

    fn emit(&mut self, inst: Instruction) {
        self.body.push(inst);
    }

    /// Distilled spec §4.1: walk every `Static` symbol and emit a
    /// `StaticVariable` top level unless it has no initializer at all.
    fn synthesize_static_variables(&self) -> Vec<TopLevel> {
        let mut out = Vec::new();
        for (name, symbol) in self.symtab.iter() {
            if let SymbolAttrs::Static { global, init } = &symbol.attrs {
                let initial = match init {
                    InitialValue::NoInitializer => continue,
                    InitialValue::Tentative => zero_of(&symbol.ty),
                    InitialValue::Initial(c) => *c,
                };
                out.push(TopLevel::StaticVariable {
                    name: *name,
                    global: *global,
                    ty: symbol.ty.clone(),
                    initial,
                });
            }
        }
        out
    }
}

fn zero_of(ty: &CType) -> CConst {
    match ty {
        CType::Int => CConst::Int(0),
        CType::Long => CConst::Long(0),
        CType::UInt => CConst::UInt(0),
        CType::ULong | CType::Pointer(_) => CConst::ULong(0),
        CType::Double => CConst::Double(0.0),
        CType::Fun { .. } => unreachable!("functions are not static-initialized"),
    }
}

fn lower_binary_op(op: AstBinaryOp) -> BinaryOp {
    match op {
        AstBinaryOp::Add => BinaryOp::Add,
        AstBinaryOp::Subtract => BinaryOp::Subtract,
        AstBinaryOp::Multiply => BinaryOp::Multiply,
        AstBinaryOp::Divide => BinaryOp::Divide,
        AstBinaryOp::Remainder => BinaryOp::Remainder,
        AstBinaryOp::BitAnd => BinaryOp::BitAnd,
        AstBinaryOp::BitOr => BinaryOp::BitOr,
        AstBinaryOp::BitXor => BinaryOp::BitXor,
        AstBinaryOp::ShiftLeft => BinaryOp::ShiftLeft,
        AstBinaryOp::ShiftRight => BinaryOp::ShiftRight,
        AstBinaryOp::Equal => BinaryOp::Equal,
        AstBinaryOp::NotEqual => BinaryOp::NotEqual,
        AstBinaryOp::LessThan => BinaryOp::LessThan,
        AstBinaryOp::LessOrEqual => BinaryOp::LessOrEqual,
        AstBinaryOp::GreaterThan => BinaryOp::GreaterThan,
        AstBinaryOp::GreaterOrEqual => BinaryOp::GreaterOrEqual,
        AstBinaryOp::And | AstBinaryOp::Or => {
            unreachable!("short-circuit operators are lowered by lower_and/lower_or")
        }
    }
}
