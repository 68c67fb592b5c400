//! End-to-end pipeline tests: hand-built type-checked ASTs driven all the
//! way through `compile_program` to final legalized assembly. Each test
//! names the scenario it exercises rather than asserting on exact opcode
//! sequences, since legalization and allocation are free to choose among
//! several legal encodings.

use subc_backend::asm::{AsmType, Instruction, Operand, Program, Reg, TopLevel};
use subc_backend::frontend_ast::{
    BinaryOp, Block, BlockItem, CConst, CType, Decl, Expr, ExprKind, FrontendSymbol,
    FrontendSymbolTable, FunDecl, Stmt, SymbolAttrs, UnaryOp, VarDecl,
};
use subc_backend::ident::{Ident, IdentFactory};
use subc_backend::settings::Flags;
use subc_backend::compile_program;

fn const_expr(c: CConst) -> Expr {
    Expr {
        ty: c.ty(),
        kind: ExprKind::Constant(c),
    }
}

fn var_expr(name: Ident, ty: CType) -> Expr {
    Expr {
        kind: ExprKind::Var(name),
        ty,
    }
}

fn declare_fun(
    symtab: &mut FrontendSymbolTable,
    name: Ident,
    params: Vec<CType>,
    ret: CType,
) {
    symtab.insert(
        name,
        FrontendSymbol {
            ty: CType::Fun { params, ret: Box::new(ret) },
            attrs: SymbolAttrs::Fun { defined: true, global: true },
        },
    );
}

fn declare_local(symtab: &mut FrontendSymbolTable, name: Ident, ty: CType) {
    symtab.insert(name, FrontendSymbol { ty, attrs: SymbolAttrs::Local });
}

fn only_function(program: &Program) -> &[Instruction] {
    let mut funs = program.top_levels.iter().filter_map(|tl| match tl {
        TopLevel::Function { instructions, .. } => Some(instructions.as_slice()),
        _ => None,
    });
    let body = funs.next().expect("expected a compiled function");
    assert!(funs.next().is_none(), "expected exactly one function");
    body
}

/// Every pseudo must be gone by the time legalization is done: the selector
/// only ever emits `Operand::Pseudo`, and `legalize::replace_pseudos`
/// followed by allocation must resolve every one of them to a `Register`,
/// `Stack`, `Data`, or `Memory` operand.
fn assert_no_pseudos_remain(body: &[Instruction]) {
    for inst in body {
        for op in inst.uses() {
            assert!(!op.is_pseudo(), "pseudo operand survived legalization: {:?}", inst);
        }
        if let Some(op) = inst.def() {
            assert!(!op.is_pseudo(), "pseudo operand survived legalization: {:?}", inst);
        }
    }
}

/// Scenario A: `int main(void) { return 2 + 3; }` — the minimal round trip
/// from AST through to a framed, legalized function.
#[test]
fn scenario_a_integer_return_round_trips_to_framed_assembly() {
    let mut factory = IdentFactory::new();
    let main = factory.intern("main");
    let mut symtab = FrontendSymbolTable::new();
    declare_fun(&mut symtab, main, vec![], CType::Int);

    let body = Block(vec![BlockItem::Stmt(Stmt::Return(Expr {
        kind: ExprKind::Binary(
            BinaryOp::Add,
            Box::new(const_expr(CConst::Int(2))),
            Box::new(const_expr(CConst::Int(3))),
        ),
        ty: CType::Int,
    }))]);
    let program = subc_backend::frontend_ast::Program {
        decls: vec![Decl::Fun(FunDecl { name: main, params: vec![], body: Some(body) })],
    };

    let asm = compile_program(&program, &symtab, &mut factory, &Flags::default()).unwrap();
    let instructions = only_function(&asm);

    assert!(matches!(instructions[0], Instruction::Push(Operand::Register(Reg::Bp))));
    assert!(matches!(
        instructions.last(),
        Some(Instruction::Ret)
    ));
    assert!(instructions.iter().any(|i| matches!(i, Instruction::Pop(Reg::Bp))));
    assert_no_pseudos_remain(instructions);
}

/// Scenario: a function taking more than six integer parameters must
/// receive its seventh and eighth from incoming stack slots rather than
/// argument registers, and must still produce a fully legalized body.
#[test]
fn eighth_integer_parameter_is_read_from_the_stack() {
    let mut factory = IdentFactory::new();
    let f = factory.intern("many_args");
    let params: Vec<Ident> = (0..8).map(|i| factory.intern(&format!("p{i}"))).collect();
    let mut symtab = FrontendSymbolTable::new();
    declare_fun(&mut symtab, f, vec![CType::Int; 8], CType::Int);
    for &p in &params {
        declare_local(&mut symtab, p, CType::Int);
    }

    let ret_last = Stmt::Return(var_expr(params[7], CType::Int));
    let program = subc_backend::frontend_ast::Program {
        decls: vec![Decl::Fun(FunDecl {
            name: f,
            params: params.clone(),
            body: Some(Block(vec![BlockItem::Stmt(ret_last)])),
        })],
    };

    let asm = compile_program(&program, &symtab, &mut factory, &Flags::no_optimization()).unwrap();
    let instructions = only_function(&asm);
    assert_no_pseudos_remain(instructions);

    // With allocation disabled every pseudo becomes a stack slot, so the
    // eighth parameter's incoming value (originally staged from the
    // caller's stack) is itself a `Stack` operand somewhere in the body.
    assert!(instructions.iter().any(|i| matches!(
        i,
        Instruction::Mov { dst: Operand::Stack { .. }, .. }
    )));
}

/// Scenario C: `void set(int *p, int v) { *p = v; }` — pointer store must
/// still legalize cleanly to a concrete `Memory` addressing mode with no
/// pseudo left over, at both optimization levels.
#[test]
fn pointer_store_legalizes_to_a_concrete_memory_operand() {
    for flags in [Flags::no_optimization(), Flags::default()] {
        let mut factory = IdentFactory::new();
        let set = factory.intern("set");
        let p = factory.intern("p");
        let v = factory.intern("v");
        let mut symtab = FrontendSymbolTable::new();
        declare_fun(
            &mut symtab,
            set,
            vec![CType::Pointer(Box::new(CType::Int)), CType::Int],
            CType::Int,
        );
        declare_local(&mut symtab, p, CType::Pointer(Box::new(CType::Int)));
        declare_local(&mut symtab, v, CType::Int);

        let assign = Expr {
            kind: ExprKind::Assignment(
                Box::new(Expr {
                    kind: ExprKind::Deref(Box::new(var_expr(
                        p,
                        CType::Pointer(Box::new(CType::Int)),
                    ))),
                    ty: CType::Int,
                }),
                Box::new(var_expr(v, CType::Int)),
            ),
            ty: CType::Int,
        };
        let program = subc_backend::frontend_ast::Program {
            decls: vec![Decl::Fun(FunDecl {
                name: set,
                params: vec![p, v],
                body: Some(Block(vec![BlockItem::Stmt(Stmt::Expr(assign))])),
            })],
        };

        let asm = compile_program(&program, &symtab, &mut factory, &flags).unwrap();
        let instructions = only_function(&asm);
        assert_no_pseudos_remain(instructions);
        assert!(
            instructions.iter().any(|i| matches!(
                i,
                Instruction::Mov { dst: Operand::Memory { .. }, .. }
            )),
            "expected the store to land through a Memory operand"
        );
    }
}

/// A function whose locals outnumber the twelve allocatable integer
/// registers must still compile: the excess becomes genuine spills, routed
/// to stack slots by the legalizer rather than left dangling as pseudos.
#[test]
fn more_locals_than_registers_spills_cleanly() {
    let mut factory = IdentFactory::new();
    let f = factory.intern("many_locals");
    let mut symtab = FrontendSymbolTable::new();
    declare_fun(&mut symtab, f, vec![], CType::Int);

    let mut items = Vec::new();
    let mut names = Vec::new();
    for i in 0..20 {
        let name = factory.intern(&format!("local{i}"));
        declare_local(&mut symtab, name, CType::Int);
        items.push(BlockItem::Decl(Decl::Var(VarDecl {
            name,
            init: Some(const_expr(CConst::Int(i))),
        })));
        names.push(name);
    }
    // Sum every local so none of them are dead (which would let the
    // allocator discard them instead of actually needing to place them).
    let mut sum = var_expr(names[0], CType::Int);
    for &name in &names[1..] {
        sum = Expr {
            kind: ExprKind::Binary(BinaryOp::Add, Box::new(sum), Box::new(var_expr(name, CType::Int))),
            ty: CType::Int,
        };
    }
    items.push(BlockItem::Stmt(Stmt::Return(sum)));

    let program = subc_backend::frontend_ast::Program {
        decls: vec![Decl::Fun(FunDecl { name: f, params: vec![], body: Some(Block(items)) })],
    };

    let asm = compile_program(&program, &symtab, &mut factory, &Flags::default()).unwrap();
    let instructions = only_function(&asm);
    assert_no_pseudos_remain(instructions);
    // A frame big enough to hold spilled locals must have been allocated.
    assert!(instructions.iter().any(|i| matches!(i, Instruction::AllocateStack(n) if *n > 0)));
}

/// Double-typed locals and arithmetic must route through the SSE register
/// file / `Double` stack slots, never the integer one, end to end.
#[test]
fn double_arithmetic_stays_in_the_double_type() {
    let mut factory = IdentFactory::new();
    let f = factory.intern("avg");
    let a = factory.intern("a");
    let b = factory.intern("b");
    let mut symtab = FrontendSymbolTable::new();
    declare_fun(&mut symtab, f, vec![CType::Double, CType::Double], CType::Double);
    declare_local(&mut symtab, a, CType::Double);
    declare_local(&mut symtab, b, CType::Double);

    let sum = Expr {
        kind: ExprKind::Binary(
            BinaryOp::Add,
            Box::new(var_expr(a, CType::Double)),
            Box::new(var_expr(b, CType::Double)),
        ),
        ty: CType::Double,
    };
    let program = subc_backend::frontend_ast::Program {
        decls: vec![Decl::Fun(FunDecl {
            name: f,
            params: vec![a, b],
            body: Some(Block(vec![BlockItem::Stmt(Stmt::Return(sum))])),
        })],
    };

    let asm = compile_program(&program, &symtab, &mut factory, &Flags::default()).unwrap();
    let instructions = only_function(&asm);
    assert_no_pseudos_remain(instructions);
    assert!(instructions
        .iter()
        .any(|i| matches!(i, Instruction::Binary { ty: AsmType::Double, .. })));
}

/// A unary `!` on an `int` must lower through the integer zero-comparison
/// path, producing a `SetCC` rather than touching any SSE machinery.
#[test]
fn logical_not_on_int_uses_setcc() {
    let mut factory = IdentFactory::new();
    let f = factory.intern("is_zero");
    let x = factory.intern("x");
    let mut symtab = FrontendSymbolTable::new();
    declare_fun(&mut symtab, f, vec![CType::Int], CType::Int);
    declare_local(&mut symtab, x, CType::Int);

    let not_x = Expr {
        kind: ExprKind::Unary(UnaryOp::Not, Box::new(var_expr(x, CType::Int))),
        ty: CType::Int,
    };
    let program = subc_backend::frontend_ast::Program {
        decls: vec![Decl::Fun(FunDecl {
            name: f,
            params: vec![x],
            body: Some(Block(vec![BlockItem::Stmt(Stmt::Return(not_x))])),
        })],
    };

    let asm = compile_program(&program, &symtab, &mut factory, &Flags::default()).unwrap();
    let instructions = only_function(&asm);
    assert_no_pseudos_remain(instructions);
    assert!(instructions.iter().any(|i| matches!(i, Instruction::SetCC { .. })));
}
