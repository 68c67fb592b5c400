//! Backend-side symbol tracking.
//!
//! Two related but distinct tables live here:
//!
//! - [`TypeEnv`]: every identifier's `CType`, whether it came from the
//!   frontend symbol table or was synthesized by [`crate::tac::builder`]
//!   while lowering. The instruction selector consults this to decide
//!   operand width and int-vs-SSE class; nothing downstream of selection
//!   needs it.
//! - [`BackendSymbolTable`]: the §4.3 conversion — every frontend symbol
//!   becomes either `Fun { defined }` or `Obj { asm_type, is_static,
//!   is_constant }`. The emitter's `.L`-prefix decision (constants only)
//!   and the legalizer's static-vs-stack-slot decision both read this
//!   table; nothing else does.

use crate::asm::AsmType;
use crate::frontend_ast::{CType, FrontendSymbolTable, SymbolAttrs};
use crate::ident::Ident;
use std::collections::HashMap;

/// Maps every identifier this crate has ever seen to its C type.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    entries: HashMap<Ident, CType>,
}

impl TypeEnv {
    /// Seed a `TypeEnv` from the frontend's table, recording every symbol's
    /// declared type. Function names are included with their `Fun` type so
    /// that a `FunCall` site can look up a callee's parameter types if it
    /// ever needs to (e.g. to decide whether an argument needs widening).
    pub fn from_frontend(symtab: &FrontendSymbolTable) -> Self {
        let mut entries = HashMap::new();
        for (name, symbol) in symtab.iter() {
            entries.insert(*name, symbol.ty.clone());
        }
        Self { entries }
    }

    /// Record a synthesized temporary's type. Panics if `id` was already
    /// present with a different type, since that would mean two passes
    /// disagree about what a single identifier means.
    pub fn insert(&mut self, id: Ident, ty: CType) {
        if let Some(existing) = self.entries.get(&id) {
            debug_assert_eq!(
                *existing, ty,
                "identifier re-typed: a single Ident must denote one type for its whole lifetime"
            );
            return;
        }
        self.entries.insert(id, ty);
    }

    /// The type of `id`. Panics if `id` was never recorded — every `Value`
    /// flowing through this crate's IR is expected to have been typed at
    /// the point it was created.
    pub fn get(&self, id: Ident) -> &CType {
        self.entries
            .get(&id)
            .unwrap_or_else(|| panic!("untyped identifier {:?}", id))
    }

    pub fn try_get(&self, id: Ident) -> Option<&CType> {
        self.entries.get(&id)
    }
}

/// Project a `CType` to the backend's operand-size type. Functions have no
/// asm type; callers must not ask.
fn project_asm_type(ty: &CType) -> AsmType {
    match ty {
        CType::Int | CType::UInt => AsmType::LongWord,
        CType::Long | CType::ULong | CType::Pointer(_) => AsmType::QuadWord,
        CType::Double => AsmType::Double,
        CType::Fun { .. } => panic!("function type has no assembly operand size"),
    }
}

/// One backend symbol table entry (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSymbol {
    Fun {
        defined: bool,
    },
    Obj {
        asm_type: AsmType,
        is_static: bool,
        is_constant: bool,
    },
}

impl BackendSymbol {
    pub fn as_obj(&self) -> Option<(AsmType, bool, bool)> {
        match self {
            BackendSymbol::Obj {
                asm_type,
                is_static,
                is_constant,
            } => Some((*asm_type, *is_static, *is_constant)),
            BackendSymbol::Fun { .. } => None,
        }
    }
}

/// The whole-program backend symbol table: every frontend symbol converted
/// per §4.3, plus one `Obj { is_constant: true }` entry per double minted
/// by the selector's constant pool.
#[derive(Debug, Clone, Default)]
pub struct BackendSymbolTable {
    symbols: HashMap<Ident, BackendSymbol>,
}

impl BackendSymbolTable {
    /// Convert every frontend symbol: `Fun` attrs become `Fun { defined }`;
    /// everything else becomes `Obj { asm_type, is_static, is_constant:
    /// false }`.
    pub fn from_frontend(symtab: &FrontendSymbolTable) -> Self {
        let mut symbols = HashMap::new();
        for (name, symbol) in symtab.iter() {
            let entry = match &symbol.attrs {
                SymbolAttrs::Fun { defined, .. } => BackendSymbol::Fun { defined: *defined },
                SymbolAttrs::Static { .. } => BackendSymbol::Obj {
                    asm_type: project_asm_type(&symbol.ty),
                    is_static: true,
                    is_constant: false,
                },
                SymbolAttrs::Local => BackendSymbol::Obj {
                    asm_type: project_asm_type(&symbol.ty),
                    is_static: false,
                    is_constant: false,
                },
            };
            symbols.insert(*name, entry);
        }
        Self { symbols }
    }

    /// Register a synthesized temporary as a non-static `Obj`.
    pub fn insert_local(&mut self, id: Ident, ty: CType) {
        self.symbols.insert(
            id,
            BackendSymbol::Obj {
                asm_type: project_asm_type(&ty),
                is_static: false,
                is_constant: false,
            },
        );
    }

    /// Register an interned double constant: always static, always marked
    /// `is_constant` so the emitter knows to prefix it `.L`.
    pub fn insert_double_constant(&mut self, id: Ident) {
        self.symbols.insert(
            id,
            BackendSymbol::Obj {
                asm_type: AsmType::Double,
                is_static: true,
                is_constant: true,
            },
        );
    }

    pub fn get(&self, id: Ident) -> Option<&BackendSymbol> {
        self.symbols.get(&id)
    }

    /// Whether `id` denotes static storage, i.e. must be addressed through
    /// a `Data` operand rather than a pseudo-register/stack-slot.
    pub fn is_static(&self, id: Ident) -> bool {
        matches!(
            self.symbols.get(&id),
            Some(BackendSymbol::Obj {
                is_static: true,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend_ast::{FrontendSymbol, InitialValue};

    #[test]
    fn statics_are_distinguished_from_locals() {
        let mut factory = crate::ident::IdentFactory::new();
        let x = factory.intern("x");
        let y = factory.intern("y");
        let mut symtab = FrontendSymbolTable::new();
        symtab.insert(
            x,
            FrontendSymbol {
                ty: CType::Int,
                attrs: SymbolAttrs::Static {
                    global: true,
                    init: InitialValue::Tentative,
                },
            },
        );
        symtab.insert(
            y,
            FrontendSymbol {
                ty: CType::Long,
                attrs: SymbolAttrs::Local,
            },
        );
        let backend = BackendSymbolTable::from_frontend(&symtab);
        assert!(backend.is_static(x));
        assert!(!backend.is_static(y));
    }

    #[test]
    fn functions_carry_defined_flag() {
        let mut factory = crate::ident::IdentFactory::new();
        let f = factory.intern("f");
        let mut symtab = FrontendSymbolTable::new();
        symtab.insert(
            f,
            FrontendSymbol {
                ty: CType::Fun {
                    params: vec![],
                    ret: Box::new(CType::Int),
                },
                attrs: SymbolAttrs::Fun {
                    defined: true,
                    global: true,
                },
            },
        );
        let backend = BackendSymbolTable::from_frontend(&symtab);
        assert_eq!(backend.get(f), Some(&BackendSymbol::Fun { defined: true }));
    }

    #[test]
    fn double_constants_are_marked_constant() {
        let mut factory = crate::ident::IdentFactory::new();
        let tag = factory.fresh_tag(".Ldouble");
        let mut backend = BackendSymbolTable::default();
        backend.insert_double_constant(tag);
        let (asm_type, is_static, is_constant) = backend.get(tag).unwrap().as_obj().unwrap();
        assert_eq!(asm_type, AsmType::Double);
        assert!(is_static);
        assert!(is_constant);
    }
}
