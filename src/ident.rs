//! Interned identifiers shared across every pass.
//!
//! Names that flow through the pipeline — C-level identifiers, synthesized
//! temporaries, labels, and static-constant tags — are never passed around
//! as owned `String`s. Instead they are interned once into an `Ident`, a
//! 32-bit entity reference (see `cranelift_entity::EntityRef`), and every
//! later pass compares/hashes/copies the cheap index instead of the string.
//!
//! The `IdentFactory` is the single owner of the interning table for a whole
//! compilation. It is also responsible for minting fresh, guaranteed-unique
//! names: every identifier it mints carries a `.`-delimited numeric suffix
//! that cannot collide with a parsed source identifier (those never contain
//! `.`) or with any other minted identifier (the counter only increases).

use cranelift_entity::entity_impl;
use std::collections::HashMap;

/// An interned identifier: a C source name, a synthesized temporary, a
/// label, or a static-constant tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(u32);
entity_impl!(Ident, "id");

/// Owns the string-interning table and the fresh-name counters for one
/// compilation. Append-only: once an identifier is interned its `Ident`
/// remains valid (and its text unchanged) for the rest of the compilation.
#[derive(Default)]
pub struct IdentFactory {
    strings: Vec<Box<str>>,
    lookup: HashMap<Box<str>, Ident>,
    next_label: u32,
    next_var: u32,
    next_tag: u32,
}

impl IdentFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning the same `Ident` if it has been interned
    /// before.
    pub fn intern(&mut self, text: &str) -> Ident {
        if let Some(&id) = self.lookup.get(text) {
            return id;
        }
        let id = Ident::new(self.strings.len());
        self.strings.push(text.into());
        self.lookup.insert(text.into(), id);
        id
    }

    /// Resolve an `Ident` back to its text.
    pub fn text(&self, id: Ident) -> &str {
        &self.strings[id.index()]
    }

    /// Mint a fresh label identifier with the given kind-specific prefix,
    /// e.g. `fresh_label("if_false")` -> `if_false.3`.
    pub fn fresh_label(&mut self, prefix: &str) -> Ident {
        let n = self.next_label;
        self.next_label += 1;
        self.intern(&format!("{}.{}", prefix, n))
    }

    /// Mint a fresh variable (temporary) identifier, e.g. `fresh_var("tmp")`
    /// -> `tmp.7`.
    pub fn fresh_var(&mut self, prefix: &str) -> Ident {
        let n = self.next_var;
        self.next_var += 1;
        self.intern(&format!("{}.{}", prefix, n))
    }

    /// Mint a fresh structure-tag identifier, e.g. for a static double
    /// constant: `fresh_tag(".Ldouble")` -> `.Ldouble.2`.
    pub fn fresh_tag(&mut self, prefix: &str) -> Ident {
        let n = self.next_tag;
        self.next_tag += 1;
        self.intern(&format!("{}.{}", prefix, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut f = IdentFactory::new();
        let a = f.intern("foo");
        let b = f.intern("foo");
        assert_eq!(a, b);
        assert_eq!(f.text(a), "foo");
    }

    #[test]
    fn fresh_names_never_collide() {
        let mut f = IdentFactory::new();
        let a = f.fresh_var("tmp");
        let b = f.fresh_var("tmp");
        assert_ne!(a, b);
        assert_eq!(f.text(a), "tmp.0");
        assert_eq!(f.text(b), "tmp.1");
    }

    #[test]
    fn different_kinds_have_independent_counters() {
        let mut f = IdentFactory::new();
        let l0 = f.fresh_label("if_false");
        let v0 = f.fresh_var("tmp");
        assert_eq!(f.text(l0), "if_false.0");
        assert_eq!(f.text(v0), "tmp.0");
    }
}
