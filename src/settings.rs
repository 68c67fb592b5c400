//! Compile-time configuration shared by every pass.
//!
//! Mirrors the distilled spec's single knob ("the allocator runs at
//! optimization level >= 2") plus the one structural choice §4.4 calls out
//! explicitly as optional: whether to run move coalescing at all.

/// How hard the backend should try to produce fast code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    /// Skip register allocation entirely: every pseudo is sent straight to
    /// the stack-frame fixer as if it had failed to color.
    None,
    /// Run the full Chaitin-Briggs allocator.
    Speed,
}

/// Flags threaded through `glue::compile_program`.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    /// Optimization level; gates whether register allocation runs at all.
    pub opt_level: OptLevel,
    /// Whether the allocator should attempt move coalescing (Briggs/George)
    /// before committing to a coloring. Only consulted when
    /// `opt_level == OptLevel::Speed`.
    pub coalesce: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            coalesce: true,
        }
    }
}

impl Flags {
    /// Flags for a debug build: no register allocation, every pseudo is a
    /// stack slot.
    pub fn no_optimization() -> Self {
        Self {
            opt_level: OptLevel::None,
            coalesce: false,
        }
    }

    /// Whether the register allocator should run at all for these flags.
    pub fn should_allocate(&self) -> bool {
        self.opt_level == OptLevel::Speed
    }
}
