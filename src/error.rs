//! Internal invariant violations.
//!
//! Everything in this crate assumes the input AST is semantically valid —
//! type-checked, every identifier resolved, every declaration's linkage
//! settled. A `CodegenError` therefore never represents a user-facing
//! mistake in the C source; it represents a bug in an earlier pass (this
//! crate's own, or the frontend's) that produced a shape this crate doesn't
//! know how to handle. The caller (the driver) is expected to print these
//! as bugs, not as diagnostics.

use crate::ident::Ident;
use thiserror::Error;

/// Failure mode for every pass in this crate.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// An exhaustive match over an AST/TAC/assembly node hit a shape the
    /// pass producing it should never have produced.
    #[error("internal error in {pass}: unexpected {what}")]
    Malformed {
        /// Name of the pass that detected the problem.
        pass: &'static str,
        /// Human-readable description of the unexpected shape.
        what: String,
    },

    /// A `Jump`/`JumpIfZero`/`JumpIfNotZero` referenced a label that does
    /// not appear anywhere in the same function body.
    #[error("unresolved jump target in function {function}: label {label} has no matching Label instruction")]
    UnresolvedLabel {
        /// The function whose body is missing the label.
        function: String,
        /// Textual form of the missing label.
        label: String,
    },

    /// A numeric conversion needed during instruction emission (e.g.
    /// decimal-to-bit-pattern for a double constant) overflowed or
    /// otherwise failed.
    #[error("numeric conversion failed while emitting instructions for {ident:?}: {reason}")]
    Conversion {
        /// The identifier being processed, if any.
        ident: Option<Ident>,
        /// What went wrong.
        reason: String,
    },

    /// The stack-frame fixer's running offset was not a multiple of 8 when
    /// the prologue was emitted.
    #[error("stack frame for function {function} is not 8-byte aligned: {size} bytes")]
    MisalignedFrame {
        /// The function whose frame failed the alignment check.
        function: String,
        /// The unaligned size that was computed.
        size: i32,
    },

    /// Register allocation could not find a color for a pseudo even after
    /// spilling — indicates an interference-graph construction bug, since
    /// any pseudo can always be spilled to the stack.
    #[error("register allocator made no progress in function {function}")]
    AllocatorStuck {
        /// The function where allocation stalled.
        function: String,
    },
}

/// Convenience alias used throughout this crate's pass boundaries.
pub type CodegenResult<T> = Result<T, CodegenError>;
