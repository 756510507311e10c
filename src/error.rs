//! Errors produced while lowering an IR3 program.
//!
//! All of these are terminal: the compiler reports the first one it runs
//! into and aborts without emitting partial IR2.

use thiserror::Error;

use crate::parser::ParseError;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A name reference that has no binding (variable, label or function).
    #[error("unresolved reference to '{name}' in function '@{function}'")]
    UnresolvedReference { name: String, function: String },

    /// A branch whose target label is not defined in the same function.
    #[error("branch to unknown label ':{label}' in function '@{function}'")]
    UnknownBranchTarget { label: String, function: String },

    /// A call whose argument count the callee does not accept.
    #[error("'{callee}' cannot be called with {count} argument(s)")]
    ArityMismatch { callee: String, count: usize },

    /// The tile catalogue cannot cover a computation tree.
    #[error("no tile matches computation tree '{tree}' in function '@{function}'")]
    NoMatchingTile { function: String, tree: String },

    /// A program model invariant did not hold.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

impl CompileError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::InternalInvariantViolation(message.into())
    }
}
