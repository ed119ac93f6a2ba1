use thiserror::Error;

use crate::middle::tac::parser::ParseError;

/// Errors raised while compiling a program. User-facing type errors never
/// reach this point; everything here is either a gap in the compiler or a
/// limit of the selected target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("{context} needs {requested} {resource} but the target only provides {available}")]
    ResourceExhausted {
        context: String,
        resource: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type CompileResult<T> = Result<T, CompileError>;

impl CompileError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::InternalInvariant(what.into())
    }
}
