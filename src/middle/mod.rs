//! Target-independent half of the pipeline: the typed input, three-address
//! code and everything that can be computed on it without knowing the
//! machine.

pub mod cfg;
pub mod interpreter;
pub mod liveness;
pub mod runtime;
pub mod selector;
pub mod tac;
pub mod typed;
