//! `mplc` lowers a fully typed MPL program to three-address code, allocates
//! registers for it and lowers it onto a concrete target. Both halves can be
//! executed: the three-address code by an interpreter and the lowered code
//! by a target simulator.

pub mod backend;
pub mod error;
pub mod execution;
pub mod index;
pub mod middle;
