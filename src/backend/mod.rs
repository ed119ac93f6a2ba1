//! The backend maps target-agnostic three-address code onto one concrete
//! machine. Each function goes through:
//! 1. Register allocation, which may insert spill code.
//! 2. Lowering, which spells out the calling convention and the frame.
//!
//! The result is a [`lir::TargetProgram`] that can be printed or run by the
//! [`simulator`].

use log::debug;

use crate::{
    backend::{
        lir::TargetProgram,
        lowering::{entry_point_cleanup, lower},
        register_allocation::allocate,
        targets::{PhysicalRegister, TargetDescription},
    },
    error::CompileResult,
    middle::{selector::select_program, tac, typed},
};

pub mod lir;
pub mod lowering;
pub mod pretty_print;
pub mod register_allocation;
pub mod simulator;
pub mod stack_usage;
pub mod targets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Precede each lowered statement with the statement it came from
    pub emit_comments: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            emit_comments: true,
        }
    }
}

/// Allocates and lowers every function of `program`, entry point first
pub fn compile<R: PhysicalRegister>(
    program: &tac::Program,
    target: &TargetDescription<R>,
    options: &CodegenOptions,
) -> CompileResult<TargetProgram<R>> {
    let argument_registers = target.function_argument_registers.len();
    let final_cleanup = entry_point_cleanup(target)?;

    let mut functions = Vec::with_capacity(program.functions.len() + 1);

    let entry = allocate(&program.main, &target.general_purpose_registers, argument_registers)?;
    functions.push(lower(&entry, target, options, Some(&final_cleanup))?);

    for function in &program.functions {
        let allocated = allocate(function, &target.general_purpose_registers, argument_registers)?;
        functions.push(lower(&allocated, target, options, None)?);
    }

    debug!("compiled {} functions for {}", functions.len(), target.name);

    Ok(TargetProgram {
        globals: program.globals.values().cloned().collect(),
        string_literals: program.string_literals.clone(),
        functions,
    })
}

/// Selects instructions for a typed program using the target's runtime, then
/// compiles the result
pub fn compile_typed<R: PhysicalRegister>(
    program: &typed::Program,
    target: &TargetDescription<R>,
    options: &CodegenOptions,
) -> CompileResult<(tac::Program, TargetProgram<R>)> {
    let selected = select_program(program, &target.runtime)?;
    let compiled = compile(&selected, target, options)?;
    Ok((selected, compiled))
}
