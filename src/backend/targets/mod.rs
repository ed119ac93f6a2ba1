//! Target descriptions: which physical registers a machine offers for each
//! role of the calling convention, its word size, syscall numbering and the
//! runtime flavour it needs.

use std::{
    fmt::{Debug, Display},
    hash::Hash,
};

use crate::{
    error::{CompileError, CompileResult},
    middle::{
        runtime::RuntimeSupport,
        tac::{ReservedRegister, SyscallName},
    },
};

pub mod mips;
pub mod x64;

/// A machine register. Implemented by the per-target register enums.
pub trait PhysicalRegister: Copy + Eq + Ord + Hash + Debug + Display + 'static {}

impl<T> PhysicalRegister for T where T: Copy + Eq + Ord + Hash + Debug + Display + 'static {}

#[derive(Debug, Clone)]
pub struct TargetDescription<R> {
    pub name: &'static str,
    /// Registers the allocator may hand out, in preference order
    pub general_purpose_registers: Vec<R>,
    pub function_argument_registers: Vec<R>,
    pub function_result_register: R,
    pub syscall_argument_registers: Vec<R>,
    pub syscall_select_and_result_register: R,
    /// Saved in every prologue regardless of use
    pub extra_saved_registers: Vec<R>,
    pub registers_clobbered_by_syscall: Vec<R>,
    /// Receives the return address on calls. Without one the call pushes
    /// the return address onto the stack.
    pub link_register: Option<R>,
    pub word_size: usize,
    pub syscall_numbers: Vec<(SyscallName, i64)>,
    pub runtime: RuntimeSupport,
}

impl<R: PhysicalRegister> TargetDescription<R> {
    pub fn syscall_number(&self, name: SyscallName) -> CompileResult<i64> {
        self.syscall_numbers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, number)| *number)
            .ok_or_else(|| {
                CompileError::unsupported(format!("syscall {name} on target {}", self.name))
            })
    }

    pub fn syscall_by_number(&self, number: i64) -> Option<SyscallName> {
        self.syscall_numbers
            .iter()
            .find(|(_, n)| *n == number)
            .map(|(name, _)| *name)
    }

    /// Physical register a calling-convention pseudo-register is bound to
    pub fn reserved_register(&self, reserved: ReservedRegister) -> CompileResult<R> {
        let positional = |registers: &[R], position: usize, resource: &'static str| {
            position
                .checked_sub(1)
                .and_then(|i| registers.get(i).copied())
                .ok_or_else(|| CompileError::ResourceExhausted {
                    context: format!("pseudo-register {reserved:?}"),
                    resource,
                    requested: position,
                    available: registers.len(),
                })
        };

        match reserved {
            ReservedRegister::FunctionResult => Ok(self.function_result_register),
            ReservedRegister::SyscallSelectAndResult => Ok(self.syscall_select_and_result_register),
            ReservedRegister::FunctionArgument(position) => positional(
                &self.function_argument_registers,
                position,
                "function argument registers",
            ),
            ReservedRegister::SyscallArgument(position) => positional(
                &self.syscall_argument_registers,
                position,
                "syscall argument registers",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    X64,
    Mips,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_registers_map_by_position() {
        let target = &*x64::X64;

        assert_eq!(
            target.reserved_register(ReservedRegister::FunctionArgument(1)).unwrap(),
            target.function_argument_registers[0]
        );
        assert_eq!(
            target.reserved_register(ReservedRegister::FunctionResult).unwrap(),
            x64::X64Register::Rax
        );
        assert!(matches!(
            target.reserved_register(ReservedRegister::FunctionArgument(9)),
            Err(CompileError::ResourceExhausted { requested: 9, available: 3, .. })
        ));
    }

    #[test]
    fn syscall_numbers_round_trip() {
        let target = &*mips::MIPS;

        let number = target.syscall_number(SyscallName::PrintInt).unwrap();
        assert_eq!(target.syscall_by_number(number), Some(SyscallName::PrintInt));
        assert!(matches!(
            target.syscall_number(SyscallName::Mmap),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn allocatable_registers_are_disjoint_from_convention_registers() {
        fn check<R: PhysicalRegister>(target: &TargetDescription<R>) {
            for register in &target.general_purpose_registers {
                assert!(!target.function_argument_registers.contains(register), "{register}");
                assert_ne!(*register, target.function_result_register);
                assert_ne!(*register, target.syscall_select_and_result_register);
                assert!(!target.extra_saved_registers.contains(register), "{register}");
            }
        }

        check(&*x64::X64);
        check(&*mips::MIPS);
    }

    #[test]
    fn targets_parse_from_their_names() {
        assert_eq!("mips".parse::<Target>(), Ok(Target::Mips));
        assert_eq!(Target::X64.to_string(), "x64");
    }
}
