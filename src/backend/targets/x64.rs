use once_cell::sync::Lazy;
use strum::Display;

use crate::{
    backend::targets::TargetDescription,
    middle::{runtime::RuntimeSupport, tac::SyscallName},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum X64Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// x86-64 Linux. The return address lives on the stack and the runtime
/// talks to the kernel through `mmap` and `write`.
pub static X64: Lazy<TargetDescription<X64Register>> = Lazy::new(|| {
    use X64Register::*;

    TargetDescription {
        name: "x64",
        general_purpose_registers: vec![R11, R12, R13, R14, R15, Rdi, Rsi, Rbx],
        function_argument_registers: vec![R8, R9, R10],
        function_result_register: Rax,
        syscall_argument_registers: vec![Rdi, Rsi, Rdx, R10, R8, R9],
        syscall_select_and_result_register: Rax,
        extra_saved_registers: vec![],
        registers_clobbered_by_syscall: vec![R11, Rcx],
        link_register: None,
        word_size: 8,
        syscall_numbers: vec![
            (SyscallName::Read, 0),
            (SyscallName::Write, 1),
            (SyscallName::Mmap, 9),
            (SyscallName::Exit, 60),
        ],
        runtime: RuntimeSupport::mmap_and_write(8),
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_print_in_assembler_syntax() {
        assert_eq!(X64Register::R11.to_string(), "r11");
        assert_eq!(X64Register::Rax.to_string(), "rax");
    }

    #[test]
    fn mmap_takes_six_syscall_arguments() {
        assert_eq!(X64.syscall_argument_registers.len(), 6);
        assert!(X64.link_register.is_none());
    }
}
