use once_cell::sync::Lazy;
use strum::Display;

use crate::{
    backend::targets::TargetDescription,
    middle::{runtime::RuntimeSupport, tac::SyscallName},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum MipsRegister {
    #[strum(serialize = "$v0")]
    V0,
    #[strum(serialize = "$a0")]
    A0,
    #[strum(serialize = "$a1")]
    A1,
    #[strum(serialize = "$t1")]
    T1,
    #[strum(serialize = "$t2")]
    T2,
    #[strum(serialize = "$t3")]
    T3,
    #[strum(serialize = "$t4")]
    T4,
    #[strum(serialize = "$t5")]
    T5,
    #[strum(serialize = "$t6")]
    T6,
    #[strum(serialize = "$t7")]
    T7,
    #[strum(serialize = "$t8")]
    T8,
    #[strum(serialize = "$t9")]
    T9,
    #[strum(serialize = "$s0")]
    S0,
    #[strum(serialize = "$s1")]
    S1,
    #[strum(serialize = "$s2")]
    S2,
    #[strum(serialize = "$sp")]
    Sp,
    #[strum(serialize = "$ra")]
    Ra,
}

/// 32-bit MIPS under a SPIM-style syscall interface
pub static MIPS: Lazy<TargetDescription<MipsRegister>> = Lazy::new(|| {
    use MipsRegister::*;

    TargetDescription {
        name: "mips",
        general_purpose_registers: vec![T1, T2, T3, T4, T5, T6, T7, T8, T9],
        function_argument_registers: vec![S0, S1, S2],
        function_result_register: A0,
        syscall_argument_registers: vec![A0, A1],
        syscall_select_and_result_register: V0,
        extra_saved_registers: vec![Ra],
        registers_clobbered_by_syscall: vec![],
        link_register: Some(Ra),
        word_size: 4,
        syscall_numbers: vec![
            (SyscallName::PrintInt, 1),
            (SyscallName::Print, 4),
            (SyscallName::ReadInt, 5),
            (SyscallName::Sbrk, 9),
            (SyscallName::Exit, 17),
        ],
        runtime: RuntimeSupport::sbrk_and_print(4),
    }
});
