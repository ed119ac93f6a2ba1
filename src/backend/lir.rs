//! Low-level IR: three-address code over physical registers, plus the
//! stack and calling-convention operations that only exist once a frame
//! layout is known. Stack offsets count words upwards from the current
//! stack pointer.

use crate::{
    backend::stack_usage::StackUsage,
    middle::tac::{GlobalInfo, StringLiteral},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatementKind<R> {
    Empty,
    Move {
        from: R,
        to: R,
    },
    LoadImmediate {
        value: i64,
        destination: R,
    },
    AddImmediate {
        register: R,
        amount: i64,
    },
    Add {
        lhs: R,
        rhs: R,
        destination: R,
    },
    Subtract {
        lhs: R,
        rhs: R,
        destination: R,
    },
    Multiply {
        lhs: R,
        rhs: R,
        destination: R,
    },
    Increment {
        register: R,
    },
    Label {
        name: String,
    },
    FunctionLabel {
        name: String,
    },
    Goto {
        label: String,
    },
    GotoIfEqual {
        lhs: R,
        rhs: R,
        label: String,
    },
    GotoIfNotEqual {
        lhs: R,
        rhs: R,
        label: String,
    },
    GotoIfZero {
        register: R,
        label: String,
    },
    GotoIfGreater {
        lhs: R,
        rhs: R,
        label: String,
    },
    LoadGlobal {
        from: String,
        to: R,
    },
    StoreGlobal {
        from: R,
        to: String,
    },
    LoadMemory {
        from: R,
        to: R,
        offset: i64,
    },
    StoreMemory {
        from: R,
        address: R,
        offset: i64,
    },
    LoadMemoryByte {
        address: R,
        to: R,
    },
    StoreMemoryByte {
        address: R,
        contents: R,
    },
    StoreZeroToMemory {
        address: R,
        offset: i64,
    },
    LoadSymbolAddress {
        symbol_name: String,
        to: R,
    },
    Syscall,
    CallByName {
        function: String,
    },
    CallByRegister {
        function: R,
    },
    Return,
    /// `to = sp + offset` words
    LoadStackOffset {
        offset: usize,
        to: R,
    },
    StackLoad {
        offset: usize,
        to: R,
    },
    StackStore {
        from: R,
        offset: usize,
    },
    StackReserve {
        words: usize,
    },
    StackRelease {
        words: usize,
    },
    Push {
        register: R,
    },
    Pop {
        register: R,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatement<R> {
    pub kind: TargetStatementKind<R>,
    pub why: String,
}

impl<R> TargetStatement<R> {
    pub fn new(kind: TargetStatementKind<R>, why: impl Into<String>) -> Self {
        Self {
            kind,
            why: why.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFunction<R> {
    pub name: String,
    pub instructions: Vec<TargetStatement<R>>,
    pub stack_usage: StackUsage<R>,
}

/// A whole program ready to be emitted or simulated. The entry point comes
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProgram<R> {
    pub globals: Vec<GlobalInfo>,
    pub string_literals: Vec<StringLiteral>,
    pub functions: Vec<TargetFunction<R>>,
}
