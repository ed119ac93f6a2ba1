//! Three-address code. Every instruction names at most two source registers
//! and one destination, control flow is reduced to labels and conditional
//! jumps, and registers are unlimited virtual names that the allocator later
//! maps onto the physical registers of a target.

use std::{collections::BTreeMap, rc::Rc};

use strum::{Display, EnumString};

pub mod parser;
pub mod pretty_print;

/// A virtual register. Two registers are the same register iff their names
/// match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    name: Rc<str>,
}

/// Calling-convention pseudo-registers that exist before allocation and are
/// bound to fixed physical registers by the target description. Positions
/// are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedRegister {
    FunctionResult,
    FunctionArgument(usize),
    SyscallSelectAndResult,
    SyscallArgument(usize),
}

impl Register {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Rc::from(name.as_ref()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_result() -> Self {
        Self::new("functionResult")
    }

    pub fn function_argument(position: usize) -> Self {
        Self::new(format!("functionArgument{position}"))
    }

    pub fn syscall_select_and_result() -> Self {
        Self::new("syscallSelectAndResult")
    }

    pub fn syscall_argument(position: usize) -> Self {
        Self::new(format!("syscallArgument{position}"))
    }

    pub fn reserved(&self) -> Option<ReservedRegister> {
        let position = |prefix: &str| {
            self.name
                .strip_prefix(prefix)
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n >= 1)
        };

        match &*self.name {
            "functionResult" => Some(ReservedRegister::FunctionResult),
            "syscallSelectAndResult" => Some(ReservedRegister::SyscallSelectAndResult),
            _ => position("functionArgument")
                .map(ReservedRegister::FunctionArgument)
                .or_else(|| position("syscallArgument").map(ReservedRegister::SyscallArgument)),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum SyscallName {
    /// Print a NUL-terminated string
    Print,
    /// Write `length` bytes of a buffer to a file descriptor
    Write,
    PrintInt,
    Read,
    ReadInt,
    Sbrk,
    Mmap,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallArgument {
    Register(Register),
    Immediate(i64),
}

/// Where a value lives in the current stack frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StackLocation {
    /// A spill slot owned by this function
    Spill(usize),
    /// The nth argument passed on the stack by the caller
    Argument(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Free-text note for diagnostics, with no semantic effect
    pub why: String,
}

impl Statement {
    pub fn new(kind: StatementKind, why: impl Into<String>) -> Self {
        Self {
            kind,
            why: why.into(),
        }
    }

    pub fn comment(why: impl Into<String>) -> Self {
        Self::new(StatementKind::Empty, why)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Empty,
    Move {
        from: Register,
        to: Register,
    },
    LoadImmediate {
        value: i64,
        destination: Register,
    },
    AddImmediate {
        register: Register,
        amount: i64,
    },
    Add {
        lhs: Register,
        rhs: Register,
        destination: Register,
    },
    Subtract {
        lhs: Register,
        rhs: Register,
        destination: Register,
    },
    Multiply {
        lhs: Register,
        rhs: Register,
        destination: Register,
    },
    Increment {
        register: Register,
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
        lhs: Register,
        rhs: Register,
        label: String,
    },
    GotoIfNotEqual {
        lhs: Register,
        rhs: Register,
        label: String,
    },
    GotoIfZero {
        register: Register,
        label: String,
    },
    GotoIfGreater {
        lhs: Register,
        rhs: Register,
        label: String,
    },
    LoadGlobal {
        from: String,
        to: Register,
    },
    StoreGlobal {
        from: Register,
        to: String,
    },
    LoadMemory {
        from: Register,
        to: Register,
        offset: i64,
    },
    StoreMemory {
        from: Register,
        address: Register,
        offset: i64,
    },
    LoadMemoryByte {
        address: Register,
        to: Register,
    },
    StoreMemoryByte {
        address: Register,
        contents: Register,
    },
    StoreZeroToMemory {
        address: Register,
        offset: i64,
    },
    LoadSymbolAddress {
        symbol_name: String,
        to: Register,
    },
    /// Reserve `bytes` of stack space for the rest of the function
    Alloca {
        bytes: i64,
        register: Register,
    },
    CallByName {
        function: String,
        arguments: Vec<Register>,
        destination: Option<Register>,
    },
    CallByRegister {
        function: Register,
        arguments: Vec<Register>,
        destination: Option<Register>,
    },
    Return {
        register: Option<Register>,
    },
    Syscall {
        name: SyscallName,
        arguments: Vec<SyscallArgument>,
        destination: Option<Register>,
    },
    StackLoad {
        location: StackLocation,
        to: Register,
    },
    StackStore {
        from: Register,
        location: StackLocation,
    },
}

impl StatementKind {
    /// Registers whose current value this statement reads
    pub fn reads(&self) -> Vec<Register> {
        use StatementKind::*;

        match self {
            Empty
            | LoadImmediate { .. }
            | Label { .. }
            | FunctionLabel { .. }
            | Goto { .. }
            | LoadGlobal { .. }
            | LoadSymbolAddress { .. }
            | Alloca { .. }
            | StackLoad { .. } => vec![],
            Move { from, .. } => vec![from.clone()],
            AddImmediate { register, .. } | Increment { register } => vec![register.clone()],
            Add { lhs, rhs, .. }
            | Subtract { lhs, rhs, .. }
            | Multiply { lhs, rhs, .. }
            | GotoIfEqual { lhs, rhs, .. }
            | GotoIfNotEqual { lhs, rhs, .. }
            | GotoIfGreater { lhs, rhs, .. } => vec![lhs.clone(), rhs.clone()],
            GotoIfZero { register, .. } => vec![register.clone()],
            StoreGlobal { from, .. } => vec![from.clone()],
            LoadMemory { from, .. } => vec![from.clone()],
            StoreMemory { from, address, .. } => vec![from.clone(), address.clone()],
            LoadMemoryByte { address, .. } => vec![address.clone()],
            StoreMemoryByte { address, contents } => vec![address.clone(), contents.clone()],
            StoreZeroToMemory { address, .. } => vec![address.clone()],
            CallByName { arguments, .. } => arguments.clone(),
            CallByRegister {
                function,
                arguments,
                ..
            } => std::iter::once(function.clone())
                .chain(arguments.iter().cloned())
                .collect(),
            Return { register } => register.iter().cloned().collect(),
            Syscall { arguments, .. } => arguments
                .iter()
                .filter_map(|argument| match argument {
                    SyscallArgument::Register(register) => Some(register.clone()),
                    SyscallArgument::Immediate(_) => None,
                })
                .collect(),
            StackStore { from, .. } => vec![from.clone()],
        }
    }

    /// Registers this statement assigns a new value to
    pub fn writes(&self) -> Vec<Register> {
        use StatementKind::*;

        match self {
            Move { to, .. }
            | LoadGlobal { to, .. }
            | LoadMemory { to, .. }
            | LoadMemoryByte { to, .. }
            | LoadSymbolAddress { to, .. }
            | StackLoad { to, .. } => vec![to.clone()],
            LoadImmediate { destination, .. }
            | Add { destination, .. }
            | Subtract { destination, .. }
            | Multiply { destination, .. } => vec![destination.clone()],
            AddImmediate { register, .. } | Increment { register } | Alloca { register, .. } => {
                vec![register.clone()]
            }
            CallByName { destination, .. }
            | CallByRegister { destination, .. }
            | Syscall { destination, .. } => destination.iter().cloned().collect(),
            Empty
            | Label { .. }
            | FunctionLabel { .. }
            | Goto { .. }
            | GotoIfEqual { .. }
            | GotoIfNotEqual { .. }
            | GotoIfZero { .. }
            | GotoIfGreater { .. }
            | StoreGlobal { .. }
            | StoreMemory { .. }
            | StoreMemoryByte { .. }
            | StoreZeroToMemory { .. }
            | Return { .. }
            | StackStore { .. } => vec![],
        }
    }

    /// Every register operand, read or written
    pub fn registers_mut(&mut self) -> Vec<&mut Register> {
        use StatementKind::*;

        match self {
            Empty | Label { .. } | FunctionLabel { .. } | Goto { .. } => vec![],
            Move { from, to } => vec![from, to],
            LoadImmediate { destination, .. } => vec![destination],
            AddImmediate { register, .. } | Increment { register } | Alloca { register, .. } => {
                vec![register]
            }
            Add {
                lhs,
                rhs,
                destination,
            }
            | Subtract {
                lhs,
                rhs,
                destination,
            }
            | Multiply {
                lhs,
                rhs,
                destination,
            } => vec![lhs, rhs, destination],
            GotoIfEqual { lhs, rhs, .. }
            | GotoIfNotEqual { lhs, rhs, .. }
            | GotoIfGreater { lhs, rhs, .. } => vec![lhs, rhs],
            GotoIfZero { register, .. } => vec![register],
            LoadGlobal { to, .. } | LoadSymbolAddress { to, .. } | StackLoad { to, .. } => vec![to],
            StoreGlobal { from, .. } | StackStore { from, .. } => vec![from],
            LoadMemory { from, to, .. } => vec![from, to],
            StoreMemory { from, address, .. } => vec![from, address],
            LoadMemoryByte { address, to } => vec![address, to],
            StoreMemoryByte { address, contents } => vec![address, contents],
            StoreZeroToMemory { address, .. } => vec![address],
            CallByName {
                arguments,
                destination,
                ..
            } => arguments.iter_mut().chain(destination.iter_mut()).collect(),
            CallByRegister {
                function,
                arguments,
                destination,
            } => std::iter::once(function)
                .chain(arguments.iter_mut())
                .chain(destination.iter_mut())
                .collect(),
            Return { register } => register.iter_mut().collect(),
            Syscall {
                arguments,
                destination,
                ..
            } => arguments
                .iter_mut()
                .filter_map(|argument| match argument {
                    SyscallArgument::Register(register) => Some(register),
                    SyscallArgument::Immediate(_) => None,
                })
                .chain(destination.iter_mut())
                .collect(),
        }
    }

    /// A copy of this statement with every occurrence of `from` renamed to `to`
    pub fn with_register_renamed(&self, from: &Register, to: &Register) -> Self {
        let mut renamed = self.clone();

        for register in renamed.registers_mut() {
            if register == from {
                *register = to.clone();
            }
        }

        renamed
    }

    /// Whether removing this statement can change anything other than the
    /// registers it writes.
    pub fn has_side_effects(&self) -> bool {
        use StatementKind::*;

        !matches!(
            self,
            Move { .. }
                | LoadImmediate { .. }
                | AddImmediate { .. }
                | Add { .. }
                | Subtract { .. }
                | Multiply { .. }
                | Increment { .. }
                | LoadGlobal { .. }
                | LoadMemory { .. }
                | LoadMemoryByte { .. }
                | LoadSymbolAddress { .. }
                | Alloca { .. }
                | StackLoad { .. }
        )
    }

    /// Label this statement may transfer control to, if any
    pub fn jump_target(&self) -> Option<&str> {
        match self {
            Self::Goto { label }
            | Self::GotoIfEqual { label, .. }
            | Self::GotoIfNotEqual { label, .. }
            | Self::GotoIfZero { label, .. }
            | Self::GotoIfGreater { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Symbols referenced by name, for reachability
    pub fn referenced_symbol(&self) -> Option<&str> {
        match self {
            Self::CallByName { function, .. } => Some(function),
            Self::LoadSymbolAddress { symbol_name, .. } => Some(symbol_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub instructions: Vec<Statement>,
    /// Calling-convention positions, not storage
    pub arguments: Vec<Register>,
    pub spill_count: usize,
    /// Registers that are still read after the last instruction
    pub live_at_exit: Vec<Register>,
}

impl Function {
    pub fn new(name: impl Into<String>, arguments: Vec<Register>, instructions: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            instructions,
            arguments,
            spill_count: 0,
            live_at_exit: vec![],
        }
    }

    /// Position of `register` in the argument list
    pub fn argument_index(&self, register: &Register) -> Option<usize> {
        self.arguments.iter().position(|a| a == register)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalInfo {
    pub mangled_name: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub globals: BTreeMap<String, GlobalInfo>,
    pub functions: Vec<Function>,
    pub main: Function,
    pub string_literals: Vec<StringLiteral>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        if self.main.name == name {
            return Some(&self.main);
        }

        self.functions.iter().find(|f| f.name == name)
    }

    pub fn string_literal(&self, name: &str) -> Option<&StringLiteral> {
        self.string_literals.iter().find(|s| s.name == name)
    }

    /// Looks up a global by its mangled name
    pub fn global_by_mangled_name(&self, mangled_name: &str) -> Option<&GlobalInfo> {
        self.globals.values().find(|g| g.mangled_name == mangled_name)
    }
}
