//! Turns an allocated function into target statements. Virtual registers are
//! replaced by physical ones, the calling convention is spelled out as
//! pushes, pops and fixed-register moves, and the body is wrapped in a
//! prologue and an epilogue that every `return` jumps to.

use log::debug;

use crate::{
    backend::{
        CodegenOptions,
        lir::{TargetFunction, TargetStatement, TargetStatementKind as T},
        register_allocation::{AllocatedFunction, Storage},
        stack_usage::{StackUsage, words_for},
        targets::{PhysicalRegister, TargetDescription},
    },
    error::{CompileError, CompileResult},
    middle::{
        runtime::{FREE_GLOBALS, VERIFY_NO_LEAKS},
        tac::{
            Register, StackLocation, Statement, StatementKind, SyscallArgument, SyscallName,
            pretty_print::to_plain_text,
        },
    },
};

/// Where a call argument is read from
#[derive(Debug, Clone, Copy)]
enum Operand<R> {
    Register(R),
    /// Word offset from the stack pointer at the start of the call sequence
    Stack(usize),
}

enum Callee<'a> {
    Name(&'a str),
    Register(&'a Register),
}

pub fn exit_label(function_name: &str) -> String {
    format!("{function_name}_cleanup")
}

/// Runs after the entry point's frame is torn down: releases globals, checks
/// for leaks and exits with the value `main` returned.
pub fn entry_point_cleanup<R: PhysicalRegister>(
    target: &TargetDescription<R>,
) -> CompileResult<Vec<TargetStatement<R>>> {
    let exit_code_register = target
        .syscall_argument_registers
        .first()
        .copied()
        .ok_or_else(|| CompileError::ResourceExhausted {
            context: "exit syscall".to_owned(),
            resource: "syscall argument registers",
            requested: 1,
            available: 0,
        })?;

    Ok(vec![
        TargetStatement::new(
            T::Push {
                register: target.function_result_register,
            },
            "keep the exit code",
        ),
        TargetStatement::new(
            T::CallByName {
                function: FREE_GLOBALS.to_owned(),
            },
            "",
        ),
        TargetStatement::new(
            T::CallByName {
                function: VERIFY_NO_LEAKS.to_owned(),
            },
            "",
        ),
        TargetStatement::new(
            T::Pop {
                register: exit_code_register,
            },
            "exit code",
        ),
        TargetStatement::new(
            T::LoadImmediate {
                value: target.syscall_number(SyscallName::Exit)?,
                destination: target.syscall_select_and_result_register,
            },
            "exit",
        ),
        TargetStatement::new(T::Syscall, ""),
    ])
}

struct Lowering<'a, R> {
    target: &'a TargetDescription<R>,
    allocated: &'a AllocatedFunction<R>,
    usage: &'a StackUsage<R>,
    output: Vec<TargetStatement<R>>,
    /// Words of alloca space handed out so far
    alloca_words: usize,
}

impl<'a, R: PhysicalRegister> Lowering<'a, R> {
    fn emit(&mut self, kind: T<R>, why: impl Into<String>) {
        self.output.push(TargetStatement::new(kind, why));
    }

    fn function_name(&self) -> &str {
        &self.allocated.function.name
    }

    fn physical(&self, register: &Register) -> CompileResult<R> {
        if let Some(reserved) = register.reserved() {
            return self.target.reserved_register(reserved);
        }

        if let Some(index) = self.allocated.function.argument_index(register)
            && let Some(physical) = self.target.function_argument_registers.get(index)
        {
            return Ok(*physical);
        }

        match self.allocated.assignment.get(register) {
            Some(Storage::Register(physical)) => Ok(physical),
            Some(Storage::Stack(location)) => Err(CompileError::internal(format!(
                "{} lives in {location:?} but {} uses it as a register operand",
                register.name(),
                self.function_name()
            ))),
            None => Err(CompileError::internal(format!(
                "{} has no storage in {}",
                register.name(),
                self.function_name()
            ))),
        }
    }

    fn stack_offset(&self, location: StackLocation) -> usize {
        match location {
            StackLocation::Spill(slot) => self.usage.spill_offset(slot),
            StackLocation::Argument(index) => self.usage.stack_argument_offset(index),
        }
    }

    fn operand(&self, register: &Register) -> CompileResult<Operand<R>> {
        match self.allocated.assignment.get(register) {
            Some(Storage::Stack(location)) => Ok(Operand::Stack(self.stack_offset(location))),
            _ => self.physical(register).map(Operand::Register),
        }
    }

    fn prologue(&mut self) {
        let name = self.function_name().to_owned();
        self.emit(T::FunctionLabel { name }, "");

        let reserve = self.usage.callee_reserve_count();
        if reserve > 0 {
            self.emit(T::StackReserve { words: reserve }, "frame");
        }

        for (i, register) in self.usage.saved_extra_registers.iter().enumerate() {
            let offset = self.usage.saved_extra_offset(i);
            self.emit(T::StackStore { from: *register, offset }, "save extra register");
        }

        for (i, register) in self.usage.saved_used_registers.iter().enumerate() {
            let offset = self.usage.saved_used_offset(i);
            self.emit(T::StackStore { from: *register, offset }, "save used register");
        }
    }

    fn epilogue(&mut self, final_cleanup: Option<&[TargetStatement<R>]>) {
        let name = exit_label(self.function_name());
        self.emit(T::Label { name }, "");

        for (i, register) in self.usage.saved_used_registers.iter().enumerate().rev() {
            let offset = self.usage.saved_used_offset(i);
            self.emit(T::StackLoad { offset, to: *register }, "restore used register");
        }

        for (i, register) in self.usage.saved_extra_registers.iter().enumerate().rev() {
            let offset = self.usage.saved_extra_offset(i);
            self.emit(T::StackLoad { offset, to: *register }, "restore extra register");
        }

        let reserve = self.usage.callee_reserve_count();
        if reserve > 0 {
            self.emit(T::StackRelease { words: reserve }, "frame");
        }

        match final_cleanup {
            Some(cleanup) => self.output.extend_from_slice(cleanup),
            None => self.emit(T::Return, ""),
        }
    }

    fn statement(&mut self, statement: &Statement, options: &CodegenOptions) -> CompileResult<()> {
        if options.emit_comments && statement.kind != StatementKind::Empty {
            self.emit(T::Empty, to_plain_text(statement));
        }

        let why = statement.why.as_str();

        let kind = match &statement.kind {
            StatementKind::Empty => {
                if options.emit_comments && !why.is_empty() {
                    self.emit(T::Empty, why);
                }
                return Ok(());
            }
            StatementKind::Move { from, to } => {
                let (from, to) = (self.physical(from)?, self.physical(to)?);
                if from == to {
                    return Ok(());
                }
                T::Move { from, to }
            }
            StatementKind::LoadImmediate { value, destination } => T::LoadImmediate {
                value: *value,
                destination: self.physical(destination)?,
            },
            StatementKind::AddImmediate { register, amount } => T::AddImmediate {
                register: self.physical(register)?,
                amount: *amount,
            },
            StatementKind::Add {
                lhs,
                rhs,
                destination,
            } => T::Add {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                destination: self.physical(destination)?,
            },
            StatementKind::Subtract {
                lhs,
                rhs,
                destination,
            } => T::Subtract {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                destination: self.physical(destination)?,
            },
            StatementKind::Multiply {
                lhs,
                rhs,
                destination,
            } => T::Multiply {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                destination: self.physical(destination)?,
            },
            StatementKind::Increment { register } => T::Increment {
                register: self.physical(register)?,
            },
            StatementKind::Label { name } => T::Label { name: name.clone() },
            StatementKind::FunctionLabel { name } => T::FunctionLabel { name: name.clone() },
            StatementKind::Goto { label } => T::Goto {
                label: label.clone(),
            },
            StatementKind::GotoIfEqual { lhs, rhs, label } => T::GotoIfEqual {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                label: label.clone(),
            },
            StatementKind::GotoIfNotEqual { lhs, rhs, label } => T::GotoIfNotEqual {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                label: label.clone(),
            },
            StatementKind::GotoIfZero { register, label } => T::GotoIfZero {
                register: self.physical(register)?,
                label: label.clone(),
            },
            StatementKind::GotoIfGreater { lhs, rhs, label } => T::GotoIfGreater {
                lhs: self.physical(lhs)?,
                rhs: self.physical(rhs)?,
                label: label.clone(),
            },
            StatementKind::LoadGlobal { from, to } => T::LoadGlobal {
                from: from.clone(),
                to: self.physical(to)?,
            },
            StatementKind::StoreGlobal { from, to } => T::StoreGlobal {
                from: self.physical(from)?,
                to: to.clone(),
            },
            StatementKind::LoadMemory { from, to, offset } => T::LoadMemory {
                from: self.physical(from)?,
                to: self.physical(to)?,
                offset: *offset,
            },
            StatementKind::StoreMemory {
                from,
                address,
                offset,
            } => T::StoreMemory {
                from: self.physical(from)?,
                address: self.physical(address)?,
                offset: *offset,
            },
            StatementKind::LoadMemoryByte { address, to } => T::LoadMemoryByte {
                address: self.physical(address)?,
                to: self.physical(to)?,
            },
            StatementKind::StoreMemoryByte { address, contents } => T::StoreMemoryByte {
                address: self.physical(address)?,
                contents: self.physical(contents)?,
            },
            StatementKind::StoreZeroToMemory { address, offset } => T::StoreZeroToMemory {
                address: self.physical(address)?,
                offset: *offset,
            },
            StatementKind::LoadSymbolAddress { symbol_name, to } => T::LoadSymbolAddress {
                symbol_name: symbol_name.clone(),
                to: self.physical(to)?,
            },
            StatementKind::Alloca { bytes, register } => {
                let offset = self.usage.alloca_base() + self.alloca_words;
                self.alloca_words += words_for(*bytes, self.target.word_size);
                T::LoadStackOffset {
                    offset,
                    to: self.physical(register)?,
                }
            }
            StatementKind::CallByName {
                function,
                arguments,
                destination,
            } => return self.call(Callee::Name(function), arguments, destination.as_ref(), why),
            StatementKind::CallByRegister {
                function,
                arguments,
                destination,
            } => {
                return self.call(Callee::Register(function), arguments, destination.as_ref(), why);
            }
            StatementKind::Return { register } => {
                if let Some(register) = register {
                    let from = self.physical(register)?;
                    let to = self.target.function_result_register;
                    if from != to {
                        self.emit(T::Move { from, to }, "return value");
                    }
                }
                T::Goto {
                    label: exit_label(self.function_name()),
                }
            }
            StatementKind::Syscall {
                name,
                arguments,
                destination,
            } => return self.syscall(*name, arguments, destination.as_ref(), why),
            StatementKind::StackLoad { location, to } => T::StackLoad {
                offset: self.stack_offset(*location),
                to: self.physical(to)?,
            },
            StatementKind::StackStore { from, location } => T::StackStore {
                from: self.physical(from)?,
                offset: self.stack_offset(*location),
            },
        };

        self.emit(kind, why);
        Ok(())
    }

    /// Arguments go through the stack: pushed last to first, then the
    /// register-passed ones are popped into the argument registers. No
    /// argument register is overwritten before every argument has been read.
    fn call(
        &mut self,
        callee: Callee<'_>,
        arguments: &[Register],
        destination: Option<&Register>,
        why: &str,
    ) -> CompileResult<()> {
        let scratch = self.target.function_result_register;
        let destination = destination.map(|d| self.physical(d)).transpose()?;

        let saved: Vec<R> = self
            .usage
            .caller_saved_registers
            .iter()
            .copied()
            .filter(|r| Some(*r) != destination)
            .collect();

        for register in &saved {
            self.emit(T::Push { register: *register }, "caller-saved");
        }

        let mut pushed = saved.len();

        for argument in arguments.iter().rev() {
            match self.operand(argument)? {
                Operand::Register(register) => self.emit(T::Push { register }, ""),
                Operand::Stack(offset) => {
                    self.emit(
                        T::StackLoad {
                            offset: offset + pushed,
                            to: scratch,
                        },
                        format!("{} from the frame", argument.name()),
                    );
                    self.emit(T::Push { register: scratch }, "");
                }
            }
            pushed += 1;
        }

        let in_registers = arguments
            .len()
            .min(self.target.function_argument_registers.len());

        let call = match callee {
            Callee::Name(function) => T::CallByName {
                function: function.to_owned(),
            },
            Callee::Register(function) => {
                let function = self.physical(function)?;
                self.emit(T::Push { register: function }, "");
                self.emit(T::Pop { register: scratch }, "callee");
                T::CallByRegister { function: scratch }
            }
        };

        let target = self.target;
        for register in &target.function_argument_registers[..in_registers] {
            self.emit(T::Pop { register: *register }, "");
        }

        self.emit(call, why);

        let on_stack = arguments.len() - in_registers;
        if on_stack > 0 {
            self.emit(T::StackRelease { words: on_stack }, "stack arguments");
        }

        if let Some(destination) = destination
            && destination != scratch
        {
            self.emit(
                T::Move {
                    from: scratch,
                    to: destination,
                },
                "",
            );
        }

        for register in saved.iter().rev() {
            self.emit(T::Pop { register: *register }, "");
        }

        Ok(())
    }

    fn syscall(
        &mut self,
        name: SyscallName,
        arguments: &[SyscallArgument],
        destination: Option<&Register>,
        why: &str,
    ) -> CompileResult<()> {
        let target = self.target;
        let registers = &target.syscall_argument_registers;
        if arguments.len() > registers.len() {
            return Err(CompileError::ResourceExhausted {
                context: format!("syscall {name} in {}", self.function_name()),
                resource: "syscall argument registers",
                requested: arguments.len(),
                available: registers.len(),
            });
        }

        let number = target.syscall_number(name)?;
        let select = target.syscall_select_and_result_register;
        let destination = destination.map(|d| self.physical(d)).transpose()?;

        let mut saved: Vec<R> = Vec::new();
        let candidates = std::iter::once(select)
            .chain(registers[..arguments.len()].iter().copied())
            .chain(target.registers_clobbered_by_syscall.iter().copied());
        for register in candidates {
            if Some(register) != destination && !saved.contains(&register) {
                saved.push(register);
            }
        }

        for register in &saved {
            self.emit(T::Push { register: *register }, "syscall clobbers");
        }

        let mut in_registers = Vec::new();
        let mut immediates = Vec::new();
        for (position, argument) in arguments.iter().enumerate() {
            match argument {
                SyscallArgument::Register(register) => {
                    in_registers.push((registers[position], self.physical(register)?));
                }
                SyscallArgument::Immediate(value) => immediates.push((registers[position], *value)),
            }
        }

        for (_, from) in in_registers.iter().rev() {
            self.emit(T::Push { register: *from }, "");
        }
        for (to, _) in &in_registers {
            self.emit(T::Pop { register: *to }, "");
        }
        for (destination, value) in immediates {
            self.emit(T::LoadImmediate { value, destination }, "");
        }

        self.emit(
            T::LoadImmediate {
                value: number,
                destination: select,
            },
            name.to_string(),
        );
        self.emit(T::Syscall, why);

        if let Some(destination) = destination
            && destination != select
        {
            self.emit(
                T::Move {
                    from: select,
                    to: destination,
                },
                "",
            );
        }

        for register in saved.iter().rev() {
            self.emit(T::Pop { register: *register }, "");
        }

        Ok(())
    }
}

/// Lowers one allocated function. `final_cleanup` marks the entry point: it
/// runs in place of `Return` once the frame is gone.
pub fn lower<R: PhysicalRegister>(
    allocated: &AllocatedFunction<R>,
    target: &TargetDescription<R>,
    options: &CodegenOptions,
    final_cleanup: Option<&[TargetStatement<R>]>,
) -> CompileResult<TargetFunction<R>> {
    let usage = StackUsage::compute(allocated, target, final_cleanup.is_some());

    let mut lowering = Lowering {
        target,
        allocated,
        usage: &usage,
        output: Vec::with_capacity(allocated.function.instructions.len() * 2),
        alloca_words: 0,
    };

    lowering.prologue();
    for statement in &allocated.function.instructions {
        lowering.statement(statement, options)?;
    }
    lowering.epilogue(final_cleanup);

    let instructions = lowering.output;

    debug!(
        "lowered {} to {} {} instructions, {} words reserved",
        allocated.function.name,
        instructions.len(),
        target.name,
        usage.callee_reserve_count()
    );

    Ok(TargetFunction {
        name: allocated.function.name.clone(),
        instructions,
        stack_usage: usage,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        backend::{
            register_allocation::allocate,
            targets::{
                mips::{MIPS, MipsRegister},
                x64::{X64, X64Register},
            },
        },
        middle::tac::{Function, parser::parse_functions},
    };

    fn function(source: &str) -> Function {
        parse_functions(source).unwrap().remove(0)
    }

    fn lower_on<R: PhysicalRegister>(source: &str, target: &TargetDescription<R>) -> TargetFunction<R> {
        let allocated = allocate(
            &function(source),
            &target.general_purpose_registers,
            target.function_argument_registers.len(),
        )
        .unwrap();

        lower(&allocated, target, &CodegenOptions { emit_comments: false }, None).unwrap()
    }

    fn kinds<R: Clone>(function: &TargetFunction<R>) -> Vec<T<R>> {
        function.instructions.iter().map(|s| s.kind.clone()).collect()
    }

    #[test]
    fn every_return_goes_through_the_epilogue() {
        let lowered = lower_on(
            indoc! {"
                (function) pick(r:a):
                    r:zero = 0
                    goto pick_zero if r:a == r:zero
                    return r:a
                    pick_zero:
                    return r:zero
            "},
            &*MIPS,
        );
        let kinds = kinds(&lowered);

        let exits = kinds
            .iter()
            .filter(|k| matches!(k, T::Goto { label } if label == "pick_cleanup"))
            .count();
        assert_eq!(exits, 2);
        assert_eq!(kinds.iter().filter(|k| matches!(k, T::Return)).count(), 1);
        assert_eq!(kinds.last(), Some(&T::Return));

        // $ra is saved first and restored last
        assert_eq!(kinds[0], T::FunctionLabel { name: "pick".into() });
        assert!(matches!(kinds[1], T::StackReserve { .. }));
        assert_eq!(
            kinds[2],
            T::StackStore {
                from: MipsRegister::Ra,
                offset: 0
            }
        );
        assert_eq!(
            kinds[kinds.len() - 3],
            T::StackLoad {
                offset: 0,
                to: MipsRegister::Ra
            }
        );
    }

    #[test]
    fn stack_arguments_are_pushed_and_released() {
        let lowered = lower_on(
            indoc! {"
                (function) caller():
                    r:v = 1
                    r:out = callee(r:v, r:v, r:v, r:v, r:v)
                    return r:out
            "},
            &*X64,
        );
        let kinds = kinds(&lowered);

        let call = kinds
            .iter()
            .position(|k| matches!(k, T::CallByName { function } if function == "callee"))
            .unwrap();

        let pushes = kinds[..call].iter().filter(|k| matches!(k, T::Push { .. })).count();
        assert_eq!(pushes, 5);
        assert_eq!(
            kinds[call - 3..call],
            [
                T::Pop { register: X64Register::R8 },
                T::Pop { register: X64Register::R9 },
                T::Pop { register: X64Register::R10 },
            ]
        );
        assert_eq!(kinds[call + 1], T::StackRelease { words: 2 });
        assert!(matches!(
            kinds[call + 2],
            T::Move {
                from: X64Register::Rax,
                ..
            }
        ));
    }

    #[test]
    fn syscalls_restore_what_they_save() {
        let lowered = lower_on(
            indoc! {"
                (function) write_it(r:buffer, r:length):
                    r:written = syscall write 1 r:buffer r:length
                    return r:written
            "},
            &*X64,
        );
        let kinds = kinds(&lowered);

        let syscall = kinds.iter().position(|k| *k == T::Syscall).unwrap();
        let before: Vec<_> = kinds[..syscall]
            .iter()
            .filter_map(|k| match k {
                T::Push { register } => Some(*register),
                _ => None,
            })
            .collect();
        let after: Vec<_> = kinds[syscall..]
            .iter()
            .filter_map(|k| match k {
                T::Pop { register } => Some(*register),
                _ => None,
            })
            .collect();

        // Two argument pushes are popped before the syscall
        let saved = &before[..before.len() - 2];
        for register in [X64Register::Rax, X64Register::Rdi, X64Register::Rsi, X64Register::Rdx, X64Register::Rcx] {
            assert!(saved.contains(&register), "{register} is not saved");
        }
        // The result lands in r11, so restoring it would lose the result
        assert!(!saved.contains(&X64Register::R11));
        assert_eq!(after, saved.iter().rev().copied().collect::<Vec<_>>());
        assert_eq!(
            kinds[syscall - 1],
            T::LoadImmediate {
                value: 1,
                destination: X64Register::Rax
            }
        );
    }

    #[test]
    fn allocas_get_consecutive_frame_slots() {
        let lowered = lower_on(
            indoc! {"
                (function) main():
                    r:first = alloca(16)
                    r:second = alloca(4)
                    *(r:first + 0) = r:second
                    *(r:second + 0) = r:first
                    r:zero = 0
                    return r:zero
            "},
            &*X64,
        );

        let offsets: Vec<usize> = lowered
            .instructions
            .iter()
            .filter_map(|s| match s.kind {
                T::LoadStackOffset { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        let base = lowered.stack_usage.alloca_base();

        assert_eq!(offsets, vec![base, base + 2]);
        assert_eq!(lowered.stack_usage.alloca_words, 3);
    }

    #[test]
    fn lowering_is_deterministic() {
        let source = indoc! {"
            (function) f(r:a, r:b, r:c, r:d):
                r:x = r:a + r:d
                r:y = g(r:x, r:b, r:c, r:d)
                return r:y
        "};

        assert_eq!(lower_on(source, &*X64), lower_on(source, &*X64));
        assert_eq!(lower_on(source, &*MIPS), lower_on(source, &*MIPS));
    }

    #[test]
    fn comments_carry_the_original_statement() {
        let allocated = allocate(
            &function("(function) main():\n    r:x = 4; four\n    return r:x\n"),
            &X64.general_purpose_registers,
            3,
        )
        .unwrap();
        let cleanup = entry_point_cleanup(&*X64).unwrap();

        let lowered = lower(&allocated, &*X64, &CodegenOptions { emit_comments: true }, Some(&cleanup)).unwrap();

        assert!(lowered
            .instructions
            .iter()
            .any(|s| s.kind == T::Empty && s.why == "r:x = 4; four"));
        assert!(lowered.instructions.ends_with(&cleanup));
        assert!(!lowered.instructions.iter().any(|s| s.kind == T::Return));
    }
}
