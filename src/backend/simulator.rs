//! Executes a lowered program the way the target machine would: a physical
//! register file, one flat little-endian memory and the target's syscall
//! numbering.
//!
//! Memory holds the data section from [`DATA_BASE`], the heap growing up
//! from the end of the data and the stack growing down from the top. Code
//! lives in its own address space starting at [`CODE_BASE`] so that return
//! addresses and function pointers can be told apart from data.

use hashbrown::{HashMap, HashSet};
use log::{debug, trace};

use crate::{
    backend::{
        lir::{TargetProgram, TargetStatement, TargetStatementKind as T},
        targets::{PhysicalRegister, TargetDescription},
    },
    execution::{Console, ExecutionError, ExecutionLimits, ExecutionOutcome, ExecutionResult},
    middle::tac::SyscallName,
};

pub const CODE_BASE: i64 = 0x4000_0000;
/// Addresses below this are treated as null
pub const DATA_BASE: usize = 64;
const MEMORY_BYTES: usize = 1 << 22;

fn align(address: usize, word_size: usize) -> usize {
    address.div_ceil(word_size) * word_size
}

/// Code and symbol tables, immutable while the program runs
struct Image<'p, R> {
    code: Vec<&'p TargetStatement<R>>,
    labels: HashMap<&'p str, usize>,
    data: HashMap<&'p str, usize>,
}

impl<'p, R: PhysicalRegister> Image<'p, R> {
    fn label(&self, name: &str) -> ExecutionOutcome<usize> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownLabel(name.to_owned()))
    }

    fn function(&self, name: &str) -> ExecutionOutcome<usize> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownFunction(name.to_owned()))
    }

    fn data_address(&self, name: &str) -> ExecutionOutcome<i64> {
        self.data
            .get(name)
            .map(|address| *address as i64)
            .ok_or_else(|| ExecutionError::UnknownSymbol(name.to_owned()))
    }

    /// Data symbols resolve to their address, functions to their code address
    fn symbol_address(&self, name: &str) -> ExecutionOutcome<i64> {
        match self.data.get(name) {
            Some(address) => Ok(*address as i64),
            None => self
                .labels
                .get(name)
                .map(|index| CODE_BASE + *index as i64)
                .ok_or_else(|| ExecutionError::UnknownSymbol(name.to_owned())),
        }
    }

    fn code_index(&self, address: i64) -> ExecutionOutcome<usize> {
        usize::try_from(address - CODE_BASE)
            .ok()
            .filter(|index| *index < self.code.len())
            .ok_or_else(|| {
                ExecutionError::InvalidMemoryAccess(format!("jump to non-code address {address:#x}"))
            })
    }
}

struct Machine<'t, R> {
    target: &'t TargetDescription<R>,
    registers: HashMap<R, i64>,
    /// Registers a syscall overwrote and nobody has written since
    poisoned: HashSet<R>,
    memory: Vec<u8>,
    stack_pointer: usize,
    program_break: usize,
    console: Console,
}

impl<R: PhysicalRegister> Machine<'_, R> {
    fn word_size(&self) -> usize {
        self.target.word_size
    }

    /// Truncates to the machine word, sign-extending back
    fn wrap(&self, value: i64) -> i64 {
        let shift = 64 - 8 * self.word_size() as u32;
        (value << shift) >> shift
    }

    fn read(&self, register: R) -> ExecutionOutcome<i64> {
        if self.poisoned.contains(&register) {
            return Err(ExecutionError::ClobberedRegister(register.to_string()));
        }

        Ok(self.registers.get(&register).copied().unwrap_or(0))
    }

    fn write(&mut self, register: R, value: i64) {
        let value = self.wrap(value);
        self.poisoned.remove(&register);
        self.registers.insert(register, value);
    }

    fn checked_range(&self, address: i64, length: usize) -> ExecutionOutcome<std::ops::Range<usize>> {
        usize::try_from(address)
            .ok()
            .filter(|start| {
                *start >= DATA_BASE && start.checked_add(length).is_some_and(|end| end <= self.memory.len())
            })
            .map(|start| start..start + length)
            .ok_or_else(|| {
                ExecutionError::InvalidMemoryAccess(format!("{length} bytes at address {address:#x}"))
            })
    }

    fn load_word(&self, address: i64) -> ExecutionOutcome<i64> {
        let range = self.checked_range(address, self.word_size())?;
        let mut bytes = [0u8; 8];
        bytes[..self.word_size()].copy_from_slice(&self.memory[range]);
        Ok(self.wrap(i64::from_le_bytes(bytes)))
    }

    fn store_word(&mut self, address: i64, value: i64) -> ExecutionOutcome<()> {
        let range = self.checked_range(address, self.word_size())?;
        let word_size = self.word_size();
        self.memory[range].copy_from_slice(&value.to_le_bytes()[..word_size]);
        Ok(())
    }

    fn load_byte(&self, address: i64) -> ExecutionOutcome<u8> {
        let range = self.checked_range(address, 1)?;
        Ok(self.memory[range.start])
    }

    fn store_byte(&mut self, address: i64, value: u8) -> ExecutionOutcome<()> {
        let range = self.checked_range(address, 1)?;
        self.memory[range.start] = value;
        Ok(())
    }

    fn stack_address(&self, offset: usize) -> i64 {
        (self.stack_pointer + offset * self.word_size()) as i64
    }

    fn grow_stack(&mut self, words: usize) -> ExecutionOutcome<()> {
        let bytes = words * self.word_size();
        match self.stack_pointer.checked_sub(bytes) {
            Some(stack_pointer) if stack_pointer >= self.program_break => {
                self.stack_pointer = stack_pointer;
                Ok(())
            }
            _ => Err(ExecutionError::InvalidMemoryAccess("stack overflow".to_owned())),
        }
    }

    fn shrink_stack(&mut self, words: usize) -> ExecutionOutcome<()> {
        let stack_pointer = self.stack_pointer + words * self.word_size();
        if stack_pointer > self.memory.len() {
            return Err(ExecutionError::InvalidMemoryAccess("stack underflow".to_owned()));
        }
        self.stack_pointer = stack_pointer;
        Ok(())
    }

    fn push(&mut self, value: i64) -> ExecutionOutcome<()> {
        self.grow_stack(1)?;
        self.store_word(self.stack_address(0), value)
    }

    fn pop(&mut self) -> ExecutionOutcome<i64> {
        let value = self.load_word(self.stack_address(0))?;
        self.shrink_stack(1)?;
        Ok(value)
    }

    /// Moves the program break. Fails with -1 once the heap would run into
    /// the stack.
    fn extend_heap(&mut self, bytes: i64) -> i64 {
        let Ok(bytes) = usize::try_from(bytes) else {
            return -1;
        };

        let previous = self.program_break;
        match previous.checked_add(bytes) {
            Some(next) if next < self.stack_pointer => {
                self.program_break = next;
                previous as i64
            }
            _ => -1,
        }
    }

    fn c_string(&self, mut address: i64) -> ExecutionOutcome<Vec<u8>> {
        let mut bytes = Vec::new();

        loop {
            match self.load_byte(address)? {
                0 => return Ok(bytes),
                byte => bytes.push(byte),
            }
            address += 1;
        }
    }

    fn syscall_argument(&self, position: usize, name: SyscallName) -> ExecutionOutcome<i64> {
        let register = self
            .target
            .syscall_argument_registers
            .get(position)
            .copied()
            .ok_or_else(|| {
                ExecutionError::UnsupportedSyscall(format!("{name} without argument {}", position + 1))
            })?;

        self.read(register)
    }

    /// Runs the selected syscall, yielding the exit code if it was `exit`
    fn syscall(&mut self) -> ExecutionOutcome<Option<i64>> {
        let select = self.target.syscall_select_and_result_register;
        let number = self.read(select)?;
        let name = self
            .target
            .syscall_by_number(number)
            .ok_or_else(|| ExecutionError::UnsupportedSyscall(format!("number {number}")))?;

        let argument = |n| self.syscall_argument(n, name);

        let result = match name {
            SyscallName::Print => {
                let text = self.c_string(argument(0)?)?;
                self.console.write(&text);
                0
            }
            SyscallName::Write => {
                let (buffer, length) = (argument(1)?, argument(2)?);
                let range = self.checked_range(buffer, usize::try_from(length).unwrap_or(0))?;
                let bytes = self.memory[range].to_vec();
                self.console.write(&bytes);
                length
            }
            SyscallName::PrintInt => {
                let value = argument(0)?;
                self.console.write(value.to_string().as_bytes());
                0
            }
            SyscallName::Read => {
                let (buffer, length) = (argument(1)?, argument(2)?);
                let bytes = self.console.read(usize::try_from(length).unwrap_or(0));
                for (i, byte) in bytes.iter().enumerate() {
                    self.store_byte(buffer + i as i64, *byte)?;
                }
                bytes.len() as i64
            }
            SyscallName::ReadInt => self.console.read_int()?,
            SyscallName::Sbrk => {
                let bytes = argument(0)?;
                self.extend_heap(bytes)
            }
            SyscallName::Mmap => {
                let bytes = argument(1)?;
                let aligned = align(usize::try_from(bytes).unwrap_or(0), self.word_size());
                self.program_break = align(self.program_break, self.word_size());
                self.extend_heap(aligned as i64)
            }
            SyscallName::Exit => return Ok(Some(argument(0)?)),
        };

        trace!("syscall {name} returned {result}");
        self.write(select, result);

        for register in &self.target.registers_clobbered_by_syscall {
            if *register != select {
                self.poisoned.insert(*register);
            }
        }

        Ok(None)
    }
}

fn load<'p, R: PhysicalRegister>(
    program: &'p TargetProgram<R>,
    target: &TargetDescription<R>,
    memory: &mut [u8],
) -> ExecutionOutcome<(Image<'p, R>, usize)> {
    let code: Vec<&TargetStatement<R>> = program
        .functions
        .iter()
        .flat_map(|f| &f.instructions)
        .collect();

    let mut labels = HashMap::new();
    for (index, statement) in code.iter().enumerate() {
        if let T::Label { name } | T::FunctionLabel { name } = &statement.kind {
            labels.entry(name.as_str()).or_insert(index);
        }
    }

    let mut data = HashMap::new();
    let mut address = DATA_BASE;

    for global in &program.globals {
        address = align(address, target.word_size);
        data.insert(global.mangled_name.as_str(), address);
        address += global.bytes.max(target.word_size);
    }

    for literal in &program.string_literals {
        let bytes = literal.value.as_bytes();
        let end = address + bytes.len() + 1;
        if end > memory.len() {
            return Err(ExecutionError::InvalidMemoryAccess(
                "data section does not fit in memory".to_owned(),
            ));
        }

        data.insert(literal.name.as_str(), address);
        memory[address..address + bytes.len()].copy_from_slice(bytes);
        address = end;
    }

    Ok((Image { code, labels, data }, align(address, target.word_size)))
}

/// Runs `program` from its entry point until it exits
pub fn simulate<R: PhysicalRegister>(
    program: &TargetProgram<R>,
    target: &TargetDescription<R>,
    limits: &ExecutionLimits,
) -> ExecutionOutcome<ExecutionResult> {
    let mut memory = vec![0u8; MEMORY_BYTES];
    let (image, program_break) = load(program, target, &mut memory)?;

    let entry = program
        .functions
        .first()
        .ok_or_else(|| ExecutionError::UnknownFunction("main".to_owned()))?;

    let mut machine = Machine {
        target,
        registers: HashMap::new(),
        poisoned: HashSet::new(),
        memory,
        stack_pointer: MEMORY_BYTES,
        program_break,
        console: Console::new(&limits.stdin),
    };

    let mut pc = image.function(&entry.name)?;
    let mut steps = 0u64;

    let exit_code = loop {
        steps += 1;
        if steps > limits.max_steps {
            return Err(ExecutionError::StepLimitExceeded(limits.max_steps));
        }

        let statement = image.code.get(pc).ok_or_else(|| {
            ExecutionError::InvalidMemoryAccess("execution ran past the end of the code".to_owned())
        })?;
        let mut next = pc + 1;

        match &statement.kind {
            T::Empty | T::Label { .. } | T::FunctionLabel { .. } => {}
            T::Move { from, to } => {
                let value = machine.read(*from)?;
                machine.write(*to, value);
            }
            T::LoadImmediate { value, destination } => machine.write(*destination, *value),
            T::AddImmediate { register, amount } => {
                let value = machine.read(*register)?;
                machine.write(*register, value.wrapping_add(*amount));
            }
            T::Add {
                lhs,
                rhs,
                destination,
            } => {
                let value = machine.read(*lhs)?.wrapping_add(machine.read(*rhs)?);
                machine.write(*destination, value);
            }
            T::Subtract {
                lhs,
                rhs,
                destination,
            } => {
                let value = machine.read(*lhs)?.wrapping_sub(machine.read(*rhs)?);
                machine.write(*destination, value);
            }
            T::Multiply {
                lhs,
                rhs,
                destination,
            } => {
                let value = machine.read(*lhs)?.wrapping_mul(machine.read(*rhs)?);
                machine.write(*destination, value);
            }
            T::Increment { register } => {
                let value = machine.read(*register)?;
                machine.write(*register, value.wrapping_add(1));
            }
            T::Goto { label } => next = image.label(label)?,
            T::GotoIfEqual { lhs, rhs, label } => {
                if machine.read(*lhs)? == machine.read(*rhs)? {
                    next = image.label(label)?;
                }
            }
            T::GotoIfNotEqual { lhs, rhs, label } => {
                if machine.read(*lhs)? != machine.read(*rhs)? {
                    next = image.label(label)?;
                }
            }
            T::GotoIfZero { register, label } => {
                if machine.read(*register)? == 0 {
                    next = image.label(label)?;
                }
            }
            T::GotoIfGreater { lhs, rhs, label } => {
                if machine.read(*lhs)? > machine.read(*rhs)? {
                    next = image.label(label)?;
                }
            }
            T::LoadGlobal { from, to } => {
                let value = machine.load_word(image.data_address(from)?)?;
                machine.write(*to, value);
            }
            T::StoreGlobal { from, to } => {
                let value = machine.read(*from)?;
                machine.store_word(image.data_address(to)?, value)?;
            }
            T::LoadMemory { from, to, offset } => {
                let value = machine.load_word(machine.read(*from)?.wrapping_add(*offset))?;
                machine.write(*to, value);
            }
            T::StoreMemory {
                from,
                address,
                offset,
            } => {
                let value = machine.read(*from)?;
                machine.store_word(machine.read(*address)?.wrapping_add(*offset), value)?;
            }
            T::LoadMemoryByte { address, to } => {
                let value = machine.load_byte(machine.read(*address)?)?;
                machine.write(*to, i64::from(value));
            }
            T::StoreMemoryByte { address, contents } => {
                let value = machine.read(*contents)?;
                machine.store_byte(machine.read(*address)?, value as u8)?;
            }
            T::StoreZeroToMemory { address, offset } => {
                machine.store_word(machine.read(*address)?.wrapping_add(*offset), 0)?;
            }
            T::LoadSymbolAddress { symbol_name, to } => {
                machine.write(*to, image.symbol_address(symbol_name)?);
            }
            T::Syscall => {
                if let Some(code) = machine.syscall()? {
                    break code;
                }
            }
            T::CallByName { function } => {
                let return_address = CODE_BASE + next as i64;
                next = image.function(function)?;
                match target.link_register {
                    Some(link) => machine.write(link, return_address),
                    None => machine.push(return_address)?,
                }
            }
            T::CallByRegister { function } => {
                let return_address = CODE_BASE + next as i64;
                next = image.code_index(machine.read(*function)?)?;
                match target.link_register {
                    Some(link) => machine.write(link, return_address),
                    None => machine.push(return_address)?,
                }
            }
            T::Return => {
                let return_address = match target.link_register {
                    Some(link) => machine.read(link)?,
                    None => machine.pop()?,
                };
                next = image.code_index(return_address)?;
            }
            T::LoadStackOffset { offset, to } => {
                let address = machine.stack_address(*offset);
                machine.write(*to, address);
            }
            T::StackLoad { offset, to } => {
                let value = machine.load_word(machine.stack_address(*offset))?;
                machine.write(*to, value);
            }
            T::StackStore { from, offset } => {
                let value = machine.read(*from)?;
                machine.store_word(machine.stack_address(*offset), value)?;
            }
            T::StackReserve { words } => machine.grow_stack(*words)?,
            T::StackRelease { words } => machine.shrink_stack(*words)?,
            T::Push { register } => {
                let value = machine.read(*register)?;
                machine.push(value)?;
            }
            T::Pop { register } => {
                let value = machine.pop()?;
                machine.write(*register, value);
            }
        }

        pc = next;
    };

    debug!("simulated {} steps on {}, exit code {exit_code}", steps, target.name);

    Ok(ExecutionResult {
        exit_code,
        stdout: machine.console.into_stdout(),
    })
}
