//! Executes three-address code directly. Pointers stay symbolic (a memory
//! block plus an offset), which makes this the reference the lowered code is
//! checked against rather than a model of any machine.

use std::{collections::BTreeMap, rc::Rc};

use hashbrown::HashMap;
use log::{debug, trace};

use crate::{
    execution::{Console, ExecutionError, ExecutionLimits, ExecutionOutcome, ExecutionResult},
    middle::{
        runtime,
        tac::{
            Function, Program, Register, StackLocation, StatementKind, SyscallArgument, SyscallName,
        },
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Pointer { block: Rc<str>, offset: i64 },
}

impl Value {
    fn integer(&self, context: &str) -> ExecutionOutcome<i64> {
        match self {
            Value::Integer(value) => Ok(*value),
            Value::Pointer { block, .. } => Err(ExecutionError::PointerMisuse(format!(
                "{context} expects an integer but got a pointer into {block}"
            ))),
        }
    }

    fn offset_by(&self, amount: i64) -> Value {
        match self {
            Value::Integer(value) => Value::Integer(value.wrapping_add(amount)),
            Value::Pointer { block, offset } => Value::Pointer {
                block: block.clone(),
                offset: offset + amount,
            },
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Integer(value) => write!(f, "{value}"),
            Value::Pointer { block, offset } => write!(f, "&{block}+{offset}"),
        }
    }
}

#[derive(Debug, Clone)]
enum Cell {
    Word(Value),
    Byte(u8),
}

/// A named allocation. Word writes are kept whole so pointers survive a
/// round trip through memory; byte accesses split integer words as needed.
#[derive(Debug)]
struct MemoryBlock {
    size: usize,
    cells: BTreeMap<usize, Cell>,
}

impl MemoryBlock {
    fn new(size: usize) -> Self {
        Self {
            size,
            cells: BTreeMap::new(),
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len(),
            cells: bytes
                .iter()
                .enumerate()
                .map(|(i, &b)| (i, Cell::Byte(b)))
                .collect(),
        }
    }

    fn check(&self, name: &str, offset: i64, length: usize) -> ExecutionOutcome<usize> {
        usize::try_from(offset)
            .ok()
            .filter(|&start| start + length <= self.size)
            .ok_or_else(|| {
                ExecutionError::InvalidMemoryAccess(format!(
                    "{length} bytes at offset {offset} of {name}, which is {} bytes",
                    self.size
                ))
            })
    }

    /// Start of the word cell covering `offset`, if any
    fn covering_word(&self, offset: usize, word_size: usize) -> Option<usize> {
        self.cells
            .range(offset.saturating_sub(word_size - 1)..=offset)
            .rev()
            .find(|(_, cell)| matches!(cell, Cell::Word(_)))
            .map(|(&start, _)| start)
    }

    /// Replaces the word at `start` with its little-endian bytes
    fn split_word(&mut self, start: usize, word_size: usize) -> ExecutionOutcome<()> {
        match self.cells.remove(&start) {
            Some(Cell::Word(Value::Integer(value))) => {
                for i in 0..word_size.min(self.size - start) {
                    self.cells.insert(start + i, Cell::Byte((value >> (8 * i)) as u8));
                }
                Ok(())
            }
            Some(Cell::Word(pointer)) => Err(ExecutionError::PointerMisuse(format!(
                "byte access into the stored pointer {pointer}"
            ))),
            Some(byte) => {
                self.cells.insert(start, byte);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn read_byte(&self, offset: usize, word_size: usize) -> ExecutionOutcome<u8> {
        if let Some(Cell::Byte(byte)) = self.cells.get(&offset) {
            return Ok(*byte);
        }

        match self.covering_word(offset, word_size).map(|start| (start, &self.cells[&start])) {
            Some((start, Cell::Word(Value::Integer(value)))) => Ok((value >> (8 * (offset - start))) as u8),
            Some((_, Cell::Word(pointer))) => Err(ExecutionError::PointerMisuse(format!(
                "byte read from the stored pointer {pointer}"
            ))),
            _ => Ok(0),
        }
    }

    fn write_byte(&mut self, offset: usize, word_size: usize, byte: u8) -> ExecutionOutcome<()> {
        if let Some(start) = self.covering_word(offset, word_size) {
            self.split_word(start, word_size)?;
        }

        self.cells.insert(offset, Cell::Byte(byte));
        Ok(())
    }

    fn read_word(&self, offset: usize, word_size: usize) -> ExecutionOutcome<Value> {
        if let Some(Cell::Word(value)) = self.cells.get(&offset) {
            return Ok(value.clone());
        }

        let mut value = 0i64;
        for i in (0..word_size).rev() {
            value = (value << 8) | i64::from(self.read_byte(offset + i, word_size)?);
        }

        let unused = 64 - 8 * word_size as u32;
        Ok(Value::Integer((value << unused) >> unused))
    }

    fn write_word(&mut self, offset: usize, word_size: usize, value: Value) -> ExecutionOutcome<()> {
        let overlapping: Vec<usize> = self
            .cells
            .range(offset.saturating_sub(word_size - 1)..offset + word_size)
            .filter(|(_, cell)| matches!(cell, Cell::Word(_)))
            .map(|(&start, _)| start)
            .collect();

        for start in overlapping {
            if start == offset {
                self.cells.remove(&start);
            } else if self.split_word(start, word_size).is_err() {
                // A partially overwritten pointer is no longer a pointer
                self.cells.remove(&start);
            }
        }

        let stale: Vec<usize> = self.cells.range(offset..offset + word_size).map(|(&k, _)| k).collect();
        for key in stale {
            self.cells.remove(&key);
        }

        self.cells.insert(offset, Cell::Word(value));
        Ok(())
    }
}

struct PreparedFunction<'a> {
    function: &'a Function,
    labels: HashMap<&'a str, usize>,
}

struct Frame<'a> {
    function: &'a PreparedFunction<'a>,
    pc: usize,
    registers: HashMap<Register, Value>,
    stack_slots: HashMap<StackLocation, Value>,
    /// Caller register receiving this frame's return value
    return_to: Option<Register>,
}

impl Frame<'_> {
    fn read(&self, register: &Register) -> Value {
        self.registers
            .get(register)
            .cloned()
            .unwrap_or(Value::Integer(0))
    }

    fn write(&mut self, register: &Register, value: Value) {
        trace!("{register} <- {value}");
        self.registers.insert(register.clone(), value);
    }
}

enum Completion {
    Returned(Option<Value>),
    Exited(i64),
}

type Code<'a> = HashMap<&'a str, PreparedFunction<'a>>;

fn prepare(program: &Program) -> Code<'_> {
    program
        .functions
        .iter()
        .chain(std::iter::once(&program.main))
        .map(|function| {
            let labels = function
                .instructions
                .iter()
                .enumerate()
                .filter_map(|(i, s)| match &s.kind {
                    StatementKind::Label { name } | StatementKind::FunctionLabel { name } => {
                        Some((name.as_str(), i))
                    }
                    _ => None,
                })
                .collect();

            (function.name.as_str(), PreparedFunction { function, labels })
        })
        .collect()
}

fn lookup<'c, 'a>(code: &'c Code<'a>, name: &str) -> ExecutionOutcome<&'c PreparedFunction<'a>> {
    code.get(name)
        .ok_or_else(|| ExecutionError::UnknownFunction(name.to_owned()))
}

/// Memory, streams and counters of one running program
struct Machine {
    memory: HashMap<Rc<str>, MemoryBlock>,
    word_size: usize,
    console: Console,
    allocations: usize,
    steps: u64,
    max_steps: u64,
}

impl Machine {
    fn new(program: &Program, word_size: usize, limits: &ExecutionLimits) -> Self {
        let mut memory = HashMap::new();

        for global in program.globals.values() {
            memory.insert(Rc::from(global.mangled_name.as_str()), MemoryBlock::new(global.bytes));
        }

        for literal in &program.string_literals {
            let mut bytes = literal.value.as_bytes().to_vec();
            bytes.push(0);
            memory.insert(Rc::from(literal.name.as_str()), MemoryBlock::from_bytes(&bytes));
        }

        Self {
            memory,
            word_size,
            console: Console::new(&limits.stdin),
            allocations: 0,
            steps: 0,
            max_steps: limits.max_steps,
        }
    }

    fn tick(&mut self) -> ExecutionOutcome<()> {
        self.steps += 1;

        if self.steps > self.max_steps {
            return Err(ExecutionError::StepLimitExceeded(self.max_steps));
        }

        Ok(())
    }

    fn allocate(&mut self, kind: &str, bytes: usize) -> Value {
        let name: Rc<str> = Rc::from(format!("{kind}_{}", self.allocations));
        self.allocations += 1;
        self.memory.insert(name.clone(), MemoryBlock::new(bytes));

        Value::Pointer {
            block: name,
            offset: 0,
        }
    }

    fn block(&self, name: &str) -> ExecutionOutcome<&MemoryBlock> {
        self.memory
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownSymbol(name.to_owned()))
    }

    fn block_mut(&mut self, name: &str) -> ExecutionOutcome<&mut MemoryBlock> {
        self.memory
            .get_mut(name)
            .ok_or_else(|| ExecutionError::UnknownSymbol(name.to_owned()))
    }

    fn address(value: &Value, displacement: i64) -> ExecutionOutcome<(Rc<str>, i64)> {
        match value {
            Value::Pointer { block, offset } => Ok((block.clone(), offset + displacement)),
            Value::Integer(address) => Err(ExecutionError::PointerMisuse(format!(
                "dereference of the integer {address}"
            ))),
        }
    }

    fn load_word(&self, address: &Value, displacement: i64) -> ExecutionOutcome<Value> {
        let (name, offset) = Self::address(address, displacement)?;
        let block = self.block(&name)?;
        let start = block.check(&name, offset, self.word_size)?;
        block.read_word(start, self.word_size)
    }

    fn store_word(&mut self, address: &Value, displacement: i64, value: Value) -> ExecutionOutcome<()> {
        let (name, offset) = Self::address(address, displacement)?;
        let word_size = self.word_size;
        let block = self.block_mut(&name)?;
        let start = block.check(&name, offset, word_size)?;
        block.write_word(start, word_size, value)
    }

    fn load_byte(&self, address: &Value) -> ExecutionOutcome<u8> {
        let (name, offset) = Self::address(address, 0)?;
        let block = self.block(&name)?;
        let start = block.check(&name, offset, 1)?;
        block.read_byte(start, self.word_size)
    }

    fn store_byte(&mut self, address: &Value, byte: u8) -> ExecutionOutcome<()> {
        let (name, offset) = Self::address(address, 0)?;
        let word_size = self.word_size;
        let block = self.block_mut(&name)?;
        let start = block.check(&name, offset, 1)?;
        block.write_byte(start, word_size, byte)
    }

    fn global(name: &str) -> Value {
        Value::Pointer {
            block: Rc::from(name),
            offset: 0,
        }
    }

    fn c_string(&self, address: &Value) -> ExecutionOutcome<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut cursor = address.clone();

        loop {
            match self.load_byte(&cursor)? {
                0 => return Ok(bytes),
                byte => bytes.push(byte),
            }
            cursor = cursor.offset_by(1);
        }
    }

    /// Runs a syscall, yielding its result or the requested exit code
    fn syscall(&mut self, name: SyscallName, arguments: &[Value]) -> ExecutionOutcome<Result<Value, i64>> {
        let argument = |n: usize| {
            arguments.get(n).cloned().ok_or_else(|| {
                ExecutionError::UnsupportedSyscall(format!("{name} without argument {}", n + 1))
            })
        };

        let result = match name {
            SyscallName::Print => {
                let text = self.c_string(&argument(0)?)?;
                self.console.write(&text);
                Value::Integer(0)
            }
            SyscallName::Write => {
                let buffer = argument(1)?;
                let length = argument(2)?.integer("write length")?;
                let mut bytes = Vec::new();
                for i in 0..length {
                    bytes.push(self.load_byte(&buffer.offset_by(i))?);
                }
                self.console.write(&bytes);
                Value::Integer(length)
            }
            SyscallName::PrintInt => {
                let value = argument(0)?.integer("printInt")?;
                self.console.write(value.to_string().as_bytes());
                Value::Integer(0)
            }
            SyscallName::Read => {
                let buffer = argument(1)?;
                let length = argument(2)?.integer("read length")?;
                let bytes = self.console.read(usize::try_from(length).unwrap_or(0));
                for (i, byte) in bytes.iter().enumerate() {
                    self.store_byte(&buffer.offset_by(i as i64), *byte)?;
                }
                Value::Integer(bytes.len() as i64)
            }
            SyscallName::ReadInt => Value::Integer(self.console.read_int()?),
            SyscallName::Sbrk => {
                let bytes = argument(0)?.integer("sbrk size")?;
                self.allocate("heap", usize::try_from(bytes).unwrap_or(0))
            }
            SyscallName::Mmap => {
                let bytes = argument(1)?.integer("mmap length")?;
                self.allocate("heap", usize::try_from(bytes).unwrap_or(0))
            }
            SyscallName::Exit => return Ok(Err(argument(0)?.integer("exit code")?)),
        };

        Ok(Ok(result))
    }
}

fn add(lhs: Value, rhs: Value) -> ExecutionOutcome<Value> {
    match (&lhs, &rhs) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_add(*b))),
        (Value::Pointer { .. }, Value::Integer(amount)) => Ok(lhs.offset_by(*amount)),
        (Value::Integer(amount), Value::Pointer { .. }) => Ok(rhs.offset_by(*amount)),
        _ => Err(ExecutionError::PointerMisuse(format!("{lhs} + {rhs}"))),
    }
}

fn subtract(lhs: Value, rhs: Value) -> ExecutionOutcome<Value> {
    match (&lhs, &rhs) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_sub(*b))),
        (Value::Pointer { .. }, Value::Integer(amount)) => Ok(lhs.offset_by(amount.wrapping_neg())),
        (
            Value::Pointer { block: a, offset: x },
            Value::Pointer { block: b, offset: y },
        ) if a == b => Ok(Value::Integer(x - y)),
        _ => Err(ExecutionError::PointerMisuse(format!("{lhs} - {rhs}"))),
    }
}

fn greater(lhs: &Value, rhs: &Value) -> ExecutionOutcome<bool> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Ok(a > b),
        (
            Value::Pointer { block: a, offset: x },
            Value::Pointer { block: b, offset: y },
        ) if a == b => Ok(x > y),
        _ => Err(ExecutionError::PointerMisuse(format!("{lhs} > {rhs}"))),
    }
}

impl<'a> Frame<'a> {
    fn enter(function: &'a PreparedFunction<'a>, arguments: Vec<Value>, return_to: Option<Register>) -> Self {
        let registers = function
            .function
            .arguments
            .iter()
            .cloned()
            .zip(arguments)
            .collect();

        Self {
            function,
            pc: 0,
            registers,
            stack_slots: HashMap::new(),
            return_to,
        }
    }

    fn jump(&mut self, label: &str) -> ExecutionOutcome<()> {
        self.pc = *self
            .function
            .labels
            .get(label)
            .ok_or_else(|| ExecutionError::UnknownLabel(label.to_owned()))?;
        Ok(())
    }
}

enum Step<'a> {
    Next,
    Call {
        callee: &'a PreparedFunction<'a>,
        arguments: Vec<Value>,
        destination: Option<Register>,
    },
    Return(Option<Value>),
    Exit(i64),
}

/// Executes one statement of the innermost frame
fn step<'a>(
    code: &'a Code<'a>,
    machine: &mut Machine,
    frame: &mut Frame<'a>,
    kind: &StatementKind,
) -> ExecutionOutcome<Step<'a>> {
    use StatementKind::*;

    match kind {
        Empty | Label { .. } | FunctionLabel { .. } => {}
        Move { from, to } => frame.write(to, frame.read(from)),
        LoadImmediate { value, destination } => frame.write(destination, Value::Integer(*value)),
        AddImmediate { register, amount } => frame.write(register, frame.read(register).offset_by(*amount)),
        Add { lhs, rhs, destination } => frame.write(destination, add(frame.read(lhs), frame.read(rhs))?),
        Subtract { lhs, rhs, destination } => {
            frame.write(destination, subtract(frame.read(lhs), frame.read(rhs))?)
        }
        Multiply { lhs, rhs, destination } => {
            let product = frame
                .read(lhs)
                .integer("multiplication")?
                .wrapping_mul(frame.read(rhs).integer("multiplication")?);
            frame.write(destination, Value::Integer(product));
        }
        Increment { register } => frame.write(register, frame.read(register).offset_by(1)),
        Goto { label } => frame.jump(label)?,
        GotoIfEqual { lhs, rhs, label } => {
            if frame.read(lhs) == frame.read(rhs) {
                frame.jump(label)?;
            }
        }
        GotoIfNotEqual { lhs, rhs, label } => {
            if frame.read(lhs) != frame.read(rhs) {
                frame.jump(label)?;
            }
        }
        GotoIfZero { register, label } => {
            if frame.read(register) == Value::Integer(0) {
                frame.jump(label)?;
            }
        }
        GotoIfGreater { lhs, rhs, label } => {
            if greater(&frame.read(lhs), &frame.read(rhs))? {
                frame.jump(label)?;
            }
        }
        LoadGlobal { from, to } => frame.write(to, machine.load_word(&Machine::global(from), 0)?),
        StoreGlobal { from, to } => machine.store_word(&Machine::global(to), 0, frame.read(from))?,
        LoadMemory { from, to, offset } => frame.write(to, machine.load_word(&frame.read(from), *offset)?),
        StoreMemory { from, address, offset } => {
            machine.store_word(&frame.read(address), *offset, frame.read(from))?
        }
        LoadMemoryByte { address, to } => {
            let byte = machine.load_byte(&frame.read(address))?;
            frame.write(to, Value::Integer(i64::from(byte)));
        }
        StoreMemoryByte { address, contents } => {
            let byte = frame.read(contents).integer("byte store")? as u8;
            machine.store_byte(&frame.read(address), byte)?;
        }
        StoreZeroToMemory { address, offset } => {
            machine.store_word(&frame.read(address), *offset, Value::Integer(0))?
        }
        LoadSymbolAddress { symbol_name, to } => {
            if !machine.memory.contains_key(symbol_name.as_str()) && !code.contains_key(symbol_name.as_str()) {
                return Err(ExecutionError::UnknownSymbol(symbol_name.clone()));
            }
            frame.write(to, Machine::global(symbol_name));
        }
        Alloca { bytes, register } => {
            let pointer = machine.allocate("alloca", usize::try_from(*bytes).unwrap_or(0));
            frame.write(register, pointer);
        }
        CallByName {
            function,
            arguments,
            destination,
        } => {
            return Ok(Step::Call {
                callee: lookup(code, function)?,
                arguments: arguments.iter().map(|a| frame.read(a)).collect(),
                destination: destination.clone(),
            });
        }
        CallByRegister {
            function,
            arguments,
            destination,
        } => {
            let callee = match frame.read(function) {
                Value::Pointer { block, offset: 0 } => lookup(code, &block)?,
                other => {
                    return Err(ExecutionError::PointerMisuse(format!(
                        "call through {other}, which is not a function"
                    )));
                }
            };

            return Ok(Step::Call {
                callee,
                arguments: arguments.iter().map(|a| frame.read(a)).collect(),
                destination: destination.clone(),
            });
        }
        Return { register } => return Ok(Step::Return(register.as_ref().map(|r| frame.read(r)))),
        Syscall {
            name,
            arguments,
            destination,
        } => {
            let values: Vec<Value> = arguments
                .iter()
                .map(|argument| match argument {
                    SyscallArgument::Register(register) => frame.read(register),
                    SyscallArgument::Immediate(value) => Value::Integer(*value),
                })
                .collect();

            match machine.syscall(*name, &values)? {
                Ok(result) => {
                    if let Some(destination) = destination {
                        frame.write(destination, result);
                    }
                }
                Err(code) => return Ok(Step::Exit(code)),
            }
        }
        StackLoad { location, to } => {
            let value = frame
                .stack_slots
                .get(location)
                .cloned()
                .unwrap_or(Value::Integer(0));
            frame.write(to, value);
        }
        StackStore { from, location } => {
            let value = frame.read(from);
            frame.stack_slots.insert(*location, value);
        }
    }

    Ok(Step::Next)
}

/// Runs `name` to completion on its own call stack
fn run<'a>(
    code: &'a Code<'a>,
    machine: &mut Machine,
    name: &str,
    arguments: Vec<Value>,
) -> ExecutionOutcome<Completion> {
    let mut frames = vec![Frame::enter(lookup(code, name)?, arguments, None)];

    while let Some(frame) = frames.last_mut() {
        machine.tick()?;

        let function: &'a PreparedFunction<'a> = frame.function;
        let outcome = match function.function.instructions.get(frame.pc) {
            Some(statement) => {
                frame.pc += 1;
                step(code, machine, frame, &statement.kind)?
            }
            None => Step::Return(None),
        };

        match outcome {
            Step::Next => {}
            Step::Call {
                callee,
                arguments,
                destination,
            } => frames.push(Frame::enter(callee, arguments, destination)),
            Step::Return(value) => {
                let finished = frames.pop();

                match frames.last_mut() {
                    None => return Ok(Completion::Returned(value)),
                    Some(caller) => {
                        if let Some(destination) = finished.and_then(|f| f.return_to) {
                            caller.write(&destination, value.unwrap_or(Value::Integer(0)));
                        }
                    }
                }
            }
            Step::Exit(code) => return Ok(Completion::Exited(code)),
        }
    }

    Ok(Completion::Returned(None))
}

/// Runs the global destructor and then the leak checker, returning the exit
/// code if either of them exits
fn finish<'a>(functions: &'a Code<'a>, machine: &mut Machine) -> ExecutionOutcome<Option<i64>> {
    for cleanup in [runtime::FREE_GLOBALS, runtime::VERIFY_NO_LEAKS] {
        if !functions.contains_key(cleanup) {
            continue;
        }

        if let Completion::Exited(code) = run(functions, machine, cleanup, vec![])? {
            return Ok(Some(code));
        }
    }

    Ok(None)
}

/// Runs `program` from `main`. When `main` returns, the global destructor
/// and the leak checker run before the process exits with `main`'s result.
pub fn interpret(
    program: &Program,
    word_size: usize,
    limits: &ExecutionLimits,
) -> ExecutionOutcome<ExecutionResult> {
    let functions = prepare(program);
    let mut machine = Machine::new(program, word_size, limits);

    let exit_code = match run(&functions, &mut machine, &program.main.name, vec![])? {
        Completion::Exited(code) => code,
        Completion::Returned(value) => {
            let code = value
                .map(|v| v.integer("exit code"))
                .transpose()?
                .unwrap_or(0);

            finish(&functions, &mut machine)?.unwrap_or(code)
        }
    };

    debug!("interpreted {} steps, exit code {exit_code}", machine.steps);

    Ok(ExecutionResult {
        exit_code,
        stdout: machine.console.into_stdout(),
    })
}

/// Calls the function `name` of `program` with integer `arguments` and
/// reports what it returns. Globals and string literals are set up as for a
/// whole program, but the global destructor and the leak checker do not run.
pub fn interpret_function(
    program: &Program,
    name: &str,
    arguments: &[i64],
    word_size: usize,
    limits: &ExecutionLimits,
) -> ExecutionOutcome<ExecutionResult> {
    let functions = prepare(program);
    let mut machine = Machine::new(program, word_size, limits);
    let arguments = arguments.iter().copied().map(Value::Integer).collect();

    let exit_code = match run(&functions, &mut machine, name, arguments)? {
        Completion::Exited(code) => code,
        Completion::Returned(value) => value
            .map(|v| v.integer("return value"))
            .transpose()?
            .unwrap_or(0),
    };

    Ok(ExecutionResult {
        exit_code,
        stdout: machine.console.into_stdout(),
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::middle::{
        runtime::{self, RuntimeSupport},
        selector::select_program,
        tac::parser::parse_functions,
        typed::{self, BinaryOperator, Type, build::*},
    };

    fn run_typed(program: &typed::Program) -> ExecutionResult {
        let support = RuntimeSupport::sbrk_and_print(8);
        let selected = select_program(program, &support).unwrap();
        interpret(&selected, 8, &ExecutionLimits::default()).unwrap()
    }

    #[test]
    fn nested_multiplication() {
        let product = binary(
            BinaryOperator::Multiply,
            binary(
                BinaryOperator::Multiply,
                number(2),
                binary(BinaryOperator::Multiply, number(3), number(4)),
            ),
            number(5),
        );

        let result = run_typed(&main_only(vec![ret(product)]));

        assert_eq!(result.exit_code, 120);
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn string_equality_selects_the_true_branch() {
        let condition = binary(
            BinaryOperator::Equal,
            binary(BinaryOperator::Concatenate, string("a"), string("b")),
            string("ab"),
        );

        let result = run_typed(&main_only(vec![ret(ternary(condition, number(5), number(6)))]));

        assert_eq!(result.exit_code, 5, "stdout: {}", result.stdout);
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn print_writes_to_stdout() {
        let result = run_typed(&main_only(vec![
            typed::Statement::Expression(call("print", vec![string("hi")], Type::Integer)),
            ret(number(0)),
        ]));

        assert_eq!(result.stdout, "hi");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn leaked_allocations_are_reported_after_main() {
        let support = RuntimeSupport::sbrk_and_print(8);
        let mut program = select_program(&main_only(vec![ret(number(0))]), &support).unwrap();

        for function in runtime::library(&support).unwrap() {
            if program.function(&function.name).is_none() {
                program.functions.push(function);
            }
        }

        program.main = parse_functions(indoc! {"
            (function) main():
                r:size = 4
                r:buffer = my_malloc(r:size)
                r:zero = 0
                return r:zero
        "})
        .unwrap()
        .remove(0);

        let result = interpret(&program, 8, &ExecutionLimits::default()).unwrap();

        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout, "Leaks detected! Exiting.");
    }

    #[test]
    fn single_functions_take_their_arguments() {
        let program = Program {
            globals: Default::default(),
            functions: parse_functions(indoc! {"
                (function) weighted(r:a, r:b):
                    r:three = 3
                    r:scaled = r:b * r:three
                    r:sum = r:a + r:scaled
                    return r:sum
            "})
            .unwrap(),
            main: parse_functions("(function) main():\n    r:zero = 0\n    return r:zero\n")
                .unwrap()
                .remove(0),
            string_literals: vec![],
        };

        let limits = ExecutionLimits::default();

        assert_eq!(interpret_function(&program, "weighted", &[4, 5], 8, &limits).unwrap().exit_code, 19);
        assert_eq!(interpret_function(&program, "weighted", &[-4, 1], 8, &limits).unwrap().exit_code, -1);
        assert_eq!(
            interpret_function(&program, "missing", &[], 8, &limits),
            Err(ExecutionError::UnknownFunction("missing".into()))
        );
    }

    #[test]
    fn runaway_loops_hit_the_step_limit() {
        let mut program = select_program(&main_only(vec![ret(number(0))]), &RuntimeSupport::sbrk_and_print(8)).unwrap();
        program.main = parse_functions("(function) main():\n    main_spin:\n    goto main_spin\n")
            .unwrap()
            .remove(0);

        let limits = ExecutionLimits {
            max_steps: 1_000,
            ..ExecutionLimits::default()
        };

        assert_eq!(
            interpret(&program, 8, &limits),
            Err(ExecutionError::StepLimitExceeded(1_000))
        );
    }

    #[test]
    fn stored_pointers_survive_memory() {
        let mut block = MemoryBlock::new(16);
        let pointer = Value::Pointer {
            block: Rc::from("heap_0"),
            offset: 8,
        };

        block.write_word(8, 8, pointer.clone()).unwrap();

        assert_eq!(block.read_word(8, 8).unwrap(), pointer);
        assert!(matches!(block.read_byte(9, 8), Err(ExecutionError::PointerMisuse(_))));
    }

    #[test]
    fn integer_words_can_be_read_bytewise() {
        let mut block = MemoryBlock::new(8);

        block.write_word(0, 4, Value::Integer(0x0102)).unwrap();
        assert_eq!(block.read_byte(0, 4).unwrap(), 2);
        assert_eq!(block.read_byte(1, 4).unwrap(), 1);

        block.write_byte(0, 4, 0xff).unwrap();
        assert_eq!(block.read_word(0, 4).unwrap(), Value::Integer(0x01ff));

        assert!(block.check("block", 6, 4).is_err());
        assert!(block.check("block", -1, 1).is_err());
    }
}
