//! Types shared by the three-address code interpreter and the target
//! simulator.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Instructions executed before giving up
    pub max_steps: u64,
    pub stdin: String,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            stdin: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub stdout: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("call to unknown function '{0}'")]
    UnknownFunction(String),

    #[error("jump to unknown label '{0}'")]
    UnknownLabel(String),

    #[error("reference to unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("invalid memory access: {0}")]
    InvalidMemoryAccess(String),

    #[error("pointer misuse: {0}")]
    PointerMisuse(String),

    #[error("register {0} was read after a syscall clobbered it")]
    ClobberedRegister(String),

    #[error("unsupported syscall: {0}")]
    UnsupportedSyscall(String),

    #[error("execution did not finish within {0} steps")]
    StepLimitExceeded(u64),

    #[error("program tried to read past the end of stdin")]
    MissingInput,
}

pub type ExecutionOutcome<T> = Result<T, ExecutionError>;

/// Standard streams as seen by a running program
#[derive(Debug, Default)]
pub(crate) struct Console {
    stdin: VecDeque<u8>,
    stdout: Vec<u8>,
}

impl Console {
    pub fn new(stdin: &str) -> Self {
        Self {
            stdin: stdin.bytes().collect(),
            stdout: vec![],
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.stdout.extend_from_slice(bytes);
    }

    /// Up to `max` bytes of pending input
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let count = max.min(self.stdin.len());
        self.stdin.drain(..count).collect()
    }

    /// Reads one line and parses an optionally negative decimal prefix of it,
    /// stopping at the first non-digit.
    pub fn read_int(&mut self) -> ExecutionOutcome<i64> {
        if self.stdin.is_empty() {
            return Err(ExecutionError::MissingInput);
        }

        let mut line = Vec::new();

        while let Some(byte) = self.stdin.pop_front() {
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }

        let (negative, digits) = match line.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, line.as_slice()),
        };

        let value = digits
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .fold(0i64, |value, digit| {
                value.wrapping_mul(10).wrapping_add(i64::from(digit - b'0'))
            });

        Ok(if negative { value.wrapping_neg() } else { value })
    }

    pub fn into_stdout(self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}
