//! Reads the textual three-address code dump back into a [`Program`].
//!
//! The format is line oriented:
//!
//! ```text
//! (global) counter: counter_1 8
//! (string) greeting: "hello\n"
//!
//! (function) main():
//!     r:x = 5; comment
//!     return r:x
//! ```

use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use thiserror::Error;

use crate::middle::tac::{
    Function, GlobalInfo, Program, Register, StackLocation, Statement, StatementKind,
    StringLiteral, SyscallArgument, SyscallName,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Register(String),
    Identifier(String),
    Integer(i64),
    StringLiteral(String),

    Equals,       // =
    PlusEquals,   // +=
    PlusPlus,     // ++
    Plus,         // +
    Minus,        // -
    Asterisk,     // *
    DoubleEquals, // ==
    NotEquals,    // !=
    GreaterThan,  // >
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    Comma,        // ,
    Colon,        // :
    Ampersand,    // &
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    column: usize,
}

struct Lexer<'source> {
    chars: PeekNth<Chars<'source>>,
    line: usize,
    column: usize,
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'source> Lexer<'source> {
    fn tokenize(line: usize, column: usize, text: &'source str) -> Result<Vec<Token>, ParseError> {
        let mut lexer = Self {
            chars: peek_nth(text.chars()),
            line,
            column,
        };

        let mut tokens = Vec::new();

        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.column += 1;
        Some(c)
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> String {
        let mut taken = String::new();

        while let Some(&c) = self.chars.peek() {
            if !predicate(c) {
                break;
            }

            taken.push(c);
            self.bump();
        }

        taken
    }

    fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        self.take_while(char::is_whitespace);

        let column = self.column;
        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };

        let kind = match c {
            'r' if self.chars.peek_nth(1) == Some(&':')
                && self.chars.peek_nth(2).is_some_and(|&c| is_identifier_char(c)) =>
            {
                self.bump();
                self.bump();
                TokenKind::Register(self.take_while(is_identifier_char))
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                TokenKind::Identifier(self.take_while(is_identifier_char))
            }
            c if c.is_ascii_digit() => TokenKind::Integer(self.integer(false)?),
            '-' if self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.bump();
                TokenKind::Integer(self.integer(true)?)
            }
            '"' => {
                self.bump();
                TokenKind::StringLiteral(self.string_literal()?)
            }
            _ => {
                self.bump();

                match c {
                    '=' if self.chars.peek() == Some(&'=') => {
                        self.bump();
                        TokenKind::DoubleEquals
                    }
                    '=' => TokenKind::Equals,
                    '!' if self.chars.peek() == Some(&'=') => {
                        self.bump();
                        TokenKind::NotEquals
                    }
                    '+' if self.chars.peek() == Some(&'=') => {
                        self.bump();
                        TokenKind::PlusEquals
                    }
                    '+' if self.chars.peek() == Some(&'+') => {
                        self.bump();
                        TokenKind::PlusPlus
                    }
                    '+' => TokenKind::Plus,
                    '-' => TokenKind::Minus,
                    '*' => TokenKind::Asterisk,
                    '>' => TokenKind::GreaterThan,
                    '(' => TokenKind::OpenParen,
                    ')' => TokenKind::CloseParen,
                    '[' => TokenKind::OpenBracket,
                    ']' => TokenKind::CloseBracket,
                    ',' => TokenKind::Comma,
                    ':' => TokenKind::Colon,
                    '&' => TokenKind::Ampersand,
                    c => return Err(self.error(format!("unexpected character '{c}'"))),
                }
            }
        };

        Ok(Some(Token { kind, column }))
    }

    fn integer(&mut self, negative: bool) -> Result<i64, ParseError> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        let literal = if negative { format!("-{digits}") } else { digits };

        literal
            .parse()
            .map_err(|_| self.error(format!("integer literal '{literal}' is out of range")))
    }

    fn string_literal(&mut self) -> Result<String, ParseError> {
        let mut value = String::new();

        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string literal"));
            };

            match c {
                '"' => return Ok(value),
                '\\' => {
                    let escaped = match self.bump() {
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('0') => '\0',
                        Some('x') => {
                            let hex: String = [self.bump(), self.bump()].into_iter().flatten().collect();
                            u8::from_str_radix(&hex, 16)
                                .map(char::from)
                                .map_err(|_| self.error(format!("invalid escape '\\x{hex}'")))?
                        }
                        Some(other) => {
                            return Err(self.error(format!("unknown escape '\\{other}'")));
                        }
                        None => return Err(self.error("unterminated string literal")),
                    };

                    value.push(escaped);
                }
                c => value.push(c),
            }
        }
    }
}

struct LineParser<'t> {
    line: usize,
    tokens: &'t [Token],
}

impl LineParser<'_> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.tokens.first().map_or(1, |t| t.column),
            message: message.into(),
        }
    }

    fn kinds(&self) -> Vec<&TokenKind> {
        self.tokens.iter().map(|t| &t.kind).collect()
    }

    /// Parses `r:a, r:b)` into the register list
    fn register_list(&self, rest: &[&TokenKind]) -> Result<Vec<Register>, ParseError> {
        let Some((TokenKind::CloseParen, inner)) = rest.split_last() else {
            return Err(self.error("expected ')' at the end of the argument list"));
        };

        if inner.is_empty() {
            return Ok(vec![]);
        }

        inner
            .split(|kind| **kind == TokenKind::Comma)
            .map(|argument| match argument {
                [TokenKind::Register(name)] => Ok(Register::new(name)),
                _ => Err(self.error("expected a register in the argument list")),
            })
            .collect()
    }

    fn syscall(
        &self,
        name: &str,
        rest: &[&TokenKind],
        destination: Option<Register>,
    ) -> Result<StatementKind, ParseError> {
        let name = name
            .parse::<SyscallName>()
            .map_err(|_| self.error(format!("unknown syscall '{name}'")))?;

        let arguments = rest
            .iter()
            .map(|kind| match kind {
                TokenKind::Register(register) => Ok(SyscallArgument::Register(Register::new(register))),
                TokenKind::Integer(value) => Ok(SyscallArgument::Immediate(*value)),
                _ => Err(self.error("syscall arguments must be registers or integers")),
            })
            .collect::<Result<_, _>>()?;

        Ok(StatementKind::Syscall {
            name,
            arguments,
            destination,
        })
    }

    fn stack_location(&self, kind: &str, index: i64) -> Result<StackLocation, ParseError> {
        let index = usize::try_from(index).map_err(|_| self.error("negative stack index"))?;

        match kind {
            "spill" => Ok(StackLocation::Spill(index)),
            "argument" => Ok(StackLocation::Argument(index)),
            _ => Err(self.error(format!("unknown stack location '{kind}'"))),
        }
    }

    fn statement(&self) -> Result<StatementKind, ParseError> {
        use TokenKind as T;

        let r = |name: &String| Register::new(name);
        let kinds = self.kinds();

        let kind = match kinds.as_slice() {
            [] => StatementKind::Empty,
            [T::Register(to), T::Equals, T::Register(from)] => StatementKind::Move {
                from: r(from),
                to: r(to),
            },
            [T::Register(destination), T::Equals, T::Integer(value)] => {
                StatementKind::LoadImmediate {
                    value: *value,
                    destination: r(destination),
                }
            }
            [T::Register(register), T::PlusEquals, T::Integer(amount)] => {
                StatementKind::AddImmediate {
                    register: r(register),
                    amount: *amount,
                }
            }
            [T::Register(destination), T::Equals, T::Register(lhs), operator, T::Register(rhs)] => {
                let (lhs, rhs, destination) = (r(lhs), r(rhs), r(destination));

                match operator {
                    T::Plus => StatementKind::Add {
                        lhs,
                        rhs,
                        destination,
                    },
                    T::Minus => StatementKind::Subtract {
                        lhs,
                        rhs,
                        destination,
                    },
                    T::Asterisk => StatementKind::Multiply {
                        lhs,
                        rhs,
                        destination,
                    },
                    _ => return Err(self.error("expected '+', '-' or '*'")),
                }
            }
            [T::Register(register), T::PlusPlus] => StatementKind::Increment {
                register: r(register),
            },
            [T::Identifier(name), T::Colon] => StatementKind::Label { name: name.clone() },
            [T::Identifier(keyword), T::Identifier(name), T::Colon] if keyword == "fn" => {
                StatementKind::FunctionLabel { name: name.clone() }
            }
            [T::Identifier(keyword), T::Identifier(label)] if keyword == "goto" => {
                StatementKind::Goto {
                    label: label.clone(),
                }
            }
            [
                T::Identifier(keyword),
                T::Identifier(label),
                T::Identifier(condition),
                T::Register(register),
                T::DoubleEquals,
                T::Integer(0),
            ] if keyword == "goto" && condition == "if" => StatementKind::GotoIfZero {
                register: r(register),
                label: label.clone(),
            },
            [
                T::Identifier(keyword),
                T::Identifier(label),
                T::Identifier(condition),
                T::Register(lhs),
                comparison,
                T::Register(rhs),
            ] if keyword == "goto" && condition == "if" => {
                let (lhs, rhs, label) = (r(lhs), r(rhs), label.clone());

                match comparison {
                    T::DoubleEquals => StatementKind::GotoIfEqual { lhs, rhs, label },
                    T::NotEquals => StatementKind::GotoIfNotEqual { lhs, rhs, label },
                    T::GreaterThan => StatementKind::GotoIfGreater { lhs, rhs, label },
                    _ => return Err(self.error("expected '==', '!=' or '>'")),
                }
            }
            [T::Register(to), T::Equals, T::Asterisk, T::Identifier(global)] => {
                StatementKind::LoadGlobal {
                    from: global.clone(),
                    to: r(to),
                }
            }
            [T::Asterisk, T::Identifier(global), T::Equals, T::Register(from)] => {
                StatementKind::StoreGlobal {
                    from: r(from),
                    to: global.clone(),
                }
            }
            [
                T::Register(to),
                T::Equals,
                T::Asterisk,
                T::OpenParen,
                T::Register(from),
                T::Plus,
                T::Integer(offset),
                T::CloseParen,
            ] => StatementKind::LoadMemory {
                from: r(from),
                to: r(to),
                offset: *offset,
            },
            [
                T::Asterisk,
                T::OpenParen,
                T::Register(address),
                T::Plus,
                T::Integer(offset),
                T::CloseParen,
                T::Equals,
                value,
            ] => match value {
                T::Register(from) => StatementKind::StoreMemory {
                    from: r(from),
                    address: r(address),
                    offset: *offset,
                },
                T::Integer(0) => StatementKind::StoreZeroToMemory {
                    address: r(address),
                    offset: *offset,
                },
                _ => return Err(self.error("only registers or 0 can be stored to memory")),
            },
            [T::Register(to), T::Equals, T::Asterisk, T::Register(address)] => {
                StatementKind::LoadMemoryByte {
                    address: r(address),
                    to: r(to),
                }
            }
            [T::Asterisk, T::Register(address), T::Equals, T::Register(contents)] => {
                StatementKind::StoreMemoryByte {
                    address: r(address),
                    contents: r(contents),
                }
            }
            [T::Register(to), T::Equals, T::Ampersand, T::Identifier(symbol)] => {
                StatementKind::LoadSymbolAddress {
                    symbol_name: symbol.clone(),
                    to: r(to),
                }
            }
            [
                T::Register(register),
                T::Equals,
                T::Identifier(keyword),
                T::OpenParen,
                T::Integer(bytes),
                T::CloseParen,
            ] if keyword == "alloca" => StatementKind::Alloca {
                bytes: *bytes,
                register: r(register),
            },
            [T::Identifier(keyword)] if keyword == "return" => {
                StatementKind::Return { register: None }
            }
            [T::Identifier(keyword), T::Register(register)] if keyword == "return" => {
                StatementKind::Return {
                    register: Some(r(register)),
                }
            }
            [
                T::Register(to),
                T::Equals,
                T::Identifier(keyword),
                T::OpenBracket,
                T::Identifier(location),
                T::Integer(index),
                T::CloseBracket,
            ] if keyword == "stack" => StatementKind::StackLoad {
                location: self.stack_location(location, *index)?,
                to: r(to),
            },
            [
                T::Identifier(keyword),
                T::OpenBracket,
                T::Identifier(location),
                T::Integer(index),
                T::CloseBracket,
                T::Equals,
                T::Register(from),
            ] if keyword == "stack" => StatementKind::StackStore {
                from: r(from),
                location: self.stack_location(location, *index)?,
            },
            [
                T::Register(destination),
                T::Equals,
                T::Identifier(keyword),
                T::Identifier(name),
                rest @ ..,
            ] if keyword == "syscall" => self.syscall(name, rest, Some(r(destination)))?,
            [T::Identifier(keyword), T::Identifier(name), rest @ ..] if keyword == "syscall" => {
                self.syscall(name, rest, None)?
            }
            [
                T::Register(destination),
                T::Equals,
                T::Identifier(function),
                T::OpenParen,
                rest @ ..,
            ] => StatementKind::CallByName {
                function: function.clone(),
                arguments: self.register_list(rest)?,
                destination: Some(r(destination)),
            },
            [T::Identifier(function), T::OpenParen, rest @ ..] => StatementKind::CallByName {
                function: function.clone(),
                arguments: self.register_list(rest)?,
                destination: None,
            },
            [
                T::Register(destination),
                T::Equals,
                T::Register(function),
                T::OpenParen,
                rest @ ..,
            ] => StatementKind::CallByRegister {
                function: r(function),
                arguments: self.register_list(rest)?,
                destination: Some(r(destination)),
            },
            [T::Register(function), T::OpenParen, rest @ ..] => StatementKind::CallByRegister {
                function: r(function),
                arguments: self.register_list(rest)?,
                destination: None,
            },
            _ => return Err(self.error("unrecognized statement")),
        };

        Ok(kind)
    }
}

fn parse_statement(line: usize, text: &str) -> Result<Statement, ParseError> {
    let indentation = text.len() - text.trim_start().len();
    let text = text.trim();

    let (code, why) = match text.split_once(';') {
        Some((code, why)) => (code, why.trim()),
        None => (text, ""),
    };

    let tokens = Lexer::tokenize(line, indentation + 1, code)?;
    let kind = LineParser {
        line,
        tokens: &tokens,
    }
    .statement()?;

    Ok(Statement::new(kind, why))
}

#[derive(Default)]
struct Items {
    globals: BTreeMap<String, GlobalInfo>,
    string_literals: Vec<StringLiteral>,
    functions: Vec<Function>,
}

fn parse_items(text: &str) -> Result<Items, ParseError> {
    use TokenKind as T;

    let mut items = Items::default();

    for (index, line_text) in text.lines().enumerate() {
        let line = index + 1;

        if line_text.trim().is_empty() {
            continue;
        }

        if line_text.starts_with(char::is_whitespace) {
            let statement = parse_statement(line, line_text)?;

            let Some(function) = items.functions.last_mut() else {
                return Err(ParseError {
                    line,
                    column: 1,
                    message: "instruction outside of a function".into(),
                });
            };

            function.instructions.push(statement);
            continue;
        }

        let tokens = Lexer::tokenize(line, 1, line_text)?;
        let parser = LineParser {
            line,
            tokens: &tokens,
        };

        match parser.kinds().as_slice() {
            [
                T::OpenParen,
                T::Identifier(header),
                T::CloseParen,
                T::Identifier(name),
                T::Colon,
                T::Identifier(mangled_name),
                T::Integer(bytes),
            ] if header == "global" => {
                let bytes = usize::try_from(*bytes).map_err(|_| parser.error("negative global size"))?;

                items.globals.insert(
                    name.clone(),
                    GlobalInfo {
                        mangled_name: mangled_name.clone(),
                        bytes,
                    },
                );
            }
            [
                T::OpenParen,
                T::Identifier(header),
                T::CloseParen,
                T::Identifier(name),
                T::Colon,
                T::StringLiteral(value),
            ] if header == "string" => items.string_literals.push(StringLiteral {
                name: name.clone(),
                value: value.clone(),
            }),
            [
                T::OpenParen,
                T::Identifier(header),
                T::CloseParen,
                T::Identifier(name),
                T::OpenParen,
                rest @ ..,
                T::Colon,
            ] if header == "function" => {
                let arguments = parser.register_list(rest)?;
                items
                    .functions
                    .push(Function::new(name.clone(), arguments, vec![]));
            }
            _ => return Err(parser.error("expected a (global), (string) or (function) header")),
        }
    }

    Ok(items)
}

/// Parses a sequence of functions with no globals or string literals, as used
/// for runtime library sources.
pub fn parse_functions(text: &str) -> Result<Vec<Function>, ParseError> {
    let items = parse_items(text)?;

    if let Some((name, _)) = items.globals.first_key_value() {
        return Err(ParseError {
            line: 1,
            column: 1,
            message: format!("unexpected global '{name}' in a function listing"),
        });
    }

    Ok(items.functions)
}

pub fn parse_program(text: &str) -> Result<Program, ParseError> {
    let mut items = parse_items(text)?;

    let Some(main_index) = items.functions.iter().position(|f| f.name == "main") else {
        return Err(ParseError {
            line: text.lines().count().max(1),
            column: 1,
            message: "program has no main function".into(),
        });
    };

    let main = items.functions.remove(main_index);

    Ok(Program {
        globals: items.globals,
        functions: items.functions,
        main,
        string_literals: items.string_literals,
    })
}
