use colored::Colorize;
use itertools::Itertools;

use crate::middle::tac::{
    Function, Program, Register, StackLocation, Statement, StatementKind, SyscallArgument,
};

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("r:{}", self.name()).yellow())
    }
}

impl core::fmt::Display for StackLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackLocation::Spill(slot) => write!(f, "{}[spill {slot}]", "stack".cyan()),
            StackLocation::Argument(index) => write!(f, "{}[argument {index}]", "stack".cyan()),
        }
    }
}

impl core::fmt::Display for SyscallArgument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyscallArgument::Register(register) => write!(f, "{register}"),
            SyscallArgument::Immediate(value) => write!(f, "{}", value.to_string().purple()),
        }
    }
}

fn write_call_destination(
    f: &mut std::fmt::Formatter<'_>,
    destination: &Option<Register>,
) -> std::fmt::Result {
    match destination {
        Some(destination) => write!(f, "{destination} {} ", "=".white()),
        None => Ok(()),
    }
}

fn offset_address(address: &Register, offset: i64) -> String {
    format!("*({address} + {})", offset.to_string().purple())
}

impl core::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let eq = "=".white();

        match self {
            StatementKind::Empty => Ok(()),
            StatementKind::Move { from, to } => write!(f, "{to} {eq} {from}"),
            StatementKind::LoadImmediate { value, destination } => {
                write!(f, "{destination} {eq} {}", value.to_string().purple())
            }
            StatementKind::AddImmediate { register, amount } => {
                write!(f, "{register} {} {}", "+=".white(), amount.to_string().purple())
            }
            StatementKind::Add {
                lhs,
                rhs,
                destination,
            } => write!(f, "{destination} {eq} {lhs} {} {rhs}", "+".white()),
            StatementKind::Subtract {
                lhs,
                rhs,
                destination,
            } => write!(f, "{destination} {eq} {lhs} {} {rhs}", "-".white()),
            StatementKind::Multiply {
                lhs,
                rhs,
                destination,
            } => write!(f, "{destination} {eq} {lhs} {} {rhs}", "*".white()),
            StatementKind::Increment { register } => write!(f, "{register}{}", "++".white()),
            StatementKind::Label { name } => write!(f, "{}", format!("{name}:").bright_red()),
            StatementKind::FunctionLabel { name } => {
                write!(f, "{} {}", "fn".magenta(), format!("{name}:").blue())
            }
            StatementKind::Goto { label } => write!(f, "{} {}", "goto".cyan(), label.bright_red()),
            StatementKind::GotoIfEqual { lhs, rhs, label } => write!(
                f,
                "{} {} {} {lhs} {} {rhs}",
                "goto".cyan(),
                label.bright_red(),
                "if".cyan(),
                "==".white()
            ),
            StatementKind::GotoIfNotEqual { lhs, rhs, label } => write!(
                f,
                "{} {} {} {lhs} {} {rhs}",
                "goto".cyan(),
                label.bright_red(),
                "if".cyan(),
                "!=".white()
            ),
            StatementKind::GotoIfZero { register, label } => write!(
                f,
                "{} {} {} {register} {} {}",
                "goto".cyan(),
                label.bright_red(),
                "if".cyan(),
                "==".white(),
                "0".purple()
            ),
            StatementKind::GotoIfGreater { lhs, rhs, label } => write!(
                f,
                "{} {} {} {lhs} {} {rhs}",
                "goto".cyan(),
                label.bright_red(),
                "if".cyan(),
                ">".white()
            ),
            StatementKind::LoadGlobal { from, to } => write!(f, "{to} {eq} *{}", from.green()),
            StatementKind::StoreGlobal { from, to } => write!(f, "*{} {eq} {from}", to.green()),
            StatementKind::LoadMemory { from, to, offset } => {
                write!(f, "{to} {eq} {}", offset_address(from, *offset))
            }
            StatementKind::StoreMemory {
                from,
                address,
                offset,
            } => write!(f, "{} {eq} {from}", offset_address(address, *offset)),
            StatementKind::LoadMemoryByte { address, to } => write!(f, "{to} {eq} *{address}"),
            StatementKind::StoreMemoryByte { address, contents } => {
                write!(f, "*{address} {eq} {contents}")
            }
            StatementKind::StoreZeroToMemory { address, offset } => {
                write!(f, "{} {eq} {}", offset_address(address, *offset), "0".purple())
            }
            StatementKind::LoadSymbolAddress { symbol_name, to } => {
                write!(f, "{to} {eq} &{}", symbol_name.green())
            }
            StatementKind::Alloca { bytes, register } => write!(
                f,
                "{register} {eq} {}({})",
                "alloca".cyan(),
                bytes.to_string().purple()
            ),
            StatementKind::CallByName {
                function,
                arguments,
                destination,
            } => {
                write_call_destination(f, destination)?;
                write!(
                    f,
                    "{}({})",
                    function.blue(),
                    arguments.iter().map(|a| a.to_string()).join(", ")
                )
            }
            StatementKind::CallByRegister {
                function,
                arguments,
                destination,
            } => {
                write_call_destination(f, destination)?;
                write!(
                    f,
                    "{function}({})",
                    arguments.iter().map(|a| a.to_string()).join(", ")
                )
            }
            StatementKind::Return { register } => match register {
                Some(register) => write!(f, "{} {register}", "return".cyan()),
                None => write!(f, "{}", "return".cyan()),
            },
            StatementKind::Syscall {
                name,
                arguments,
                destination,
            } => {
                write_call_destination(f, destination)?;
                write!(f, "{} {}", "syscall".cyan(), name.to_string().blue())?;

                for argument in arguments {
                    write!(f, " {argument}")?;
                }

                Ok(())
            }
            StatementKind::StackLoad { location, to } => write!(f, "{to} {eq} {location}"),
            StatementKind::StackStore { from, location } => write!(f, "{location} {eq} {from}"),
        }
    }
}

impl core::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.kind == StatementKind::Empty {
            return if self.why.is_empty() {
                write!(f, "{}", ";".bright_black())
            } else {
                write!(f, "{}", format!("; {}", self.why).bright_black())
            };
        }

        write!(f, "{}", self.kind)?;

        if !self.why.is_empty() {
            write!(f, "{}", format!("; {}", self.why).bright_black())?;
        }

        Ok(())
    }
}

impl core::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} {}({}):",
            "(function)".magenta(),
            self.name.blue(),
            self.arguments.iter().map(|a| a.to_string()).join(", ")
        )?;

        for instruction in &self.instructions {
            writeln!(f, "    {instruction}")?;
        }

        Ok(())
    }
}

/// Escapes a string literal so the parser can read it back
pub fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);

    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\0' => escaped.push_str("\\0"),
            c if c.is_ascii_control() => escaped.push_str(&format!("\\x{:02x}", c as u32)),
            c => escaped.push(c),
        }
    }

    escaped
}

impl core::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, global) in &self.globals {
            writeln!(
                f,
                "{} {}: {} {}",
                "(global)".magenta(),
                name,
                global.mangled_name.green(),
                global.bytes.to_string().purple()
            )?;
        }

        for literal in &self.string_literals {
            writeln!(
                f,
                "{} {}: {}",
                "(string)".magenta(),
                literal.name.green(),
                format!("\"{}\"", escape_string(&literal.value)).bright_green()
            )?;
        }

        for function in self.functions.iter().chain(std::iter::once(&self.main)) {
            writeln!(f)?;
            write!(f, "{function}")?;
        }

        Ok(())
    }
}

/// Renders a displayable value without any terminal colors. This is the
/// form the TAC parser accepts.
pub fn to_plain_text(value: &impl core::fmt::Display) -> String {
    strip_ansi_escapes::strip_str(value.to_string())
}

pub fn pretty_print_program(program: &Program) {
    print!("{program}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::tac::SyscallName;

    fn r(name: &str) -> Register {
        Register::new(name)
    }

    fn plain(kind: StatementKind, why: &str) -> String {
        to_plain_text(&Statement::new(kind, why))
    }

    #[test]
    fn arithmetic_renders_as_assignments() {
        assert_eq!(
            plain(
                StatementKind::Add {
                    lhs: r("a"),
                    rhs: r("b"),
                    destination: r("x"),
                },
                "sum"
            ),
            "r:x = r:a + r:b; sum"
        );
        assert_eq!(
            plain(
                StatementKind::AddImmediate {
                    register: r("p"),
                    amount: -24,
                },
                ""
            ),
            "r:p += -24"
        );
    }

    #[test]
    fn memory_and_calls_render_with_explicit_operands() {
        assert_eq!(
            plain(
                StatementKind::StoreMemory {
                    from: r("v"),
                    address: r("a"),
                    offset: 8,
                },
                ""
            ),
            "*(r:a + 8) = r:v"
        );
        assert_eq!(
            plain(
                StatementKind::CallByName {
                    function: "my_malloc".into(),
                    arguments: vec![r("n")],
                    destination: Some(r("buffer")),
                },
                "allocate"
            ),
            "r:buffer = my_malloc(r:n); allocate"
        );
        assert_eq!(
            plain(
                StatementKind::Syscall {
                    name: SyscallName::Exit,
                    arguments: vec![SyscallArgument::Immediate(-1)],
                    destination: None,
                },
                ""
            ),
            "syscall exit -1"
        );
    }

    #[test]
    fn comments_keep_their_marker() {
        assert_eq!(plain(StatementKind::Empty, "note"), "; note");
        assert_eq!(plain(StatementKind::Empty, ""), ";");
    }

    #[test]
    fn escaping_covers_quotes_and_control_characters() {
        assert_eq!(escape_string("a\"b\\c\n\u{1}"), "a\\\"b\\\\c\\n\\x01");
    }
}
